use serde::{Deserialize, Serialize};

use crate::*;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Settings of the pairwise matchers.
pub struct MatcherConfig {
    pub matcher_type: MatcherType,
    /// Lowe's distance ratio. A match is kept when the nearest distance is
    /// below `ratio` times the second nearest one.
    pub ratio: f32,
    /// Run comparisons of one reference view on the rayon pool, when the
    /// strategy allows it.
    pub parallel: bool,
    /// Seed of the randomized strategies.
    pub seed: u64,
    /// Number of randomized kd-trees.
    pub kd_trees: usize,
    /// Maximum descriptors per kd-tree leaf.
    pub kd_leaf_size: usize,
    /// Reference descriptors examined per query before the kd search stops.
    pub kd_max_checks: usize,
    /// Number of primary hash tables of the cascade hasher.
    pub hash_tables: usize,
    /// Bits per primary hash bucket id (at most 16).
    pub hash_bucket_bits: usize,
    /// Candidates re-ranked by exact distance after Hamming ranking.
    pub hash_candidates: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            matcher_type: MatcherType::default(),
            ratio: 0.8,
            parallel: true,
            seed: 5489,
            kd_trees: 4,
            kd_leaf_size: 8,
            kd_max_checks: 256,
            hash_tables: 6,
            hash_bucket_bits: 8,
            hash_candidates: 10,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> LocResult<()> {
        if !(self.ratio > 0. && self.ratio <= 1.) {
            return Err(LocErr::InvalidConfig(format!(
                "distance ratio must be in (0, 1], got {}",
                self.ratio
            )));
        }
        if self.kd_trees == 0 || self.kd_leaf_size == 0 || self.kd_max_checks == 0 {
            return Err(LocErr::InvalidConfig(
                "kd-forest trees, leaf size and checks must be positive".to_string(),
            ));
        }
        if self.hash_tables == 0 || self.hash_candidates == 0 {
            return Err(LocErr::InvalidConfig(
                "cascade hashing tables and candidates must be positive".to_string(),
            ));
        }
        if self.hash_bucket_bits == 0 || self.hash_bucket_bits > 16 {
            return Err(LocErr::InvalidConfig(format!(
                "hash bucket bits must be in 1..=16, got {}",
                self.hash_bucket_bits
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Settings of a [`Localizer`].
pub struct LocalizerConfig {
    pub matcher: MatcherConfig,
    /// Documents returned by the retrieval step.
    pub top_k: usize,
    /// Retrieved candidates matched against the query at most.
    pub max_candidates: usize,
    /// Correspondences required before resection. The solver's own minimum
    /// acts as a floor.
    pub min_correspondences: usize,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            top_k: 20,
            max_candidates: 10,
            min_correspondences: 30,
        }
    }
}

impl LocalizerConfig {
    pub fn validate(&self) -> LocResult<()> {
        self.matcher.validate()?;
        if self.top_k == 0 || self.max_candidates == 0 {
            return Err(LocErr::InvalidConfig(
                "top_k and max_candidates must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(MatcherConfig::default().validate().is_ok());
        assert!(LocalizerConfig::default().validate().is_ok());
        assert_eq!(MatcherConfig::default().ratio, 0.8);
    }

    #[test]
    fn test_invalid_values() {
        let bad_ratio = MatcherConfig {
            ratio: 1.5,
            ..MatcherConfig::default()
        };
        assert!(matches!(bad_ratio.validate(), Err(LocErr::InvalidConfig(_))));

        let bad_bits = MatcherConfig {
            hash_bucket_bits: 32,
            ..MatcherConfig::default()
        };
        assert!(bad_bits.validate().is_err());

        let bad_k = LocalizerConfig {
            top_k: 0,
            ..LocalizerConfig::default()
        };
        assert!(bad_k.validate().is_err());
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn test_config_serializes() {
        let config = LocalizerConfig {
            top_k: 5,
            ..LocalizerConfig::default()
        };
        let bytes = bincode::serialize(&config).unwrap();
        let back: LocalizerConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(config, back);
    }
}
