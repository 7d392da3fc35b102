use super::{ensure_not_empty, Best2, NearestNeighbor, Neighbors};
use crate::descriptor::l2_squared;
use crate::*;

/// Exact matcher comparing a query against every reference descriptor.
pub struct BruteForceMatcher<'a> {
    reference: &'a DescriptorSet,
}

impl<'a> NearestNeighbor<'a> for BruteForceMatcher<'a> {
    fn build(reference: &'a DescriptorSet, _config: &MatcherConfig) -> LocResult<Self> {
        ensure_not_empty(reference)?;
        Ok(Self { reference })
    }

    fn reference(&self) -> &'a DescriptorSet {
        self.reference
    }

    fn nearest2(&self, query: &[f32]) -> Option<Neighbors> {
        let mut best = Best2::new();
        for (i, desc) in self.reference.iter().enumerate() {
            best.offer(i, l2_squared(query, desc));
        }
        best.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::tests::{config, random_set};

    #[test]
    fn test_exact_nearest() {
        let reference =
            DescriptorSet::from_rows(DescriptorType::Surf, (0..5).map(|i| vec![i as f32; 64]))
                .unwrap();
        let m = BruteForceMatcher::build(&reference, &config(MatcherType::BruteForceL2)).unwrap();
        let n = m.nearest2(&[2.9; 64]).unwrap();
        assert_eq!(n.index, 3);
        assert!((n.dist - 64. * 0.01).abs() < 1e-3);
        assert!((n.second_dist - 64. * 0.81).abs() < 1e-2);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let reference =
            DescriptorSet::from_rows(DescriptorType::Surf, vec![vec![1.; 64], vec![1.; 64]])
                .unwrap();
        let m = BruteForceMatcher::build(&reference, &config(MatcherType::BruteForceL2)).unwrap();
        let n = m.nearest2(&[1.; 64]).unwrap();
        assert_eq!(n.index, 0);
        assert!(!n.passes_ratio(0.8));
    }

    #[test]
    fn test_matches_self() {
        let reference = random_set(50, 3);
        let m = BruteForceMatcher::build(&reference, &config(MatcherType::BruteForceL2)).unwrap();
        let matches = m.match_set(0.8, &reference).unwrap();
        assert_eq!(matches.len(), 50);
        assert!(matches.iter().all(|m| m.i == m.j));
    }
}
