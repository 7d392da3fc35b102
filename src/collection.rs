use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::matcher::NearestNeighbor;
use crate::*;

/// Ordered pair of views `(reference, compared)`.
pub type Pair = (ViewId, ViewId);

/// Requested comparisons. Pairs are never symmetrized.
pub type PairSet = BTreeSet<Pair>;

/// Putative matches of a collection.
///
/// Key: image pair. Value: descriptor type -> accepted correspondences, in the
/// descriptor order of the compared view. Pairs without any accepted
/// correspondence are absent.
pub type PairwiseMatches = BTreeMap<Pair, BTreeMap<DescriptorType, Vec<IndMatch>>>;

/// Every pair `(views[a], views[b])` with `a < b`.
pub fn exhaustive_pairs(views: &[ViewId]) -> PairSet {
    let mut pairs = PairSet::new();
    for (a, &i) in views.iter().enumerate() {
        for &j in &views[a + 1..] {
            pairs.insert((i, j));
        }
    }
    pairs
}

/// Sink for progress notifications. One unit per requested pair.
pub trait Progress: Sync {
    fn advance(&self, n: u64);
}

impl Progress for () {
    fn advance(&self, _n: u64) {}
}

#[derive(Debug, Default)]
/// Thread-safe progress counter.
pub struct AtomicProgress {
    done: AtomicU64,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }
}

impl Progress for AtomicProgress {
    fn advance(&self, n: u64) {
        self.done.fetch_add(n, Ordering::SeqCst);
    }
}

/// Computes putative matches for a set of image pairs, building one index per
/// reference view.
#[derive(Debug, Clone)]
pub struct CollectionMatcher {
    config: MatcherConfig,
}

impl CollectionMatcher {
    pub fn new(config: MatcherConfig) -> LocResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Match every pair of `pairs` on descriptors of type `desc_type`.
    ///
    /// Views without descriptors and pairs whose views hold different
    /// descriptor types are skipped. `progress` advances by one per pair,
    /// skipped or not.
    pub fn match_pairs<R, P>(
        &self,
        regions: &R,
        pairs: &PairSet,
        desc_type: DescriptorType,
        progress: &P,
    ) -> LocResult<PairwiseMatches>
    where
        R: RegionsProvider + ?Sized,
        P: Progress + ?Sized,
    {
        // Group by reference view so that each index is built once.
        let mut groups: BTreeMap<ViewId, Vec<ViewId>> = BTreeMap::new();
        for &(i, j) in pairs {
            groups.entry(i).or_default().push(j);
        }
        info!(
            pairs = pairs.len(),
            reference_views = groups.len(),
            matcher = ?self.config.matcher_type,
            "matching image collection"
        );

        let mut matches = PairwiseMatches::new();
        for (&i, to_compare) in &groups {
            let reference = match regions.descriptors(i, desc_type) {
                Some(set) if !set.is_empty() => set,
                _ => {
                    debug!(view = i, skipped = to_compare.len(), "reference view has no descriptors");
                    progress.advance(to_compare.len() as u64);
                    continue;
                }
            };

            let matcher = RegionsMatcher::build(&self.config, reference)?;
            let parallel = self.config.parallel && matcher.matcher_type().concurrent_queries();
            let slots = match &matcher {
                RegionsMatcher::BruteForce(m) => {
                    self.match_group(m, regions, to_compare, desc_type, progress, parallel)?
                }
                RegionsMatcher::Ann(m) => {
                    self.match_group(m, regions, to_compare, desc_type, progress, parallel)?
                }
                RegionsMatcher::CascadeHashing(m) => {
                    self.match_group_sequential(m, regions, to_compare, desc_type, progress)?
                }
            };

            for (&j, slot) in to_compare.iter().zip(slots) {
                if let Some(putatives) = slot {
                    matches.entry((i, j)).or_default().insert(desc_type, putatives);
                }
            }
        }
        info!(matched_pairs = matches.len(), "collection matching done");
        Ok(matches)
    }

    /// Compare one reference index against its group, one result slot per
    /// compared view.
    fn match_group<'a, M, R, P>(
        &self,
        matcher: &M,
        regions: &R,
        to_compare: &[ViewId],
        desc_type: DescriptorType,
        progress: &P,
        parallel: bool,
    ) -> LocResult<Vec<Option<Vec<IndMatch>>>>
    where
        M: NearestNeighbor<'a> + Sync,
        R: RegionsProvider + ?Sized,
        P: Progress + ?Sized,
    {
        if !parallel {
            return self.match_group_sequential(matcher, regions, to_compare, desc_type, progress);
        }
        to_compare
            .par_iter()
            .map(|&j| self.compare(matcher, regions, j, desc_type, progress))
            .collect()
    }

    fn match_group_sequential<'a, M, R, P>(
        &self,
        matcher: &M,
        regions: &R,
        to_compare: &[ViewId],
        desc_type: DescriptorType,
        progress: &P,
    ) -> LocResult<Vec<Option<Vec<IndMatch>>>>
    where
        M: NearestNeighbor<'a>,
        R: RegionsProvider + ?Sized,
        P: Progress + ?Sized,
    {
        to_compare
            .iter()
            .map(|&j| self.compare(matcher, regions, j, desc_type, progress))
            .collect()
    }

    fn compare<'a, M, R, P>(
        &self,
        matcher: &M,
        regions: &R,
        j: ViewId,
        desc_type: DescriptorType,
        progress: &P,
    ) -> LocResult<Option<Vec<IndMatch>>>
    where
        M: NearestNeighbor<'a>,
        R: RegionsProvider + ?Sized,
        P: Progress + ?Sized,
    {
        let result = match regions.descriptors(j, desc_type) {
            Some(set) if !set.is_empty() => {
                if set.desc_type() != matcher.reference().desc_type() {
                    debug!(view = j, found = ?set.desc_type(), "descriptor type differs from reference");
                    None
                } else {
                    let putatives = matcher.match_set(self.config.ratio, set)?;
                    Some(putatives).filter(|m| !m.is_empty())
                }
            }
            _ => None,
        };
        progress.advance(1);
        Ok(result)
    }
}
