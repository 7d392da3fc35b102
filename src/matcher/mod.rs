use serde::{Deserialize, Serialize};

use crate::*;

/// Exhaustive linear scan.
pub mod brute_force;
pub use brute_force::BruteForceMatcher;

/// Randomized kd-forest searched best-bin-first.
pub mod kdtree;
pub use kdtree::KdForest;

/// Cascade hashing: hash buckets, Hamming ranking, exact re-ranking.
pub mod cascade_hash;
pub use cascade_hash::CascadeHasher;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Nearest-neighbor strategy used to build putative matches.
pub enum MatcherType {
    /// Exact, O(N) per query.
    BruteForceL2,
    /// Approximate, randomized kd-forest. Deterministic for a fixed seed.
    AnnL2,
    /// Approximate, cascade hashing. Fastest on large reference sets.
    CascadeHashingL2,
}

impl MatcherType {
    /// Whether one built index may answer queries from several threads at once.
    ///
    /// The cascade hasher reuses a scratch buffer between queries, so its
    /// comparisons run on a single thread.
    pub fn concurrent_queries(self) -> bool {
        match self {
            MatcherType::BruteForceL2 | MatcherType::AnnL2 => true,
            MatcherType::CascadeHashingL2 => false,
        }
    }
}

impl Default for MatcherType {
    fn default() -> Self {
        MatcherType::AnnL2
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Putative correspondence: descriptor `i` of the reference view matches
/// descriptor `j` of the compared view.
pub struct IndMatch {
    pub i: u32,
    pub j: u32,
}

impl IndMatch {
    pub fn new(i: u32, j: u32) -> Self {
        Self { i, j }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Answer of a nearest-neighbor query. Distances are squared Euclidean; the
/// second distance is infinite when only one reference descriptor was seen.
pub struct Neighbors {
    pub index: usize,
    pub dist: f32,
    pub second_dist: f32,
}

impl Neighbors {
    /// Lowe's ratio test on squared distances.
    #[inline]
    pub fn passes_ratio(&self, ratio: f32) -> bool {
        self.dist < ratio * ratio * self.second_dist
    }
}

/// Running best and second best candidates of a query.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Best2 {
    index: usize,
    dist: f32,
    second_dist: f32,
}

impl Best2 {
    pub(crate) fn new() -> Self {
        Self {
            index: usize::MAX,
            dist: f32::INFINITY,
            second_dist: f32::INFINITY,
        }
    }

    /// Offer a candidate. Candidates must be offered at most once; on equal
    /// distance the one offered first is kept.
    #[inline]
    pub(crate) fn offer(&mut self, index: usize, dist: f32) {
        if dist < self.dist {
            self.second_dist = self.dist;
            self.dist = dist;
            self.index = index;
        } else if dist < self.second_dist {
            self.second_dist = dist;
        }
    }

    pub(crate) fn second_dist(&self) -> f32 {
        self.second_dist
    }

    pub(crate) fn finish(self) -> Option<Neighbors> {
        if self.index == usize::MAX {
            return None;
        }
        Some(Neighbors {
            index: self.index,
            dist: self.dist,
            second_dist: self.second_dist,
        })
    }
}

/// Index over one reference descriptor set answering nearest and second
/// nearest queries.
pub trait NearestNeighbor<'a>: Sized {
    /// Build the index. Fails if `reference` is empty.
    fn build(reference: &'a DescriptorSet, config: &MatcherConfig) -> LocResult<Self>;

    /// The descriptor set the index was built over.
    fn reference(&self) -> &'a DescriptorSet;

    /// Nearest and second nearest reference descriptors of `query`, or `None`
    /// if the strategy found no candidate at all.
    fn nearest2(&self, query: &[f32]) -> Option<Neighbors>;

    /// Match every descriptor of `query` and keep those passing the ratio test.
    /// Matches follow the order of `query`.
    fn match_set(&self, ratio: f32, query: &DescriptorSet) -> LocResult<Vec<IndMatch>> {
        let expected = self.reference().desc_type();
        if query.desc_type() != expected {
            return Err(LocErr::DescriptorTypeMismatch {
                expected,
                found: query.desc_type(),
            });
        }
        let mut matches = Vec::new();
        for (j, desc) in query.iter().enumerate() {
            if let Some(n) = self.nearest2(desc) {
                if n.passes_ratio(ratio) {
                    matches.push(IndMatch::new(n.index as u32, j as u32));
                }
            }
        }
        Ok(matches)
    }
}

pub(crate) fn ensure_not_empty(reference: &DescriptorSet) -> LocResult<()> {
    if reference.is_empty() {
        return Err(LocErr::EmptyReference(reference.desc_type()));
    }
    Ok(())
}

/// A built index of the configured strategy.
pub enum RegionsMatcher<'a> {
    BruteForce(BruteForceMatcher<'a>),
    Ann(KdForest<'a>),
    CascadeHashing(CascadeHasher<'a>),
}

impl<'a> RegionsMatcher<'a> {
    /// Build the strategy selected by `config.matcher_type` over `reference`.
    pub fn build(config: &MatcherConfig, reference: &'a DescriptorSet) -> LocResult<Self> {
        ensure_not_empty(reference)?;
        Ok(match config.matcher_type {
            MatcherType::BruteForceL2 => {
                RegionsMatcher::BruteForce(BruteForceMatcher::build(reference, config)?)
            }
            MatcherType::AnnL2 => RegionsMatcher::Ann(KdForest::build(reference, config)?),
            MatcherType::CascadeHashingL2 => {
                RegionsMatcher::CascadeHashing(CascadeHasher::build(reference, config)?)
            }
        })
    }

    pub fn matcher_type(&self) -> MatcherType {
        match self {
            RegionsMatcher::BruteForce(_) => MatcherType::BruteForceL2,
            RegionsMatcher::Ann(_) => MatcherType::AnnL2,
            RegionsMatcher::CascadeHashing(_) => MatcherType::CascadeHashingL2,
        }
    }

    pub fn desc_type(&self) -> DescriptorType {
        self.reference().desc_type()
    }

    pub fn reference(&self) -> &'a DescriptorSet {
        match self {
            RegionsMatcher::BruteForce(m) => m.reference(),
            RegionsMatcher::Ann(m) => m.reference(),
            RegionsMatcher::CascadeHashing(m) => m.reference(),
        }
    }

    pub fn nearest2(&self, query: &[f32]) -> Option<Neighbors> {
        match self {
            RegionsMatcher::BruteForce(m) => m.nearest2(query),
            RegionsMatcher::Ann(m) => m.nearest2(query),
            RegionsMatcher::CascadeHashing(m) => m.nearest2(query),
        }
    }

    pub fn match_set(&self, ratio: f32, query: &DescriptorSet) -> LocResult<Vec<IndMatch>> {
        match self {
            RegionsMatcher::BruteForce(m) => m.match_set(ratio, query),
            RegionsMatcher::Ann(m) => m.match_set(ratio, query),
            RegionsMatcher::CascadeHashing(m) => m.match_set(ratio, query),
        }
    }
}
