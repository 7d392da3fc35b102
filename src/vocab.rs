#[cfg(feature = "bincode")]
use bincode;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

use crate::descriptor::l2_squared;
use crate::*;

/// Upper bound on the k-means iterations of one node during training.
const MAX_KMEANS_ITERATIONS: usize = 50;

/// Node ids visited while quantizing one descriptor, root excluded, one per
/// level. The last entry is the leaf.
pub type NodePath = SmallVec<[u32; 8]>;

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Hierarchical quantizer mapping descriptors to visual words. Can be:
/// 1. Trained from a collection of descriptors, or assembled from centers
///    trained elsewhere.
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Used to quantize descriptors into words and whole sets into histograms.
///
/// Nodes live in one arena; the children of a node occupy a contiguous range
/// of it. Node 0 is the root and has no center.
pub struct VocabularyTree {
    desc_type: DescriptorType,
    k: usize,
    levels: usize,
    nodes: Vec<Node>,
    /// Node centers, `desc_type.dim()` components per node.
    centers: Vec<f32>,
    num_words: usize,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
struct Node {
    first_child: u32,
    num_children: u32,
    word: Option<WordId>,
    /// Training descriptors assigned to the node (0 when unknown).
    cluster_size: u32,
}

impl Node {
    fn new(cluster_size: u32) -> Self {
        Self {
            first_child: 0,
            num_children: 0,
            word: None,
            cluster_size,
        }
    }
}

/// Vocabulary API
impl VocabularyTree {
    /// Visual word of `desc`: descend from the root to the nearest child
    /// center until a leaf is reached. Ties go to the lowest child.
    pub fn quantize(&self, desc: &[f32]) -> LocResult<WordId> {
        self.check_dim(desc.len())?;
        Ok(self.descend(desc, |_| ()))
    }

    /// Like [`quantize`](Self::quantize), also returning the node reached at
    /// every level (the "direct index" of the descriptor).
    pub fn quantize_path(&self, desc: &[f32]) -> LocResult<(WordId, NodePath)> {
        self.check_dim(desc.len())?;
        let mut path = NodePath::new();
        let word = self.descend(desc, |node| path.push(node));
        Ok((word, path))
    }

    /// Word count histogram of a descriptor set.
    pub fn histogram(&self, set: &DescriptorSet) -> LocResult<WordHistogram> {
        self.check_type(set.desc_type())?;
        Ok(set.iter().map(|desc| self.descend(desc, |_| ())).collect())
    }

    /// Word count histogram of a descriptor set, with the node path of every
    /// descriptor (in set order).
    pub fn transform_with_direct_idx(
        &self,
        set: &DescriptorSet,
    ) -> LocResult<(WordHistogram, Vec<NodePath>)> {
        self.check_type(set.desc_type())?;
        let mut histogram = WordHistogram::new();
        let mut direct_idx = Vec::with_capacity(set.len());
        for desc in set.iter() {
            let mut path = NodePath::new();
            histogram.add(self.descend(desc, |node| path.push(node)), 1.);
            direct_idx.push(path);
        }
        Ok((histogram, direct_idx))
    }

    /// Train a vocabulary by hierarchical k-means.
    ///
    /// Args: (k: Branching factor, levels: Max number of levels, seed: k-means initialization)
    pub fn train(
        features: &DescriptorSet,
        k: usize,
        levels: usize,
        seed: u64,
    ) -> LocResult<Self> {
        if features.is_empty() {
            return Err(LocErr::EmptyTrainingSet);
        }
        if k < 2 || levels == 0 {
            return Err(LocErr::InvalidConfig(format!(
                "vocabulary needs k >= 2 and at least one level, got k={} levels={}",
                k, levels
            )));
        }
        let mut v = Self::empty(features.desc_type(), k, levels);
        v.nodes[0].cluster_size = features.len() as u32;
        let mut rng = StdRng::seed_from_u64(seed);

        // Breadth-first so that word ids follow tree order
        let mut queue = VecDeque::new();
        queue.push_back((0u32, (0..features.len() as u32).collect::<Vec<_>>(), 0usize));
        while let Some((id, members, level)) = queue.pop_front() {
            if level == levels || (level > 0 && members.len() <= 1) {
                v.nodes[id as usize].word = Some(v.num_words as WordId);
                v.num_words += 1;
                continue;
            }
            debug!(node = id, features = members.len(), level, "k-means step");

            let clusters = v.cluster(features, &members, &mut rng);
            let first = v.nodes.len() as u32;
            v.nodes[id as usize].first_child = first;
            v.nodes[id as usize].num_children = clusters.len() as u32;
            for (offset, (center, group)) in clusters.into_iter().enumerate() {
                v.nodes.push(Node::new(group.len() as u32));
                v.centers.extend_from_slice(&center);
                queue.push_back((first + offset as u32, group, level + 1));
            }
        }

        info!(
            words = v.num_words,
            nodes = v.nodes.len(),
            k,
            levels,
            "trained vocabulary"
        );
        Ok(v)
    }

    /// Assemble a complete tree from centers trained elsewhere.
    ///
    /// `centers` lists every non-root node breadth-first: the `k` children of
    /// the root, then their `k²` children, and so on down to the `k^levels`
    /// leaves, which become words `0..k^levels` in that order.
    pub fn from_centers(centers: &DescriptorSet, k: usize, levels: usize) -> LocResult<Self> {
        if k < 2 || levels == 0 {
            return Err(LocErr::InvalidConfig(format!(
                "vocabulary needs k >= 2 and at least one level, got k={} levels={}",
                k, levels
            )));
        }
        let expected: usize = (1..=levels as u32).map(|l| k.pow(l)).sum();
        if centers.len() != expected {
            return Err(LocErr::InvalidConfig(format!(
                "a complete tree with k={} and {} levels has {} centers, got {}",
                k,
                levels,
                expected,
                centers.len()
            )));
        }
        let num_leaves = k.pow(levels as u32);
        let first_leaf = expected + 1 - num_leaves;

        let mut v = Self::empty(centers.desc_type(), k, levels);
        for desc in centers.iter() {
            v.centers.extend_from_slice(desc);
        }
        for id in 0..=expected {
            if id < first_leaf {
                v.nodes[id].first_child = (id * k + 1) as u32;
                v.nodes[id].num_children = k as u32;
            } else {
                v.nodes[id].word = Some((id - first_leaf) as WordId);
            }
            if id < expected {
                v.nodes.push(Node::new(0));
            }
        }
        v.num_words = num_leaves;
        Ok(v)
    }

    pub fn desc_type(&self) -> DescriptorType {
        self.desc_type
    }

    /// Number of visual words (leaves).
    pub fn num_words(&self) -> usize {
        self.num_words
    }

    /// Number of nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// (branching factor, levels)
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.levels)
    }

    /// Load a vocabulary from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> LocResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }

    /// Save vocabulary to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> LocResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl VocabularyTree {
    fn empty(desc_type: DescriptorType, k: usize, levels: usize) -> Self {
        Self {
            desc_type,
            k,
            levels,
            nodes: vec![Node::new(0)],
            centers: vec![0.; desc_type.dim()],
            num_words: 0,
        }
    }

    fn check_dim(&self, len: usize) -> LocResult<()> {
        if len != self.desc_type.dim() {
            return Err(LocErr::DimensionMismatch {
                expected: self.desc_type.dim(),
                found: len,
            });
        }
        Ok(())
    }

    fn check_type(&self, found: DescriptorType) -> LocResult<()> {
        if found != self.desc_type {
            return Err(LocErr::DescriptorTypeMismatch {
                expected: self.desc_type,
                found,
            });
        }
        Ok(())
    }

    #[inline]
    fn center(&self, node: usize) -> &[f32] {
        let dim = self.desc_type.dim();
        &self.centers[node * dim..(node + 1) * dim]
    }

    /// Walk to the leaf of `desc`, reporting every visited node but the root.
    fn descend<F: FnMut(u32)>(&self, desc: &[f32], mut visit: F) -> WordId {
        let mut node = &self.nodes[0];
        loop {
            if let Some(word) = node.word {
                return word;
            }
            let first = node.first_child as usize;
            let mut best: (f32, usize) = (f32::INFINITY, first);
            for child in first..first + node.num_children as usize {
                let d = l2_squared(desc, self.center(child));
                if d < best.0 {
                    best = (d, child);
                }
            }
            visit(best.1 as u32);
            node = &self.nodes[best.1];
        }
    }

    /// Split `members` into at most k clusters. Returns (center, members) of
    /// every non-empty cluster.
    fn cluster(
        &self,
        features: &DescriptorSet,
        members: &[u32],
        rng: &mut StdRng,
    ) -> Vec<(Vec<f32>, Vec<u32>)> {
        if members.len() <= self.k {
            // Only one feature per cluster
            return members
                .iter()
                .map(|&i| (features.get(i as usize).to_vec(), vec![i]))
                .collect();
        }

        let mut clusters = self.initialize_clusters(features, members, rng);
        let mut groups: Vec<Vec<u32>> = vec![Vec::new(); self.k];
        for _ in 0..MAX_KMEANS_ITERATIONS {
            let mut new_groups: Vec<Vec<u32>> = vec![Vec::new(); self.k];
            for &i in members {
                let f = features.get(i as usize);
                let mut best: (usize, f32) = (0, f32::INFINITY);
                for (j, c) in clusters.iter().enumerate() {
                    let d = l2_squared(c, f);
                    if d < best.1 {
                        best = (j, d);
                    }
                }
                new_groups[best.0].push(i);
            }

            if groups == new_groups {
                break; // converged
            }

            // update clusters, empty ones keep their center
            for (c, group) in clusters.iter_mut().zip(&new_groups) {
                if !group.is_empty() {
                    *c = Self::desc_mean(features, group);
                }
            }
            groups = new_groups;
        }

        clusters
            .into_iter()
            .zip(groups)
            .filter(|(_, g)| !g.is_empty())
            .collect()
    }

    /// Initialize clusters for kmeans with k distinct random members.
    fn initialize_clusters(
        &self,
        features: &DescriptorSet,
        members: &[u32],
        rng: &mut StdRng,
    ) -> Vec<Vec<f32>> {
        members
            .choose_multiple(rng, self.k)
            .map(|&i| features.get(i as usize).to_vec())
            .collect()
    }

    #[inline]
    /// Compute the mean of a group of descriptors.
    fn desc_mean(features: &DescriptorSet, group: &[u32]) -> Vec<f32> {
        let mut mean = vec![0.; features.dim()];
        for &i in group {
            for (m, &x) in mean.iter_mut().zip(features.get(i as usize)) {
                *m += x;
            }
        }
        let inv = 1. / group.len() as f32;
        mean.iter_mut().for_each(|m| *m *= inv);
        mean
    }
}

impl fmt::Debug for VocabularyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clust_sizes: Vec<u32> = self
            .nodes
            .iter()
            .filter(|n| n.word.is_some())
            .map(|n| n.cluster_size)
            .collect();
        let sum = clust_sizes.iter().map(|&c| c as usize).sum::<usize>();
        f.debug_struct("VocabularyTree")
            .field("Descriptor Type", &self.desc_type)
            .field("Word/Leaf Nodes", &self.num_words)
            .field("Other Nodes", &(self.nodes.len() - self.num_words))
            .field("Levels", &self.levels)
            .field("Branching Factor", &self.k)
            .field("Total Training Features", &sum)
            .field("Min Word Cluster Size", &clust_sizes.iter().min())
            .field("Max Word Cluster Size", &clust_sizes.iter().max())
            .finish()
    }
}
