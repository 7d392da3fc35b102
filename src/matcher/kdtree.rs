use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use super::{ensure_not_empty, Best2, NearestNeighbor, Neighbors};
use crate::descriptor::l2_squared;
use crate::*;

/// Descriptors sampled to estimate per-dimension variance at each split.
const VARIANCE_SAMPLE: usize = 100;
/// The split dimension is drawn among this many highest-variance dimensions.
const RANDOM_DIMS: usize = 5;

/// Approximate matcher over a forest of randomized kd-trees, searched
/// best-bin-first across all trees with a bounded number of checks.
pub struct KdForest<'a> {
    reference: &'a DescriptorSet,
    trees: Vec<KdTree>,
    max_checks: usize,
}

#[derive(Debug, Clone, Copy)]
enum KdNode {
    /// Range into the tree's `indices`.
    Leaf { start: u32, end: u32 },
    Split {
        dim: u32,
        value: f32,
        left: u32,
        right: u32,
    },
}

struct KdTree {
    nodes: Vec<KdNode>,
    indices: Vec<u32>,
}

/// Unexplored subtree waiting in the best-bin-first queue.
#[derive(Debug, Clone, Copy)]
struct Branch {
    bound: f32,
    tree: u32,
    node: u32,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Branch {}

impl PartialOrd for Branch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Branch {
    // Reversed: the heap pops the smallest bound first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .bound
            .total_cmp(&self.bound)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl<'a> NearestNeighbor<'a> for KdForest<'a> {
    fn build(reference: &'a DescriptorSet, config: &MatcherConfig) -> LocResult<Self> {
        ensure_not_empty(reference)?;
        if config.kd_trees == 0 || config.kd_leaf_size == 0 || config.kd_max_checks == 0 {
            return Err(LocErr::InvalidConfig(
                "kd-forest trees, leaf size and checks must be positive".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let trees = (0..config.kd_trees)
            .map(|_| KdTree::build(reference, config.kd_leaf_size, &mut rng))
            .collect();
        Ok(Self {
            reference,
            trees,
            max_checks: config.kd_max_checks,
        })
    }

    fn reference(&self) -> &'a DescriptorSet {
        self.reference
    }

    fn nearest2(&self, query: &[f32]) -> Option<Neighbors> {
        self.search(query).best.finish()
    }
}

struct Search {
    best: Best2,
    /// Reference indices already offered; grows with the checks only.
    visited: HashSet<u32>,
    heap: BinaryHeap<Branch>,
    checks: usize,
}

impl<'a> KdForest<'a> {
    fn search(&self, query: &[f32]) -> Search {
        let mut search = Search {
            best: Best2::new(),
            visited: HashSet::with_capacity(self.max_checks.min(self.reference.len())),
            heap: BinaryHeap::new(),
            checks: 0,
        };

        // One full descent per tree, then resume from the closest branches.
        for t in 0..self.trees.len() {
            self.descend(&mut search, query, t as u32, 0, 0.);
        }
        while let Some(branch) = search.heap.pop() {
            if search.checks >= self.max_checks || branch.bound >= search.best.second_dist() {
                break;
            }
            self.descend(&mut search, query, branch.tree, branch.node, branch.bound);
        }
        search
    }

    fn descend(&self, search: &mut Search, query: &[f32], tree: u32, node: u32, bound: f32) {
        let kd = &self.trees[tree as usize];
        let mut node = node;
        loop {
            match kd.nodes[node as usize] {
                KdNode::Leaf { start, end } => {
                    for &i in &kd.indices[start as usize..end as usize] {
                        if !search.visited.insert(i) {
                            continue;
                        }
                        let i = i as usize;
                        search.checks += 1;
                        search.best.offer(i, l2_squared(query, self.reference.get(i)));
                    }
                    return;
                }
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let diff = query[dim as usize] - value;
                    let (near, far) = if diff < 0. { (left, right) } else { (right, left) };
                    let far_bound = bound.max(diff * diff);
                    if far_bound < search.best.second_dist() {
                        search.heap.push(Branch {
                            bound: far_bound,
                            tree,
                            node: far,
                        });
                    }
                    node = near;
                }
            }
        }
    }
}

impl KdTree {
    fn build(set: &DescriptorSet, leaf_size: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            indices: (0..set.len() as u32).collect(),
        };
        tree.build_node(set, 0, set.len(), leaf_size, rng);
        tree
    }

    /// Build the subtree over `indices[start..end]`, returning its node id.
    fn build_node(
        &mut self,
        set: &DescriptorSet,
        start: usize,
        end: usize,
        leaf_size: usize,
        rng: &mut StdRng,
    ) -> u32 {
        let id = self.nodes.len() as u32;
        let leaf = KdNode::Leaf {
            start: start as u32,
            end: end as u32,
        };
        if end - start <= leaf_size {
            self.nodes.push(leaf);
            return id;
        }

        let (dim, value) = Self::choose_split(set, &self.indices[start..end], rng);
        let slice = &mut self.indices[start..end];
        let mut mid = 0;
        for k in 0..slice.len() {
            if set.get(slice[k] as usize)[dim] < value {
                slice.swap(k, mid);
                mid += 1;
            }
        }
        if mid == 0 || mid == slice.len() {
            // All sampled values equal along the chosen dimension.
            self.nodes.push(leaf);
            return id;
        }

        self.nodes.push(KdNode::Split {
            dim: dim as u32,
            value,
            left: id + 1,
            right: 0,
        });
        self.build_node(set, start, start + mid, leaf_size, rng);
        let right_id = self.build_node(set, start + mid, end, leaf_size, rng);
        if let KdNode::Split { right, .. } = &mut self.nodes[id as usize] {
            *right = right_id;
        }
        id
    }

    /// Split at the mean of a dimension drawn among the highest-variance ones.
    fn choose_split(set: &DescriptorSet, indices: &[u32], rng: &mut StdRng) -> (usize, f32) {
        let dim = set.dim();
        let sample = &indices[..indices.len().min(VARIANCE_SAMPLE)];
        let n = sample.len() as f32;

        let mut mean = vec![0f32; dim];
        for &i in sample {
            for (m, &x) in mean.iter_mut().zip(set.get(i as usize)) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut var = vec![0f32; dim];
        for &i in sample {
            for ((v, &m), &x) in var.iter_mut().zip(&mean).zip(set.get(i as usize)) {
                *v += (x - m) * (x - m);
            }
        }

        let mut dims: Vec<usize> = (0..dim).collect();
        dims.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
        let d = dims[rng.gen_range(0..RANDOM_DIMS.min(dim))];
        (d, mean[d])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::brute_force::BruteForceMatcher;
    use crate::matcher::tests::{config, random_set};

    #[test]
    fn test_leaves_cover_every_descriptor_once() {
        let set = random_set(200, 11);
        let mut rng = StdRng::seed_from_u64(1);
        let tree = KdTree::build(&set, 8, &mut rng);
        let mut seen = vec![0; set.len()];
        for node in &tree.nodes {
            if let KdNode::Leaf { start, end } = *node {
                assert!(end - start <= 8);
                for &i in &tree.indices[start as usize..end as usize] {
                    seen[i as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_exhaustive_checks_are_exact() {
        let reference = random_set(120, 5);
        let queries = random_set(40, 6);
        let cfg = MatcherConfig {
            kd_max_checks: 10_000,
            ..config(MatcherType::AnnL2)
        };
        let forest = KdForest::build(&reference, &cfg).unwrap();
        let exact = BruteForceMatcher::build(&reference, &cfg).unwrap();
        for q in queries.iter() {
            let a = forest.nearest2(q).unwrap();
            let b = exact.nearest2(q).unwrap();
            assert_eq!(a.dist, b.dist);
            assert_eq!(a.second_dist, b.second_dist);
        }
    }

    #[test]
    fn test_same_seed_same_answers() {
        let reference = random_set(500, 21);
        let queries = random_set(50, 22);
        let cfg = MatcherConfig {
            kd_max_checks: 32,
            ..config(MatcherType::AnnL2)
        };
        let a = KdForest::build(&reference, &cfg).unwrap();
        let b = KdForest::build(&reference, &cfg).unwrap();
        for q in queries.iter() {
            assert_eq!(a.nearest2(q), b.nearest2(q));
        }
    }

    #[test]
    fn test_search_work_is_bounded_by_checks() {
        let reference = random_set(4_000, 31);
        let queries = random_set(20, 32);
        let cfg = MatcherConfig {
            kd_max_checks: 32,
            ..config(MatcherType::AnnL2)
        };
        let forest = KdForest::build(&reference, &cfg).unwrap();
        // A descent stops at one leaf, so the last one may overshoot the budget
        let bound = cfg.kd_max_checks + cfg.kd_trees * cfg.kd_leaf_size;
        for q in queries.iter() {
            let search = forest.search(q);
            assert_eq!(search.visited.len(), search.checks);
            assert!(search.checks <= bound, "{} checks", search.checks);
            assert!(search.best.finish().is_some());
        }
    }

    #[test]
    fn test_identical_descriptors_stay_in_one_leaf() {
        let reference =
            DescriptorSet::from_rows(DescriptorType::Akaze, vec![vec![3.; 64]; 40]).unwrap();
        let forest = KdForest::build(&reference, &config(MatcherType::AnnL2)).unwrap();
        let n = forest.nearest2(&[3.; 64]).unwrap();
        assert_eq!(n.index, 0);
        assert_eq!(n.dist, 0.);
    }
}
