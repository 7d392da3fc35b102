use bitvec::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cell::RefCell;

use super::{ensure_not_empty, Best2, NearestNeighbor, Neighbors};
use crate::descriptor::l2_squared;
use crate::*;

/// Length of the secondary hash code used for Hamming ranking.
const CODE_BITS: usize = 128;

type HashCode = BitArray<[u64; 2], Lsb0>;

/// Approximate matcher using cascade hashing.
///
/// Descriptors are centered on the reference mean and projected on random
/// hyperplanes. The signs of a few projections give a bucket id in each of
/// several primary tables; every reference descriptor sharing a bucket with
/// the query is a candidate. Candidates are ranked by the Hamming distance
/// between 128-bit secondary codes and the closest ones are re-ranked by
/// exact distance.
///
/// Queries reuse a scratch buffer owned by the index, so an index must not be
/// shared across threads (`CascadeHasher` is not `Sync`).
pub struct CascadeHasher<'a> {
    reference: &'a DescriptorSet,
    mean: Vec<f32>,
    /// `tables × bucket_bits` projection vectors, flattened.
    primary: Vec<f32>,
    /// `CODE_BITS` projection vectors, flattened.
    secondary: Vec<f32>,
    bucket_bits: usize,
    /// Table -> bucket id -> reference indices.
    buckets: Vec<Vec<Vec<u32>>>,
    codes: Vec<HashCode>,
    max_candidates: usize,
    scratch: RefCell<Scratch>,
}

struct Scratch {
    /// Reference index -> query epoch in which it was last collected.
    stamp: Vec<u32>,
    epoch: u32,
    /// Hamming distance -> candidates at that distance.
    by_distance: Vec<Vec<u32>>,
}

impl<'a> NearestNeighbor<'a> for CascadeHasher<'a> {
    fn build(reference: &'a DescriptorSet, config: &MatcherConfig) -> LocResult<Self> {
        ensure_not_empty(reference)?;
        if config.hash_tables == 0 || config.hash_bucket_bits == 0 || config.hash_bucket_bits > 16
        {
            return Err(LocErr::InvalidConfig(format!(
                "cascade hashing needs at least one table and 1..=16 bucket bits, got {} and {}",
                config.hash_tables, config.hash_bucket_bits
            )));
        }
        let dim = reference.dim();
        let n = reference.len();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut mean = vec![0f32; dim];
        for desc in reference.iter() {
            for (m, &x) in mean.iter_mut().zip(desc) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n as f32);

        let primary = (0..config.hash_tables * config.hash_bucket_bits * dim)
            .map(|_| gaussian(&mut rng))
            .collect();
        let secondary = (0..CODE_BITS * dim).map(|_| gaussian(&mut rng)).collect();

        let mut hasher = Self {
            reference,
            mean,
            primary,
            secondary,
            bucket_bits: config.hash_bucket_bits,
            buckets: vec![vec![Vec::new(); 1 << config.hash_bucket_bits]; config.hash_tables],
            codes: Vec::with_capacity(n),
            max_candidates: config.hash_candidates.max(1),
            scratch: RefCell::new(Scratch {
                stamp: vec![0; n],
                epoch: 0,
                by_distance: vec![Vec::new(); CODE_BITS + 1],
            }),
        };

        let mut centered = vec![0f32; dim];
        for (i, desc) in reference.iter().enumerate() {
            hasher.center(desc, &mut centered);
            let code = hasher.code(&centered);
            hasher.codes.push(code);
            for t in 0..hasher.buckets.len() {
                let b = hasher.bucket(t, &centered);
                hasher.buckets[t][b].push(i as u32);
            }
        }
        Ok(hasher)
    }

    fn reference(&self) -> &'a DescriptorSet {
        self.reference
    }

    fn nearest2(&self, query: &[f32]) -> Option<Neighbors> {
        let mut centered = vec![0f32; self.mean.len()];
        self.center(query, &mut centered);
        let code = self.code(&centered);

        let mut scratch = self.scratch.borrow_mut();
        let Scratch {
            stamp,
            epoch,
            by_distance,
        } = &mut *scratch;
        *epoch = epoch.wrapping_add(1);
        if *epoch == 0 {
            stamp.iter_mut().for_each(|s| *s = 0);
            *epoch = 1;
        }
        by_distance.iter_mut().for_each(Vec::clear);

        for (t, table) in self.buckets.iter().enumerate() {
            for &i in &table[self.bucket(t, &centered)] {
                if stamp[i as usize] == *epoch {
                    continue;
                }
                stamp[i as usize] = *epoch;
                by_distance[hamming(&code, &self.codes[i as usize])].push(i);
            }
        }

        let mut best = Best2::new();
        let candidates = by_distance.iter().flatten().take(self.max_candidates);
        for &i in candidates {
            let i = i as usize;
            best.offer(i, l2_squared(query, self.reference.get(i)));
        }
        best.finish()
    }
}

impl<'a> CascadeHasher<'a> {
    fn center(&self, desc: &[f32], out: &mut [f32]) {
        for ((o, &x), &m) in out.iter_mut().zip(desc).zip(&self.mean) {
            *o = x - m;
        }
    }

    fn bucket(&self, table: usize, centered: &[f32]) -> usize {
        let dim = centered.len();
        let first = table * self.bucket_bits;
        (0..self.bucket_bits).fold(0, |id, b| {
            let row = &self.primary[(first + b) * dim..(first + b + 1) * dim];
            (id << 1) | (dot(row, centered) > 0.) as usize
        })
    }

    fn code(&self, centered: &[f32]) -> HashCode {
        let mut code = HashCode::ZERO;
        for (b, row) in self.secondary.chunks_exact(centered.len()).enumerate() {
            code.set(b, dot(row, centered) > 0.);
        }
        code
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn hamming(a: &HashCode, b: &HashCode) -> usize {
    a.as_raw_slice()
        .iter()
        .zip(b.as_raw_slice())
        .map(|(x, y)| (x ^ y).count_ones() as usize)
        .sum()
}

/// Standard normal sample (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2. * u1.ln()).sqrt() * (2. * std::f32::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::tests::{config, perturbed, random_set};

    #[test]
    fn test_hamming() {
        let mut a = HashCode::ZERO;
        let b = HashCode::ZERO;
        assert_eq!(hamming(&a, &b), 0);
        a.set(0, true);
        a.set(127, true);
        assert_eq!(hamming(&a, &b), 2);
    }

    #[test]
    fn test_every_reference_is_bucketed_in_every_table() {
        let reference = random_set(100, 2);
        let hasher = CascadeHasher::build(&reference, &config(MatcherType::CascadeHashingL2)).unwrap();
        for table in &hasher.buckets {
            assert_eq!(table.iter().map(Vec::len).sum::<usize>(), 100);
        }
        assert_eq!(hasher.codes.len(), 100);
    }

    #[test]
    fn test_finds_exact_copy() {
        let reference = random_set(200, 4);
        let hasher = CascadeHasher::build(&reference, &config(MatcherType::CascadeHashingL2)).unwrap();
        for (i, desc) in reference.iter().enumerate() {
            let n = hasher.nearest2(desc).unwrap();
            assert_eq!(n.index, i);
            assert_eq!(n.dist, 0.);
        }
    }

    #[test]
    fn test_repeated_queries_agree() {
        let reference = random_set(300, 9);
        let queries = perturbed(&reference, 10);
        let cfg = config(MatcherType::CascadeHashingL2);
        let a = CascadeHasher::build(&reference, &cfg).unwrap();
        let b = CascadeHasher::build(&reference, &cfg).unwrap();
        let first = a.match_set(0.8, &queries).unwrap();
        assert_eq!(first, a.match_set(0.8, &queries).unwrap());
        assert_eq!(first, b.match_set(0.8, &queries).unwrap());
    }

    #[test]
    fn test_single_reference() {
        let reference =
            DescriptorSet::from_rows(DescriptorType::Surf, vec![vec![0.5; 64]]).unwrap();
        let hasher = CascadeHasher::build(&reference, &config(MatcherType::CascadeHashingL2)).unwrap();
        let n = hasher.nearest2(&[0.5; 64]).unwrap();
        assert_eq!(n.index, 0);
        assert_eq!(n.second_dist, f32::INFINITY);
    }
}
