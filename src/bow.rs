use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::iter::FromIterator;

use crate::WordId;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
/// Bag-of-Words representation of an image or descriptor set.
///
/// Key: word/leaf id in the vocabulary. Value: total weight of that word in
/// the provided features (an occurrence count unless reweighted).
pub struct WordHistogram {
    words: BTreeMap<WordId, f32>,
}

impl WordHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `weight` to `word`.
    pub fn add(&mut self, word: WordId, weight: f32) {
        *self.words.entry(word).or_insert(0.) += weight;
    }

    pub fn get(&self, word: WordId) -> f32 {
        self.words.get(&word).copied().unwrap_or(0.)
    }

    /// Number of distinct words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// (word, weight) in increasing word order.
    pub fn iter(&self) -> impl Iterator<Item = (WordId, f32)> + '_ {
        self.words.iter().map(|(&w, &v)| (w, v))
    }

    /// Sum of all weights.
    pub fn total(&self) -> f32 {
        self.words.values().sum()
    }

    pub fn l1_norm(&self) -> f32 {
        self.words.values().map(|v| v.abs()).sum()
    }

    pub fn l2_norm(&self) -> f32 {
        self.words.values().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl FromIterator<WordId> for WordHistogram {
    /// Count occurrences of every word.
    fn from_iter<I: IntoIterator<Item = WordId>>(iter: I) -> Self {
        let mut h = Self::new();
        for w in iter {
            h.add(w, 1.);
        }
        h
    }
}

impl FromIterator<(WordId, f32)> for WordHistogram {
    fn from_iter<I: IntoIterator<Item = (WordId, f32)>>(iter: I) -> Self {
        let mut h = Self::new();
        for (w, v) in iter {
            h.add(w, v);
        }
        h
    }
}

/// Provides method(s) for computing the similarity score between bow vectors.
pub trait BoWTrait {
    fn l1(&self, other: &Self) -> f32;
    fn l2(&self, other: &Self) -> f32;
}

impl BoWTrait for WordHistogram {
    /// L1 score of the two l1-normalized histograms (Galvez, Eq 2):
    /// `1 - 0.5 * |a - b|`. 1 for proportional histograms, 0 for disjoint ones.
    fn l1(&self, other: &Self) -> f32 {
        let (na, nb) = (self.l1_norm(), other.l1_norm());
        if na == 0. || nb == 0. {
            return 0.;
        }
        // Words present in both: |a - b| replaces a + b in the sum of |a| + |b| = 2
        let mut diff = 2.;
        for (w, a) in self.iter() {
            let b = other.get(w);
            if b != 0. {
                let (a, b) = (a.abs() / na, b.abs() / nb);
                diff += (a - b).abs() - a - b;
            }
        }
        1. - 0.5 * diff
    }

    /// Cosine of the angle between the two histograms.
    fn l2(&self, other: &Self) -> f32 {
        let (na, nb) = (self.l2_norm(), other.l2_norm());
        if na == 0. || nb == 0. {
            return 0.;
        }
        let dot: f32 = self.iter().map(|(w, a)| a * other.get(w)).sum();
        dot / (na * nb)
    }
}
