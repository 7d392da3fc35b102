#[cfg(feature = "bincode")]
use bincode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use crate::*;

/// Identifier of a corpus document.
pub type DocId = u32;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
struct Posting {
    doc: DocId,
    weight: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Inverted index from visual words to the documents containing them.
///
/// Every word carries an inverse-document-frequency weight, uniform (1) until
/// [`compute_idf_weights`](Self::compute_idf_weights) is called. Documents are
/// scored by the cosine between idf-weighted histograms, visiting only the
/// posting lists of the query's words.
pub struct Database {
    /// Word -> postings, in insertion order.
    postings: Vec<Vec<Posting>>,
    word_weights: Vec<f32>,
    /// Document -> magnitude of its weighted histogram.
    doc_norms: BTreeMap<DocId, f32>,
}

impl Database {
    /// Empty database over a vocabulary of `num_words` words.
    pub fn new(num_words: usize) -> Self {
        Self {
            postings: vec![Vec::new(); num_words],
            word_weights: vec![1.; num_words],
            doc_norms: BTreeMap::new(),
        }
    }

    /// Empty database sized for `tree`.
    pub fn for_vocabulary(tree: &VocabularyTree) -> Self {
        Self::new(tree.num_words())
    }

    pub fn num_words(&self) -> usize {
        self.postings.len()
    }

    pub fn num_docs(&self) -> usize {
        self.doc_norms.len()
    }

    /// Weight of `word`, if it belongs to the vocabulary.
    pub fn word_weight(&self, word: WordId) -> Option<f32> {
        self.word_weights.get(word as usize).copied()
    }

    /// Add document `doc`: one posting per word of nonzero weight.
    ///
    /// A document must be inserted once. Inserting the same id again
    /// duplicates its postings.
    pub fn insert(&mut self, doc: DocId, histogram: &WordHistogram) -> LocResult<()> {
        self.check_words(histogram)?;
        let mut norm2 = 0.;
        for (word, weight) in histogram.iter().filter(|(_, v)| *v != 0.) {
            self.postings[word as usize].push(Posting { doc, weight });
            let w = weight * self.word_weights[word as usize];
            norm2 += w * w;
        }
        self.doc_norms.insert(doc, norm2.sqrt());
        Ok(())
    }

    /// Set every word weight to `ln(1 + N / n)`, N being the number of
    /// documents and n the number of documents containing the word. Words no
    /// document contains get weight 0.
    pub fn compute_idf_weights(&mut self) {
        let n_docs = self.num_docs() as f32;
        for (weight, postings) in self.word_weights.iter_mut().zip(&self.postings) {
            *weight = if postings.is_empty() {
                0.
            } else {
                (1. + n_docs / postings.len() as f32).ln()
            };
        }
        self.refresh_doc_norms();
        info!(docs = self.num_docs(), words = self.num_words(), "computed idf weights");
    }

    /// The `top_k` documents most similar to `histogram`, best first, ties
    /// broken by lower id. Documents sharing no word with the query are not
    /// returned.
    pub fn query(&self, histogram: &WordHistogram, top_k: usize) -> LocResult<Vec<(DocId, f32)>> {
        self.check_words(histogram)?;

        let mut query_norm2 = 0.;
        let mut dots: HashMap<DocId, f32> = HashMap::new();
        for (word, q) in histogram.iter() {
            let idf = self.word_weights[word as usize];
            let q = q * idf;
            if q == 0. {
                continue;
            }
            query_norm2 += q * q;
            for p in &self.postings[word as usize] {
                *dots.entry(p.doc).or_insert(0.) += q * p.weight * idf;
            }
        }
        let query_norm = query_norm2.sqrt();

        let mut scores: Vec<(DocId, f32)> = dots
            .into_iter()
            .filter_map(|(doc, dot)| {
                let norm = self.doc_norms.get(&doc).copied().unwrap_or(0.);
                if norm > 0. {
                    Some((doc, dot / (query_norm * norm)))
                } else {
                    None
                }
            })
            .collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scores.truncate(top_k);
        Ok(scores)
    }

    /// Load a database from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> LocResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }

    /// Save database to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> LocResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }

    fn check_words(&self, histogram: &WordHistogram) -> LocResult<()> {
        let num_words = self.num_words();
        match histogram.iter().map(|(w, _)| w).find(|&w| w as usize >= num_words) {
            Some(word) => Err(LocErr::UnknownWord { word, num_words }),
            None => Ok(()),
        }
    }

    fn refresh_doc_norms(&mut self) {
        self.doc_norms.values_mut().for_each(|n| *n = 0.);
        for (postings, &idf) in self.postings.iter().zip(&self.word_weights) {
            for p in postings {
                let w = p.weight * idf;
                if let Some(n) = self.doc_norms.get_mut(&p.doc) {
                    *n += w * w;
                }
            }
        }
        self.doc_norms.values_mut().for_each(|n| *n = n.sqrt());
    }
}
