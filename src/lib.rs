use thiserror::Error;

/// Descriptor sets, descriptor types and the regions provider interface.
pub mod descriptor;
pub use descriptor::{DescriptorSet, DescriptorType, RegionsPerView, RegionsProvider, ViewId};

/// Nearest-neighbor strategies used to build putative matches.
pub mod matcher;
pub use matcher::{IndMatch, MatcherType, Neighbors, RegionsMatcher};

/// Matching of every requested image pair of a collection.
pub mod collection;
pub use collection::{
    exhaustive_pairs, AtomicProgress, CollectionMatcher, Pair, PairSet, PairwiseMatches, Progress,
};

/// Hierarchical vocabulary tree used to quantize descriptors into visual words.
pub mod vocab;
pub use vocab::{NodePath, VocabularyTree};

/// Sparse word histograms and their similarity scores.
pub mod bow;
pub use bow::{BoWTrait, WordHistogram};

/// Inverted index over a corpus of word histograms.
pub mod database;
pub use database::{Database, DocId};

/// Image localization against a reconstructed corpus.
pub mod localizer;
pub use localizer::{
    Correspondence2D3D, FailureReason, LandmarkId, Localization, LocalizationState, Localized,
    Localizer, Pose, ReconstructedRegions, Resection, ResectionSolver,
};

/// Serde-enabled settings for matching and localization.
pub mod config;
pub use config::{LocalizerConfig, MatcherConfig};

/// Identifier of a visual word (leaf of the vocabulary tree).
pub type WordId = u32;

pub type LocResult<T> = std::result::Result<T, LocErr>;

#[derive(Error, Debug)]
pub enum LocErr {
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "bincode")]
    #[error("Serialization Error")]
    Bincode(#[from] bincode::Error),
    #[error("Cannot build a matcher over an empty {0:?} descriptor set")]
    EmptyReference(DescriptorType),
    #[error("Descriptor type mismatch: index holds {expected:?}, got {found:?}")]
    DescriptorTypeMismatch {
        expected: DescriptorType,
        found: DescriptorType,
    },
    #[error("Descriptor length mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("{len} bytes do not split into descriptors of length {dim}")]
    PartialDescriptor { len: usize, dim: usize },
    #[error("{descriptors} descriptors but {other} keypoints or landmarks")]
    FeatureCountMismatch { descriptors: usize, other: usize },
    #[error("Cannot train a vocabulary without descriptors")]
    EmptyTrainingSet,
    #[error("Word {word} is outside a vocabulary of {num_words} words")]
    UnknownWord { word: WordId, num_words: usize },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
