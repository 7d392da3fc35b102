use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info};

use crate::*;

/// Identifier of a reconstructed 3D point.
pub type LandmarkId = u32;

#[derive(Debug, Clone, PartialEq)]
/// Features of a reconstructed view that observe a landmark: their
/// descriptors, and for each of them the landmark id and position.
pub struct ReconstructedRegions {
    descriptors: DescriptorSet,
    landmarks: Vec<(LandmarkId, [f64; 3])>,
}

impl ReconstructedRegions {
    /// `landmarks[i]` is the landmark observed by descriptor `i`.
    pub fn new(
        descriptors: DescriptorSet,
        landmarks: Vec<(LandmarkId, [f64; 3])>,
    ) -> LocResult<Self> {
        if descriptors.len() != landmarks.len() {
            return Err(LocErr::FeatureCountMismatch {
                descriptors: descriptors.len(),
                other: landmarks.len(),
            });
        }
        Ok(Self {
            descriptors,
            landmarks,
        })
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    pub fn landmark(&self, feature: usize) -> Option<(LandmarkId, [f64; 3])> {
        self.landmarks.get(feature).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// A query feature matched to a reconstructed landmark.
pub struct Correspondence2D3D {
    /// Feature index in the query.
    pub feature: u32,
    /// Image position of the query feature.
    pub keypoint: [f64; 2],
    /// Corpus view through which the landmark was matched.
    pub view: ViewId,
    pub landmark: LandmarkId,
    pub point: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Camera pose: world-to-camera rotation and camera center in world frame.
pub struct Pose {
    pub rotation: [[f64; 3]; 3],
    pub center: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
/// Output of a successful resection.
pub struct Resection {
    pub pose: Pose,
    /// Indices of the inlier correspondences.
    pub inliers: Vec<usize>,
}

/// Estimates a camera pose from 2D-3D correspondences (e.g. robust PnP).
pub trait ResectionSolver {
    /// Fewest correspondences the solver accepts.
    fn min_correspondences(&self) -> usize;

    /// Expected geometric failures (degenerate configuration, too few
    /// inliers) are reported as `Err(reason)`.
    fn resect(&self, correspondences: &[Correspondence2D3D]) -> Result<Resection, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Stages of a localization request.
pub enum LocalizationState {
    Idle,
    Retrieved,
    Matched,
    Resected,
    Localized,
    Failed,
}

#[derive(Error, Debug, Clone, PartialEq)]
/// Why a query could not be localized.
pub enum FailureReason {
    #[error("no retrieval candidates")]
    NoCandidates,
    #[error("insufficient correspondences: {found} < {required}")]
    InsufficientCorrespondences { found: usize, required: usize },
    #[error("resection failed: {0}")]
    ResectionFailed(String),
}

impl FailureReason {
    /// Last state reached before failing.
    pub fn state(&self) -> LocalizationState {
        match self {
            FailureReason::NoCandidates => LocalizationState::Idle,
            FailureReason::InsufficientCorrespondences { .. } => LocalizationState::Matched,
            FailureReason::ResectionFailed(_) => LocalizationState::Resected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Localized {
    pub pose: Pose,
    pub inliers: Vec<Correspondence2D3D>,
    /// Every correspondence handed to the solver.
    pub correspondences: Vec<Correspondence2D3D>,
    /// Corpus views matched against the query, with their retrieval score.
    pub candidates: Vec<(ViewId, f32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Localization {
    Localized(Localized),
    Failed(FailureReason),
}

impl Localization {
    pub fn state(&self) -> LocalizationState {
        match self {
            Localization::Localized(_) => LocalizationState::Localized,
            Localization::Failed(_) => LocalizationState::Failed,
        }
    }

    pub fn is_localized(&self) -> bool {
        matches!(self, Localization::Localized(_))
    }
}

/// Localizes query images against a reconstructed corpus: vocabulary-tree
/// retrieval, descriptor matching against the best candidates, resection.
pub struct Localizer<S> {
    config: LocalizerConfig,
    tree: VocabularyTree,
    database: Database,
    regions: HashMap<ViewId, ReconstructedRegions>,
    doc_to_view: BTreeMap<DocId, ViewId>,
    solver: S,
}

impl<S: ResectionSolver> Localizer<S> {
    /// Index every corpus view in a new database. Views receive document ids
    /// in iteration order.
    pub fn new<I>(config: LocalizerConfig, tree: VocabularyTree, corpus: I, solver: S) -> LocResult<Self>
    where
        I: IntoIterator<Item = (ViewId, ReconstructedRegions)>,
    {
        config.validate()?;
        let mut database = Database::for_vocabulary(&tree);
        let mut regions = HashMap::new();
        let mut doc_to_view = BTreeMap::new();
        for (view, r) in corpus {
            if regions.contains_key(&view) {
                return Err(LocErr::InvalidConfig(format!("view {} appears twice in the corpus", view)));
            }
            let doc = doc_to_view.len() as DocId;
            database.insert(doc, &tree.histogram(r.descriptors())?)?;
            doc_to_view.insert(doc, view);
            regions.insert(view, r);
        }
        database.compute_idf_weights();
        info!(views = regions.len(), words = tree.num_words(), "localizer ready");

        Ok(Self {
            config,
            tree,
            database,
            regions,
            doc_to_view,
            solver,
        })
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }

    pub fn tree(&self) -> &VocabularyTree {
        &self.tree
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn view_of(&self, doc: DocId) -> Option<ViewId> {
        self.doc_to_view.get(&doc).copied()
    }

    /// Correspondences needed before the solver is called.
    pub fn required_correspondences(&self) -> usize {
        self.config
            .min_correspondences
            .max(self.solver.min_correspondences())
    }

    /// Corpus views most similar to the query, best first.
    pub fn retrieve(&self, descriptors: &DescriptorSet) -> LocResult<Vec<(ViewId, f32)>> {
        let histogram = self.tree.histogram(descriptors)?;
        Ok(self
            .database
            .query(&histogram, self.config.top_k)?
            .into_iter()
            .filter_map(|(doc, score)| self.view_of(doc).map(|view| (view, score)))
            .collect())
    }

    /// Localize a query given its descriptors and the matching keypoint
    /// positions.
    ///
    /// Expected failures are reported as [`Localization::Failed`]; errors are
    /// reserved for inputs inconsistent with the corpus.
    pub fn localize(
        &self,
        descriptors: &DescriptorSet,
        keypoints: &[[f64; 2]],
    ) -> LocResult<Localization> {
        if keypoints.len() != descriptors.len() {
            return Err(LocErr::FeatureCountMismatch {
                descriptors: descriptors.len(),
                other: keypoints.len(),
            });
        }

        debug!(state = ?LocalizationState::Idle, features = descriptors.len());
        let candidates = self.retrieve(descriptors)?;
        if candidates.is_empty() {
            return Ok(self.fail(FailureReason::NoCandidates));
        }
        debug!(state = ?LocalizationState::Retrieved, candidates = candidates.len());

        // The query is the reference side: one index for all candidates.
        let required = self.required_correspondences();
        let matcher = RegionsMatcher::build(&self.config.matcher, descriptors)?;
        let mut used = vec![false; descriptors.len()];
        let mut correspondences = Vec::new();
        let mut tried = Vec::new();
        for &(view, score) in candidates.iter().take(self.config.max_candidates) {
            let regions = match self.regions.get(&view) {
                Some(r) if !r.descriptors().is_empty() => r,
                _ => continue,
            };
            tried.push((view, score));
            // Several candidate features may pick the same query feature:
            // within a view the closest one wins.
            let mut closest: BTreeMap<usize, (f32, usize)> = BTreeMap::new();
            for (j, desc) in regions.descriptors().iter().enumerate() {
                let n = match matcher.nearest2(desc) {
                    Some(n) if n.passes_ratio(self.config.matcher.ratio) => n,
                    _ => continue,
                };
                if used[n.index] {
                    continue;
                }
                let best = closest.entry(n.index).or_insert((n.dist, j));
                if n.dist < best.0 {
                    *best = (n.dist, j);
                }
            }
            for (feature, (_, j)) in closest {
                if let Some((landmark, point)) = regions.landmark(j) {
                    used[feature] = true;
                    correspondences.push(Correspondence2D3D {
                        feature: feature as u32,
                        keypoint: keypoints[feature],
                        view,
                        landmark,
                        point,
                    });
                }
            }
            if correspondences.len() >= required {
                break;
            }
        }
        debug!(
            state = ?LocalizationState::Matched,
            correspondences = correspondences.len(),
            views = tried.len()
        );

        if correspondences.len() < required {
            return Ok(self.fail(FailureReason::InsufficientCorrespondences {
                found: correspondences.len(),
                required,
            }));
        }

        let resection = match self.solver.resect(&correspondences) {
            Ok(r) => r,
            Err(reason) => return Ok(self.fail(FailureReason::ResectionFailed(reason))),
        };
        debug!(state = ?LocalizationState::Resected, inliers = resection.inliers.len());

        let inliers = resection
            .inliers
            .iter()
            .filter_map(|&i| correspondences.get(i).copied())
            .collect();
        debug!(state = ?LocalizationState::Localized);
        Ok(Localization::Localized(Localized {
            pose: resection.pose,
            inliers,
            correspondences,
            candidates: tried,
        }))
    }

    fn fail(&self, reason: FailureReason) -> Localization {
        debug!(state = ?LocalizationState::Failed, after = ?reason.state(), %reason);
        Localization::Failed(reason)
    }
}
