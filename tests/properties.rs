//! Property-based tests for matching, quantization and retrieval.
//!
//! These hold for any input:
//! - Collection outputs only contain requested pairs with non-empty, in-range matches
//! - Parallel and sequential matching agree
//! - Loosening the ratio never loses a match
//! - Quantization is deterministic and histograms count every descriptor
//! - A corpus document retrieves itself with the best score

use proptest::prelude::*;
use vocloc::*;

const DIM: usize = 64;

prop_compose! {
    fn arb_set(max_len: usize)(
        rows in prop::collection::vec(prop::collection::vec(0u8..4, DIM), 0..max_len)
    ) -> DescriptorSet {
        let rows = rows.into_iter().map(|r| r.into_iter().map(f32::from).collect::<Vec<_>>());
        DescriptorSet::from_rows(DescriptorType::Surf, rows).unwrap()
    }
}

prop_compose! {
    fn arb_collection()(views in prop::collection::vec(arb_set(12), 2..5))(
        pairs in prop::collection::vec((0..views.len() as u32, 0..views.len() as u32), 0..8),
        views in Just(views),
    ) -> (RegionsPerView, PairSet) {
        let mut regions = RegionsPerView::new();
        for (view, set) in views.into_iter().enumerate() {
            regions.insert(view as ViewId, set);
        }
        let pairs = pairs.into_iter().filter(|(i, j)| i != j).collect();
        (regions, pairs)
    }
}

fn matcher_type(index: usize) -> MatcherType {
    [
        MatcherType::BruteForceL2,
        MatcherType::AnnL2,
        MatcherType::CascadeHashingL2,
    ][index]
}

fn config(matcher_type: MatcherType, parallel: bool) -> MatcherConfig {
    MatcherConfig {
        matcher_type,
        parallel,
        ..MatcherConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn outputs_only_requested_pairs(
        (regions, pairs) in arb_collection(),
        strategy in 0usize..3,
    ) {
        let progress = AtomicProgress::new();
        let out = CollectionMatcher::new(config(matcher_type(strategy), true))
            .unwrap()
            .match_pairs(&regions, &pairs, DescriptorType::Surf, &progress)
            .unwrap();

        prop_assert_eq!(progress.done(), pairs.len() as u64);
        for (pair, per_type) in &out {
            prop_assert!(pairs.contains(pair), "unrequested pair {:?}", pair);
            let matches = &per_type[&DescriptorType::Surf];
            prop_assert!(!matches.is_empty());
            let n_i = regions.descriptor_count(pair.0, DescriptorType::Surf);
            let n_j = regions.descriptor_count(pair.1, DescriptorType::Surf);
            for m in matches {
                prop_assert!((m.i as usize) < n_i && (m.j as usize) < n_j);
            }
        }
    }

    #[test]
    fn parallel_matches_sequential(
        (regions, pairs) in arb_collection(),
        strategy in 0usize..3,
    ) {
        let run = |parallel| {
            CollectionMatcher::new(config(matcher_type(strategy), parallel))
                .unwrap()
                .match_pairs(&regions, &pairs, DescriptorType::Surf, &())
                .unwrap()
        };
        prop_assert_eq!(run(true), run(false));
    }

    #[test]
    fn looser_ratio_keeps_matches(
        reference in arb_set(16),
        query in arb_set(16),
        strict in 0.3f32..0.8,
        extra in 0.0f32..0.2,
    ) {
        prop_assume!(!reference.is_empty());
        let matcher = RegionsMatcher::build(&config(MatcherType::BruteForceL2, false), &reference)
            .unwrap();
        let tight = matcher.match_set(strict, &query).unwrap();
        let loose = matcher.match_set(strict + extra, &query).unwrap();
        for m in &tight {
            prop_assert!(loose.contains(m), "{:?} lost at ratio {}", m, strict + extra);
        }
    }

    #[test]
    fn quantization_is_deterministic(
        training in arb_set(40),
        query in arb_set(10),
        seed in any::<u64>(),
    ) {
        prop_assume!(!training.is_empty());
        let tree = VocabularyTree::train(&training, 3, 2, seed).unwrap();
        let again = VocabularyTree::train(&training, 3, 2, seed).unwrap();
        prop_assert_eq!(&tree, &again);

        let histogram = tree.histogram(&query).unwrap();
        prop_assert_eq!(histogram.total() as usize, query.len());
        for desc in query.iter() {
            let word = tree.quantize(desc).unwrap();
            prop_assert!((word as usize) < tree.num_words());
            prop_assert_eq!(word, tree.quantize(desc).unwrap());
        }
    }

    #[test]
    fn documents_retrieve_themselves(
        docs in prop::collection::vec(prop::collection::vec(0u32..32, 1..10), 1..8),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut db = Database::new(32);
        let histograms: Vec<WordHistogram> =
            docs.iter().map(|words| words.iter().copied().collect()).collect();
        for (doc, h) in histograms.iter().enumerate() {
            db.insert(doc as DocId, h).unwrap();
        }
        db.compute_idf_weights();

        let doc = pick.index(histograms.len());
        let result = db.query(&histograms[doc], docs.len()).unwrap();
        let own_score = result.iter().find(|r| r.0 == doc as DocId).map(|r| r.1);
        prop_assert!(own_score.is_some(), "document {} not retrieved", doc);
        let own_score = own_score.unwrap_or(0.);
        prop_assert!((own_score - 1.).abs() < 1e-4);
        prop_assert!(result.iter().all(|r| r.1 <= own_score + 1e-4));
        prop_assert!(result.windows(2).all(|w| w[0].1 >= w[1].1));
    }
}
