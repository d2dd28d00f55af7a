//! Property-based test generators using proptest.

use proptest::prelude::*;

/// Strategy for up to `max` distinct primary keys.
pub fn distinct_keys_strategy(max: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::btree_set(1..100_000i64, 1..=max.max(1))
        .prop_map(|keys| keys.into_iter().collect())
}

/// Splits `text` into chunks at the given cut points.
///
/// Cut points are taken modulo `text.len() + 1`; the text is assumed to be
/// ASCII, as SSE frames of this protocol are.
pub fn split_chunks(text: &str, cuts: &[prop::sample::Index]) -> Vec<String> {
    let mut points: Vec<usize> = cuts.iter().map(|i| i.index(text.len() + 1)).collect();
    points.push(0);
    points.push(text.len());
    points.sort_unstable();
    points.dedup();
    points
        .windows(2)
        .map(|w| text[w[0]..w[1]].to_string())
        .collect()
}
