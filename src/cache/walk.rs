use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Per-level outcomes of one logical lookup, `true` = hit, in level order.
pub type PageWalkOutcome = SmallVec<[bool; 4]>;

/// Render an outcome as a compact pattern, e.g. `[miss, hit]` -> `"MH"`.
pub fn pattern_label(outcome: &[bool]) -> String {
    outcome.iter().map(|&hit| if hit { 'H' } else { 'M' }).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkPatternCount {
    pub pattern: String,
    pub count: u64,
}

/// Occurrence count per exact outcome sequence. Keys compare by length and
/// element-wise, so `[H]` and `[H, H]` are distinct patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageWalkHistogram {
    counts: BTreeMap<PageWalkOutcome, u64>,
}

impl PageWalkHistogram {
    pub fn record(&mut self, outcome: &[bool]) {
        let count = self
            .counts
            .entry(PageWalkOutcome::from_slice(outcome))
            .or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn count(&self, outcome: &[bool]) -> u64 {
        self.counts.get(outcome).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, &n| acc.saturating_add(n))
    }

    /// Number of distinct patterns observed.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[bool], u64)> + '_ {
        self.counts.iter().map(|(k, &v)| (k.as_slice(), v))
    }

    pub fn entries(&self) -> Vec<WalkPatternCount> {
        self.iter()
            .map(|(outcome, count)| WalkPatternCount {
                pattern: pattern_label(outcome),
                count,
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

/// Accumulates the outcomes of the walk in progress and files the finished
/// sequence into its histogram.
#[derive(Debug, Clone, Default)]
pub struct PageWalkClassifier {
    pending: PageWalkOutcome,
    histogram: PageWalkHistogram,
}

impl PageWalkClassifier {
    pub fn observe(&mut self, hit: bool) {
        self.pending.push(hit);
    }

    /// Close the current walk. Empty walks are not recorded.
    pub fn finish(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.histogram.record(&self.pending);
        self.pending.clear();
    }

    pub fn classify(&mut self, outcome: &[bool]) {
        for &hit in outcome {
            self.observe(hit);
        }
        self.finish();
    }

    pub fn histogram(&self) -> &PageWalkHistogram {
        &self.histogram
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.histogram.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_counts_exact_sequences() {
        let mut walks = PageWalkClassifier::default();
        walks.classify(&[true]);
        walks.classify(&[true]);
        walks.classify(&[false, true]);
        let hist = walks.histogram();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.count(&[true]), 2);
        assert_eq!(hist.count(&[false, true]), 1);
        assert_eq!(hist.count(&[true, false]), 0);
        assert_eq!(hist.total(), 3);
    }

    #[test]
    fn different_lengths_are_distinct_keys() {
        let mut hist = PageWalkHistogram::default();
        hist.record(&[false]);
        hist.record(&[false, false]);
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.count(&[false]), 1);
    }

    #[test]
    fn observe_then_finish_records_once() {
        let mut walks = PageWalkClassifier::default();
        walks.observe(false);
        walks.observe(false);
        walks.observe(true);
        walks.finish();
        walks.finish();
        assert_eq!(walks.histogram().count(&[false, false, true]), 1);
        assert_eq!(walks.histogram().total(), 1);
    }

    #[test]
    fn entries_use_pattern_labels() {
        let mut hist = PageWalkHistogram::default();
        hist.record(&[false, true]);
        assert_eq!(
            hist.entries(),
            vec![WalkPatternCount {
                pattern: "MH".to_string(),
                count: 1
            }]
        );
    }
}
