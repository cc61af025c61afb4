//! Verdict parsing and score aggregation.
//!
//! Everything here is pure: the same inputs always produce the same
//! [`ScoreRecord`], so scores can be recomputed from persisted artifacts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::dispatcher::Completion;

pub const AVERAGE: &str = "Average";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    True,
    False,
    Unknown,
}

/// How an `unknown` (or unparseable) verdict counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    #[default]
    Incorrect,
    Exclude,
}

impl UnknownPolicy {
    pub fn apply(&self, verdict: Verdict) -> Option<bool> {
        match (verdict, self) {
            (Verdict::True, _) => Some(true),
            (Verdict::False, _) => Some(false),
            (Verdict::Unknown, UnknownPolicy::Incorrect) => Some(false),
            (Verdict::Unknown, UnknownPolicy::Exclude) => None,
        }
    }
}

fn verdict_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(true|false|unknown)\b").expect("verdict pattern is valid"))
}

/// Last whole-word `true`/`false`/`unknown` in the judge text, any case.
pub fn parse_verdict(text: &str) -> Verdict {
    match verdict_pattern()
        .find_iter(text)
        .last()
        .map(|m| m.as_str().to_ascii_lowercase())
        .as_deref()
    {
        Some("true") => Verdict::True,
        Some("false") => Verdict::False,
        _ => Verdict::Unknown,
    }
}

pub fn judge_verdict(slot: Option<&Completion>) -> Option<Verdict> {
    slot.and_then(Completion::last_reply).map(parse_verdict)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    /// Sum of per-item signals, the number correct for boolean items.
    pub correct: f64,
    pub evaluated: usize,
    pub excluded: usize,
}

impl Tally {
    fn add(&mut self, signal: Option<f64>) {
        match signal {
            Some(v) => {
                self.correct += v;
                self.evaluated += 1;
            }
            None => self.excluded += 1,
        }
    }

    fn merge(&mut self, other: &Tally) {
        self.correct += other.correct;
        self.evaluated += other.evaluated;
        self.excluded += other.excluded;
    }

    pub fn score(&self) -> Option<f64> {
        (self.evaluated > 0).then(|| 100.0 * self.correct / self.evaluated as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Category key → score in percent, plus [`AVERAGE`].
    pub scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tallies: BTreeMap<String, Tally>,
    /// Categories with nothing scorable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unscored: Vec<String>,
    /// Code only: category → `pass@k` → percent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pass_at_k: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ScoreRecord {
    pub fn average(&self) -> Option<f64> {
        self.scores.get(AVERAGE).copied()
    }
}

/// Per-item signals in `[0, 1]` (`None` = not scorable) → category, group
/// and micro-averaged scores.
pub fn compute_score(
    signals: &BTreeMap<String, Vec<Option<f64>>>,
    groups: &BTreeMap<String, String>,
) -> ScoreRecord {
    let mut record = ScoreRecord::default();
    let mut overall = Tally::default();
    let mut group_tallies: BTreeMap<String, Tally> = BTreeMap::new();

    for (category, items) in signals {
        let mut tally = Tally::default();
        for signal in items {
            tally.add(*signal);
        }

        match tally.score() {
            Some(score) => {
                record.scores.insert(category.clone(), score);
            }
            None => record.unscored.push(category.clone()),
        }

        overall.merge(&tally);
        let group = groups
            .get(category)
            .cloned()
            .unwrap_or_else(|| category.clone());
        group_tallies.entry(group).or_default().merge(&tally);
        record.tallies.insert(category.clone(), tally);
    }

    if let Some(avg) = overall.score() {
        record.scores.insert(AVERAGE.to_string(), avg);
    }
    record.groups = group_tallies
        .into_iter()
        .filter_map(|(g, t)| t.score().map(|s| (g, s)))
        .collect();
    record
}

pub fn bool_signals(items: &[Option<bool>]) -> Vec<Option<f64>> {
    items
        .iter()
        .map(|v| v.map(|b| if b { 1.0 } else { 0.0 }))
        .collect()
}

/// MCQA: an item is correct iff the judge said `true` for the gold option.
/// `layout[i]` is `(first judge slot, option count, gold option)` for items
/// that were judged.
pub fn mcqa_correctness(
    judge: &[Option<Completion>],
    layout: &[Option<(usize, usize, usize)>],
    policy: UnknownPolicy,
) -> Vec<Option<bool>> {
    layout
        .iter()
        .map(|entry| {
            let (start, _count, gold) = (*entry)?;
            let verdict = judge_verdict(judge.get(start + gold)?.as_ref())?;
            policy.apply(verdict)
        })
        .collect()
}

/// Open-ended: one judge slot per item, `None` items stay unscored.
pub fn open_correctness(
    judge: &[Option<Completion>],
    layout: &[Option<usize>],
    policy: UnknownPolicy,
) -> Vec<Option<bool>> {
    layout
        .iter()
        .map(|entry| {
            let slot = (*entry)?;
            let verdict = judge_verdict(judge.get(slot)?.as_ref())?;
            policy.apply(verdict)
        })
        .collect()
}

/// Unbiased pass@k estimator `1 - C(n-c, k) / C(n, k)` in product form.
pub fn pass_at_k(n: usize, c: usize, k: usize) -> f64 {
    if c == 0 || k == 0 {
        return 0.0;
    }
    if n < k || n - c < k {
        return 1.0;
    }
    let mut fail = 1.0f64;
    for i in (n - c + 1)..=n {
        fail *= 1.0 - k as f64 / i as f64;
    }
    1.0 - fail
}

/// Code: executor output per category (fractions) → percent, averaged
/// across categories for each k. The first k listed is the headline score.
pub fn compute_code_score(per_category: &BTreeMap<String, BTreeMap<String, f64>>, ks: &[usize]) -> ScoreRecord {
    let mut record = ScoreRecord::default();
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let headline = ks.first().map(|k| format!("pass@{}", k));

    for (category, results) in per_category {
        let percent: BTreeMap<String, f64> =
            results.iter().map(|(k, v)| (k.clone(), v * 100.0)).collect();
        if percent.is_empty() {
            record.unscored.push(category.clone());
            continue;
        }
        for (k, v) in &percent {
            let e = sums.entry(k.clone()).or_insert((0.0, 0));
            e.0 += v;
            e.1 += 1;
        }
        if let Some(v) = headline.as_ref().and_then(|h| percent.get(h)) {
            record.scores.insert(category.clone(), *v);
        }
        record.pass_at_k.insert(category.clone(), percent);
    }

    let averages: BTreeMap<String, f64> = sums
        .into_iter()
        .map(|(k, (sum, count))| (k, sum / count as f64))
        .collect();
    if let Some(v) = headline.as_ref().and_then(|h| averages.get(h)) {
        record.scores.insert(AVERAGE.to_string(), *v);
    }
    if !averages.is_empty() {
        record.pass_at_k.insert(AVERAGE.to_string(), averages);
    }
    record
}

/// Reference-based metric for translation outputs, in `[0, 1]`.
pub trait TextMetric: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, hypothesis: &str, reference: &str) -> f64;
}

/// Case- and whitespace-insensitive equality, ignoring trailing punctuation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || matches!(c, '。' | '、' | '！' | '？'))
        .to_lowercase()
}

impl TextMetric for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn score(&self, hypothesis: &str, reference: &str) -> f64 {
        if normalize(hypothesis) == normalize(reference) {
            1.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Option<Completion> {
        Some(Completion::Text(s.to_string()))
    }

    #[test]
    fn test_parse_verdict_takes_last_word() {
        assert_eq!(parse_verdict("True"), Verdict::True);
        assert_eq!(parse_verdict("It looks false at first, but TRUE."), Verdict::True);
        assert_eq!(parse_verdict("true... actually false"), Verdict::False);
        assert_eq!(parse_verdict("untrue statement"), Verdict::Unknown);
        assert_eq!(parse_verdict("I cannot tell: unknown"), Verdict::Unknown);
        assert_eq!(parse_verdict(""), Verdict::Unknown);
    }

    #[test]
    fn test_unknown_policy() {
        assert_eq!(UnknownPolicy::Incorrect.apply(Verdict::Unknown), Some(false));
        assert_eq!(UnknownPolicy::Exclude.apply(Verdict::Unknown), None);
        assert_eq!(UnknownPolicy::Exclude.apply(Verdict::True), Some(true));
    }

    #[test]
    fn test_mcqa_uses_gold_option_only() {
        // item 0: options at 0..3, gold 1; item 1: options at 3..6, gold 0
        let judge = vec![
            text("true"),
            text("true"),
            text("false"),
            text("false"),
            text("true"),
            text("true"),
        ];
        let layout = vec![Some((0, 3, 1)), Some((3, 3, 0)), None];
        let correct = mcqa_correctness(&judge, &layout, UnknownPolicy::Incorrect);
        assert_eq!(correct, vec![Some(true), Some(false), None]);
    }

    #[test]
    fn test_open_correctness_with_missing_judge() {
        let judge = vec![text("false"), None, text("maybe")];
        let layout = vec![Some(0), Some(1), Some(2)];
        assert_eq!(
            open_correctness(&judge, &layout, UnknownPolicy::Exclude),
            vec![Some(false), None, None]
        );
        assert_eq!(
            open_correctness(&judge, &layout, UnknownPolicy::Incorrect),
            vec![Some(false), None, Some(false)]
        );
    }

    #[test]
    fn test_compute_score_micro_average_and_groups() {
        let mut signals = BTreeMap::new();
        signals.insert("a".to_string(), bool_signals(&[Some(true), Some(true), None]));
        signals.insert("b".to_string(), bool_signals(&[Some(true), Some(false), Some(false), Some(false)]));
        signals.insert("c".to_string(), bool_signals(&[None, None]));
        let mut groups = BTreeMap::new();
        groups.insert("a".to_string(), "stem".to_string());
        groups.insert("b".to_string(), "stem".to_string());
        groups.insert("c".to_string(), "other".to_string());

        let record = compute_score(&signals, &groups);

        assert_eq!(record.scores["a"], 100.0);
        assert_eq!(record.scores["b"], 25.0);
        // 3 correct of 6 scorable, not the mean of 100 and 25
        assert_eq!(record.scores[AVERAGE], 50.0);
        assert_eq!(record.groups["stem"], 50.0);
        assert!(!record.groups.contains_key("other"));
        assert_eq!(record.unscored, vec!["c".to_string()]);
        assert_eq!(record.tallies["a"].excluded, 1);
    }

    #[test]
    fn test_compute_score_is_idempotent() {
        let mut signals = BTreeMap::new();
        signals.insert("x".to_string(), vec![Some(1.0), Some(0.0), None, Some(0.5)]);
        let groups = BTreeMap::new();

        let first = compute_score(&signals, &groups);
        let second = compute_score(&signals, &groups);
        assert_eq!(first, second);

        let json = serde_json::to_string(&first).unwrap();
        let back: ScoreRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, first);
    }

    #[test]
    fn test_pass_at_k() {
        assert_eq!(pass_at_k(10, 0, 1), 0.0);
        assert!((pass_at_k(10, 3, 1) - 0.3).abs() < 1e-12);
        assert_eq!(pass_at_k(5, 4, 2), 1.0);
        // 1 - C(8,2)/C(10,2) = 1 - 28/45
        assert!((pass_at_k(10, 2, 2) - (1.0 - 28.0 / 45.0)).abs() < 1e-12);
    }

    #[test]
    fn test_code_score_averages_categories() {
        let mut per_category = BTreeMap::new();
        per_category.insert(
            "easy".to_string(),
            BTreeMap::from([("pass@1".to_string(), 0.8), ("pass@10".to_string(), 1.0)]),
        );
        per_category.insert(
            "hard".to_string(),
            BTreeMap::from([("pass@1".to_string(), 0.2), ("pass@10".to_string(), 0.5)]),
        );

        let record = compute_code_score(&per_category, &[1, 10]);
        assert!((record.scores["easy"] - 80.0).abs() < 1e-9);
        assert!((record.average().unwrap() - 50.0).abs() < 1e-9);
        assert!((record.pass_at_k[AVERAGE]["pass@10"] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_match_normalizes() {
        let m = ExactMatch;
        assert_eq!(m.score("  Hello   World. ", "hello world"), 1.0);
        assert_eq!(m.score("안녕하세요。", "안녕하세요"), 1.0);
        assert_eq!(m.score("hello", "goodbye"), 0.0);
    }
}
