// Copyright 2025 EvalForge (https://github.com/evalforge)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Metrics calculation phase
//!
//! Pure functions over test-case outcomes. Classification tasks get a
//! confusion matrix with per-class precision/recall/F1 (0/0 defined as
//! 0), accuracy, macro- and weighted-F1. Generative tasks get BLEU
//! (1–4-gram precisions with brevity penalty) and ROUGE-1/2/L recall
//! surfaces. Every task gets `overall_score` and `pass_rate`.

use chrono::Utc;
use evalforge_core::{EvaluationMetrics, TaskType, TestCase, TestCaseStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Judge usage accrued while executing one evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionTotals {
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ClassStats {
    precision: f64,
    recall: f64,
    f1: f64,
    support: u64,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

fn norm_label(s: &str) -> String {
    s.trim().to_lowercase()
}

fn tokens(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Compute and assemble the metrics row for one evaluation.
pub fn calculate_metrics(
    evaluation_id: Uuid,
    task_type: TaskType,
    cases: &[TestCase],
    totals: ExecutionTotals,
) -> EvaluationMetrics {
    let total = cases.len() as u32;
    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut errored = 0u32;
    let mut skipped = 0u32;
    for case in cases {
        match case.status {
            TestCaseStatus::Passed => passed += 1,
            TestCaseStatus::Failed => failed += 1,
            TestCaseStatus::Error => errored += 1,
            TestCaseStatus::Skipped => skipped += 1,
            TestCaseStatus::Pending | TestCaseStatus::Running => {}
        }
    }

    // Weighted mean score over cases that actually produced output.
    let scored: Vec<(&TestCase, f64)> = cases
        .iter()
        .filter_map(|c| c.score.map(|s| (c, s)))
        .collect();
    let weight_sum: f64 = scored.iter().map(|(c, _)| c.weight).sum();
    let overall_score = if weight_sum > 0.0 {
        scored.iter().map(|(c, s)| c.weight * s).sum::<f64>() / weight_sum
    } else {
        0.0
    };

    let mut metrics = EvaluationMetrics {
        evaluation_id,
        overall_score,
        pass_rate: ratio(passed as u64, total as u64),
        total_cases: total,
        passed_cases: passed,
        failed_cases: failed,
        error_cases: errored,
        skipped_cases: skipped,
        total_tokens: totals.tokens,
        total_cost: totals.cost,
        computed_at: Utc::now(),
        ..Default::default()
    };

    if task_type.is_discrete() {
        apply_classification_surface(&mut metrics, cases);
    } else {
        apply_generation_surface(&mut metrics, cases);
    }
    metrics
}

fn apply_classification_surface(metrics: &mut EvaluationMetrics, cases: &[TestCase]) {
    let pairs: Vec<(String, String)> = cases
        .iter()
        .filter(|c| matches!(c.status, TestCaseStatus::Passed | TestCaseStatus::Failed))
        .filter_map(|c| {
            c.actual_output
                .as_deref()
                .map(|actual| (norm_label(&c.expected_output), norm_label(actual)))
        })
        .collect();
    if pairs.is_empty() {
        return;
    }

    let classes: HashSet<&str> = pairs
        .iter()
        .flat_map(|(e, a)| [e.as_str(), a.as_str()])
        .collect();

    let total = pairs.len() as u64;
    let correct = pairs.iter().filter(|(e, a)| e == a).count() as u64;

    let mut per_class: HashMap<String, ClassStats> = HashMap::new();
    let mut macro_f1_sum = 0.0;
    let mut weighted_f1_sum = 0.0;
    let mut support_sum = 0u64;

    for class in &classes {
        let tp = pairs.iter().filter(|(e, a)| e == class && a == class).count() as u64;
        let fp = pairs.iter().filter(|(e, a)| e != class && a == class).count() as u64;
        let fn_ = pairs.iter().filter(|(e, a)| e == class && a != class).count() as u64;
        let support = tp + fn_;

        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let class_f1 = f1(precision, recall);

        macro_f1_sum += class_f1;
        weighted_f1_sum += class_f1 * support as f64;
        support_sum += support;

        per_class.insert(
            class.to_string(),
            ClassStats {
                precision,
                recall,
                f1: class_f1,
                support,
            },
        );
    }

    metrics.accuracy = Some(ratio(correct, total));
    metrics.macro_f1 = Some(macro_f1_sum / classes.len() as f64);
    metrics.weighted_f1 = Some(if support_sum > 0 {
        weighted_f1_sum / support_sum as f64
    } else {
        0.0
    });
    metrics.per_class = serde_json::to_value(per_class).unwrap_or(serde_json::Value::Null);
}

fn apply_generation_surface(metrics: &mut EvaluationMetrics, cases: &[TestCase]) {
    let pairs: Vec<(&str, &str)> = cases
        .iter()
        .filter(|c| matches!(c.status, TestCaseStatus::Passed | TestCaseStatus::Failed))
        .filter_map(|c| {
            c.actual_output
                .as_deref()
                .map(|actual| (c.expected_output.as_str(), actual))
        })
        .collect();
    if pairs.is_empty() {
        return;
    }

    let n = pairs.len() as f64;
    metrics.bleu = Some(pairs.iter().map(|(e, a)| bleu(e, a)).sum::<f64>() / n);
    metrics.rouge1 = Some(pairs.iter().map(|(e, a)| rouge_n(e, a, 1)).sum::<f64>() / n);
    metrics.rouge2 = Some(pairs.iter().map(|(e, a)| rouge_n(e, a, 2)).sum::<f64>() / n);
    metrics.rouge_l = Some(pairs.iter().map(|(e, a)| rouge_l(e, a)).sum::<f64>() / n);
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<Vec<&str>, u64> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for window in tokens.windows(n) {
            let gram: Vec<&str> = window.iter().map(String::as_str).collect();
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

/// BLEU with uniform 1–4-gram weights and brevity penalty, against a
/// single reference.
pub fn bleu(reference: &str, candidate: &str) -> f64 {
    let reference_tokens = tokens(reference);
    let candidate_tokens = tokens(candidate);
    if candidate_tokens.is_empty() {
        return 0.0;
    }

    let max_order = 4.min(candidate_tokens.len()).min(reference_tokens.len().max(1));
    let mut log_precision_sum = 0.0;
    for order in 1..=max_order {
        let reference_grams = ngram_counts(&reference_tokens, order);
        let candidate_grams = ngram_counts(&candidate_tokens, order);
        let candidate_total: u64 = candidate_grams.values().sum();
        if candidate_total == 0 {
            return 0.0;
        }
        let clipped: u64 = candidate_grams
            .iter()
            .map(|(gram, count)| (*count).min(*reference_grams.get(gram).unwrap_or(&0)))
            .sum();
        if clipped == 0 {
            return 0.0;
        }
        log_precision_sum += (clipped as f64 / candidate_total as f64).ln();
    }
    let geo_mean = (log_precision_sum / max_order as f64).exp();

    let brevity_penalty = if candidate_tokens.len() >= reference_tokens.len() {
        1.0
    } else {
        (1.0 - reference_tokens.len() as f64 / candidate_tokens.len() as f64).exp()
    };
    (geo_mean * brevity_penalty).clamp(0.0, 1.0)
}

/// ROUGE-N: n-gram recall against the reference.
pub fn rouge_n(reference: &str, candidate: &str, n: usize) -> f64 {
    let reference_tokens = tokens(reference);
    let candidate_tokens = tokens(candidate);
    let reference_grams = ngram_counts(&reference_tokens, n);
    let candidate_grams = ngram_counts(&candidate_tokens, n);
    let reference_total: u64 = reference_grams.values().sum();
    if reference_total == 0 {
        return 0.0;
    }
    let matched: u64 = reference_grams
        .iter()
        .map(|(gram, count)| (*count).min(*candidate_grams.get(gram).unwrap_or(&0)))
        .sum();
    matched as f64 / reference_total as f64
}

/// ROUGE-L: longest-common-subsequence recall against the reference.
pub fn rouge_l(reference: &str, candidate: &str) -> f64 {
    let reference_tokens = tokens(reference);
    let candidate_tokens = tokens(candidate);
    if reference_tokens.is_empty() {
        return 0.0;
    }
    let lcs = lcs_len(&reference_tokens, &candidate_tokens);
    lcs as f64 / reference_tokens.len() as f64
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for item_a in a {
        for (j, item_b) in b.iter().enumerate() {
            current[j + 1] = if item_a == item_b {
                prev[j] + 1
            } else {
                prev[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalforge_core::TestCategory;

    fn finished_case(expected: &str, actual: &str, passed: bool, score: f64) -> TestCase {
        let mut case = TestCase::new(
            Uuid::new_v4(),
            "c".into(),
            "in".into(),
            expected.into(),
            TestCategory::Normal,
        );
        case.status = if passed {
            TestCaseStatus::Passed
        } else {
            TestCaseStatus::Failed
        };
        case.actual_output = Some(actual.into());
        case.score = Some(score);
        case
    }

    #[test]
    fn confusion_matrix_accuracy_and_f1() {
        // yes/yes, yes/no, no/no, no/no
        let cases = vec![
            finished_case("yes", "yes", true, 1.0),
            finished_case("yes", "no", false, 0.0),
            finished_case("no", "no", true, 1.0),
            finished_case("no", "no", true, 1.0),
        ];
        let m = calculate_metrics(
            Uuid::new_v4(),
            TaskType::Classification,
            &cases,
            ExecutionTotals::default(),
        );

        assert!((m.accuracy.unwrap() - 0.75).abs() < 1e-9);
        assert!((m.pass_rate - 0.75).abs() < 1e-9);

        // "yes": tp=1 fp=0 fn=1 -> p=1, r=0.5, f1=2/3
        // "no":  tp=2 fp=1 fn=0 -> p=2/3, r=1, f1=0.8
        let macro_f1 = m.macro_f1.unwrap();
        assert!((macro_f1 - ((2.0 / 3.0 + 0.8) / 2.0)).abs() < 1e-9);
        // support(yes)=2, support(no)=2
        let weighted = m.weighted_f1.unwrap();
        assert!((weighted - ((2.0 / 3.0) * 2.0 + 0.8 * 2.0) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_over_zero_is_zero() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(f1(0.0, 0.0), 0.0);
    }

    #[test]
    fn bleu_identity_and_disjoint() {
        assert!((bleu("the cat sat on the mat", "the cat sat on the mat") - 1.0).abs() < 1e-9);
        assert_eq!(bleu("alpha beta gamma", "delta epsilon zeta"), 0.0);

        let partial = bleu("the cat sat on the mat", "the cat sat");
        assert!(partial > 0.0 && partial < 1.0, "brevity penalty applies: {partial}");
    }

    #[test]
    fn rouge_surfaces() {
        assert!((rouge_n("a b c d", "a b c d", 1) - 1.0).abs() < 1e-9);
        assert!((rouge_n("a b c d", "a b", 1) - 0.5).abs() < 1e-9);
        assert!((rouge_n("a b c", "a b x", 2) - 0.5).abs() < 1e-9);

        // LCS of "a b c d" and "a x b d" is "a b d".
        assert!((rouge_l("a b c d", "a x b d") - 0.75).abs() < 1e-9);
        assert_eq!(rouge_l("", "anything"), 0.0);
    }

    #[test]
    fn generation_metrics_averaged_over_cases() {
        let cases = vec![
            finished_case("the cat sat", "the cat sat", true, 1.0),
            finished_case("the dog ran", "a fish swam", false, 0.0),
        ];
        let m = calculate_metrics(
            Uuid::new_v4(),
            TaskType::Generation,
            &cases,
            ExecutionTotals {
                tokens: 100,
                cost: 0.01,
            },
        );
        assert!(m.accuracy.is_none());
        let bleu_avg = m.bleu.unwrap();
        assert!(bleu_avg > 0.0 && bleu_avg < 1.0);
        assert_eq!(m.total_tokens, 100);
        assert!((m.pass_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn skipped_and_errored_counted_but_not_scored() {
        let mut skipped = finished_case("x", "y", false, 0.0);
        skipped.status = TestCaseStatus::Skipped;
        skipped.score = None;
        skipped.actual_output = None;

        let mut errored = finished_case("x", "y", false, 0.0);
        errored.status = TestCaseStatus::Error;
        errored.score = None;
        errored.actual_output = None;

        let cases = vec![finished_case("x", "x", true, 1.0), skipped, errored];
        let m = calculate_metrics(
            Uuid::new_v4(),
            TaskType::Generation,
            &cases,
            ExecutionTotals::default(),
        );
        assert_eq!(m.total_cases, 3);
        assert_eq!(m.passed_cases, 1);
        assert_eq!(m.skipped_cases, 1);
        assert_eq!(m.error_cases, 1);
        assert!((m.pass_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((m.overall_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weights_shift_overall_score() {
        let mut heavy = finished_case("x", "x", true, 1.0);
        heavy.weight = 3.0;
        let light = finished_case("y", "z", false, 0.0);
        let m = calculate_metrics(
            Uuid::new_v4(),
            TaskType::Generation,
            &[heavy, light],
            ExecutionTotals::default(),
        );
        assert!((m.overall_score - 0.75).abs() < 1e-9);
    }
}
