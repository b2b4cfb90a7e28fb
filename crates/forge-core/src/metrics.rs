//! Parsing of trainer output metric lines.
//!
//! The external trainer contract: on success it prints at least one
//! `metric_name: value` line, e.g. `final_loss: 0.42`. Parsing is
//! best-effort; unparseable output yields an empty map, never an error.

use std::collections::BTreeMap;

/// Extract `key: value` metric lines from combined trainer output.
///
/// A line counts as a metric when the part before the first `:` trims to a
/// single identifier-like token and the part after parses as `f64`. The
/// last occurrence of a key wins, so trainers may stream intermediate
/// values and finish with finals.
pub fn parse_metric_lines(output: &str) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if !is_metric_key(key) {
            continue;
        }
        if let Ok(value) = value.parse::<f64>() {
            metrics.insert(key.to_string(), value);
        }
    }

    metrics
}

fn is_metric_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_metric() {
        let metrics = parse_metric_lines("final_loss: 0.42\n");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["final_loss"], 0.42);
    }

    #[test]
    fn test_multiple_metrics() {
        let out = "epoch: 3\nfinal_loss: 0.42\neval_accuracy: 0.91\n";
        let metrics = parse_metric_lines(out);
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics["epoch"], 3.0);
        assert_eq!(metrics["eval_accuracy"], 0.91);
    }

    #[test]
    fn test_last_value_wins() {
        let out = "loss: 1.5\nloss: 0.8\nloss: 0.42\n";
        let metrics = parse_metric_lines(out);
        assert_eq!(metrics["loss"], 0.42);
    }

    #[test]
    fn test_ignores_prose_lines() {
        let out = "loading dataset from /tmp/math.jsonl\n\
                   warning: deprecated flag --fp16\n\
                   final_loss: 0.42\n";
        let metrics = parse_metric_lines(out);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["final_loss"], 0.42);
    }

    #[test]
    fn test_ignores_multi_word_keys() {
        // "warning" style prose with a colon must not become a metric.
        let metrics = parse_metric_lines("total time elapsed: 120.5\n");
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_ignores_non_numeric_values() {
        let metrics = parse_metric_lines("status: done\nfinal_loss: 0.42\n");
        assert_eq!(metrics.len(), 1);
    }

    #[test]
    fn test_negative_and_scientific_values() {
        let out = "log_prob: -2.31\nlearning_rate: 2e-4\n";
        let metrics = parse_metric_lines(out);
        assert_eq!(metrics["log_prob"], -2.31);
        assert_eq!(metrics["learning_rate"], 2e-4);
    }

    #[test]
    fn test_whitespace_tolerance() {
        let metrics = parse_metric_lines("  final_loss :   0.42  \n");
        assert_eq!(metrics["final_loss"], 0.42);
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_metric_lines("").is_empty());
    }

    #[test]
    fn test_garbage_output() {
        let out = "Traceback (most recent call last):\n  File \"train.py\", line 3\n";
        assert!(parse_metric_lines(out).is_empty());
    }

    #[test]
    fn test_key_must_start_alphabetic_or_underscore() {
        let metrics = parse_metric_lines("2nd_loss: 0.1\n_hidden: 0.2\n");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["_hidden"], 0.2);
    }

    #[test]
    fn test_dotted_and_slashed_keys() {
        let out = "eval.loss: 0.3\ntrain/accuracy: 0.95\n";
        let metrics = parse_metric_lines(out);
        assert_eq!(metrics["eval.loss"], 0.3);
        assert_eq!(metrics["train/accuracy"], 0.95);
    }
}
