//! Ranking parsing and aggregation.
//!
//! Stage-2 raters are asked to end their evaluation with a `FINAL RANKING:`
//! marker followed by a numbered list of anonymized labels. Models follow the
//! template imperfectly, so the parser degrades gracefully: numbered entries
//! after the marker, then any labels after the marker, then any labels in the
//! whole text.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::council::model::{ModelRanking, ModelResponse};

/// The exact marker raters are instructed to emit before their ranked list.
pub const RANKING_MARKER: &str = "FINAL RANKING:";

lazy_static! {
    static ref NUMBERED_LABEL_RE: Regex =
        Regex::new(r"\d+\.\s*Response [A-Z]").expect("invalid numbered-label pattern");
    static ref LABEL_RE: Regex = Regex::new(r"Response [A-Z]").expect("invalid label pattern");
}

/// Parse an ordered list of labels out of a rater's free text.
///
/// Duplicates are kept; the aggregator decides what repetition means.
pub fn parse_ranking(text: &str) -> Vec<String> {
    // Take the section after the *last* marker occurrence, so a rater that
    // quotes the instructions before answering still parses correctly.
    if let Some(idx) = text.rfind(RANKING_MARKER) {
        let section = &text[idx + RANKING_MARKER.len()..];

        let numbered: Vec<String> = NUMBERED_LABEL_RE
            .find_iter(section)
            .filter_map(|m| LABEL_RE.find(m.as_str()).map(|l| l.as_str().to_string()))
            .collect();
        if !numbered.is_empty() {
            return numbered;
        }

        return LABEL_RE
            .find_iter(section)
            .map(|m| m.as_str().to_string())
            .collect();
    }

    LABEL_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Bijection between anonymized labels and real model IDs, valid for one
/// stage-2 invocation. Labels are assigned `Response A`, `Response B`, … in
/// stage-1 insertion order.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    entries: Vec<(String, String)>,
}

/// The label alphabet is A–Z; stage-1 results beyond 26 get no label.
pub const MAX_LABELS: usize = 26;

impl LabelMap {
    /// Assign labels to stage-1 results in order.
    pub fn for_responses(stage1: &[ModelResponse]) -> Self {
        let entries = stage1
            .iter()
            .take(MAX_LABELS)
            .enumerate()
            .map(|(i, result)| {
                let label = format!("Response {}", (b'A' + i as u8) as char);
                (label, result.model.clone())
            })
            .collect();
        Self { entries }
    }

    pub fn model_for(&self, label: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, m)| m.as_str())
    }

    /// `(label, model)` pairs in assignment order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(l, m)| (l.as_str(), m.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object mapping label → model, for event metadata payloads.
    pub fn to_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (label, model) in &self.entries {
            map.insert(label.clone(), serde_json::Value::String(model.clone()));
        }
        serde_json::Value::Object(map)
    }
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRanking {
    pub model: String,
    pub average_rank: f64,
    pub rankings_count: usize,
}

/// Aggregate per-rater rankings into a mean-rank leaderboard.
///
/// Per rater, only the first occurrence of a label contributes its 1-based
/// position; labels outside the map are ignored. Rows sort ascending by mean
/// rank (lower is better), ties broken by higher `rankings_count`, then by
/// model ID.
pub fn aggregate_rankings(
    stage2: &[ModelRanking],
    label_map: &LabelMap,
) -> Vec<AggregateRanking> {
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();

    for ranking in stage2 {
        let parsed = parse_ranking(&ranking.ranking);
        let mut seen: HashSet<&str> = HashSet::new();
        for (idx, label) in parsed.iter().enumerate() {
            if !seen.insert(label.as_str()) {
                continue;
            }
            if let Some(model) = label_map.model_for(label) {
                positions.entry(model.to_string()).or_default().push(idx + 1);
            }
        }
    }

    let mut aggregate: Vec<AggregateRanking> = positions
        .into_iter()
        .filter(|(_, p)| !p.is_empty())
        .map(|(model, p)| {
            let mean = p.iter().sum::<usize>() as f64 / p.len() as f64;
            AggregateRanking {
                model,
                average_rank: (mean * 100.0).round() / 100.0,
                rankings_count: p.len(),
            }
        })
        .collect();

    aggregate.sort_by(|a, b| {
        a.average_rank
            .partial_cmp(&b.average_rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.rankings_count.cmp(&a.rankings_count))
            .then_with(|| a.model.cmp(&b.model))
    });

    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responses(models: &[&str]) -> Vec<ModelResponse> {
        models
            .iter()
            .map(|m| ModelResponse {
                model: m.to_string(),
                response: format!("answer from {}", m),
            })
            .collect()
    }

    fn ranking(model: &str, text: &str) -> ModelRanking {
        ModelRanking {
            model: model.to_string(),
            ranking: text.to_string(),
            parsed_ranking: parse_ranking(text),
        }
    }

    #[test]
    fn test_parse_with_marker_and_numbered_list() {
        let text = "A is okay. B is better.\n\nFINAL RANKING:\n1. Response B\n2. Response A";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_without_marker_falls_back_to_all_labels() {
        let text = "Response A Response C Response B";
        assert_eq!(
            parse_ranking(text),
            vec!["Response A", "Response C", "Response B"]
        );
    }

    #[test]
    fn test_parse_marker_without_numbers_uses_section_labels() {
        let text = "Prose mentioning Response C early.\nFINAL RANKING:\nResponse B then Response A";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_uses_last_marker_occurrence() {
        let text = "The format is FINAL RANKING: 1. Response X as shown.\n\
                    My evaluation follows.\n\
                    FINAL RANKING:\n1. Response A\n2. Response B";
        assert_eq!(parse_ranking(text), vec!["Response A", "Response B"]);
    }

    #[test]
    fn test_parse_keeps_duplicates() {
        let text = "FINAL RANKING:\n1. Response A\n2. Response A\n3. Response B";
        assert_eq!(
            parse_ranking(text),
            vec!["Response A", "Response A", "Response B"]
        );
    }

    #[test]
    fn test_parse_round_trips_rendered_template() {
        // parse(render(order)) == order for template-conforming output.
        let order = vec!["Response C", "Response A", "Response B"];
        let rendered = format!(
            "Some evaluation prose.\n\nFINAL RANKING:\n{}",
            order
                .iter()
                .enumerate()
                .map(|(i, l)| format!("{}. {}", i + 1, l))
                .collect::<Vec<_>>()
                .join("\n")
        );
        assert_eq!(parse_ranking(&rendered), order);
    }

    #[test]
    fn test_label_map_is_alphabet_prefix_in_insertion_order() {
        let map = LabelMap::for_responses(&responses(&["m1", "m2", "m3"]));
        let pairs: Vec<(&str, &str)> = map.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("Response A", "m1"),
                ("Response B", "m2"),
                ("Response C", "m3"),
            ]
        );
        assert_eq!(map.model_for("Response B"), Some("m2"));
        assert_eq!(map.model_for("Response Z"), None);
    }

    #[test]
    fn test_aggregate_mean_and_sorting() {
        let map = LabelMap::for_responses(&responses(&["m1", "m2"]));
        let stage2 = vec![
            ranking("m1", "FINAL RANKING:\n1. Response A\n2. Response B"),
            ranking("m2", "FINAL RANKING:\n1. Response B\n2. Response A"),
            ranking("m3", "FINAL RANKING:\n1. Response A\n2. Response B"),
        ];
        let agg = aggregate_rankings(&stage2, &map);
        assert_eq!(agg.len(), 2);
        // m1: positions [1, 2, 1] → 1.33; m2: [2, 1, 2] → 1.67
        assert_eq!(agg[0].model, "m1");
        assert_eq!(agg[0].average_rank, 1.33);
        assert_eq!(agg[0].rankings_count, 3);
        assert_eq!(agg[1].model, "m2");
        assert_eq!(agg[1].average_rank, 1.67);
    }

    #[test]
    fn test_aggregate_tie_breaks_by_count_then_model() {
        let map = LabelMap::for_responses(&responses(&["alpha", "beta"]));
        // alpha ranked once at 1; beta ranked twice at 1 → same mean, beta
        // wins on count.
        let stage2 = vec![
            ranking("r1", "FINAL RANKING:\n1. Response B"),
            ranking("r2", "FINAL RANKING:\n1. Response B"),
            ranking("r3", "FINAL RANKING:\n1. Response A"),
        ];
        let agg = aggregate_rankings(&stage2, &map);
        assert_eq!(agg[0].model, "beta");
        assert_eq!(agg[1].model, "alpha");

        // Equal mean and count → lexicographic model order.
        let stage2 = vec![
            ranking("r1", "FINAL RANKING:\n1. Response A"),
            ranking("r2", "FINAL RANKING:\n1. Response B"),
        ];
        let agg = aggregate_rankings(&stage2, &map);
        assert_eq!(agg[0].model, "alpha");
        assert_eq!(agg[1].model, "beta");
    }

    #[test]
    fn test_aggregate_counts_first_occurrence_only() {
        let map = LabelMap::for_responses(&responses(&["m1", "m2"]));
        let stage2 = vec![ranking(
            "r1",
            "FINAL RANKING:\n1. Response A\n2. Response A\n3. Response B",
        )];
        let agg = aggregate_rankings(&stage2, &map);
        let m1 = agg.iter().find(|r| r.model == "m1").unwrap();
        assert_eq!(m1.rankings_count, 1);
        assert_eq!(m1.average_rank, 1.0);
        // The duplicate still occupies position 2, so m2 lands at 3.
        let m2 = agg.iter().find(|r| r.model == "m2").unwrap();
        assert_eq!(m2.average_rank, 3.0);
    }

    #[test]
    fn test_aggregate_ignores_unknown_labels() {
        let map = LabelMap::for_responses(&responses(&["m1"]));
        let stage2 = vec![ranking("r1", "FINAL RANKING:\n1. Response Z\n2. Response A")];
        let agg = aggregate_rankings(&stage2, &map);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].model, "m1");
        assert_eq!(agg[0].average_rank, 2.0);
    }

    #[test]
    fn test_single_member_council_is_trivial() {
        let map = LabelMap::for_responses(&responses(&["only"]));
        let stage2 = vec![ranking("only", "FINAL RANKING:\n1. Response A")];
        let agg = aggregate_rankings(&stage2, &map);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].average_rank, 1.0);
        assert_eq!(agg[0].rankings_count, 1);
    }
}
