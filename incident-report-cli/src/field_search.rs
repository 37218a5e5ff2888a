//! Fuzzy field-name discovery for template maintenance.
//!
//! Only used offline from the CLI: when a template revision renames fields,
//! this proposes the closest existing names for every mapping target that no
//! longer resolves. Nothing here runs during report generation.

use nucleo_matcher::pattern::{CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Matcher, Utf32String};

pub struct FieldSearch {
    matcher: Matcher,
}

impl Default for FieldSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldSearch {
    pub fn new() -> Self {
        Self {
            matcher: Matcher::new(nucleo_matcher::Config::DEFAULT),
        }
    }

    /// Rank `candidates` against `query`; returns (name, score) with the best
    /// match scored 1.0.
    ///
    /// Each word of the query is matched on its own and the scores summed, so
    /// a candidate with one misspelt word still ranks on the words it shares.
    pub fn suggest(&mut self, query: &str, candidates: &[&str], limit: usize) -> Vec<(String, f32)> {
        let patterns: Vec<Pattern> = query
            .split(|c: char| c == '_' || c == '.' || c.is_whitespace())
            .filter(|word| !word.is_empty())
            .map(|word| Pattern::parse(word, CaseMatching::Ignore, Normalization::Smart))
            .collect();

        let mut scored: Vec<(&str, u32)> = candidates
            .iter()
            .filter_map(|candidate| {
                let haystack = Utf32String::from(*candidate);
                let total: u32 = patterns
                    .iter()
                    .filter_map(|pattern| pattern.score(haystack.slice(..), &mut self.matcher))
                    .sum();
                (total > 0).then_some((*candidate, total))
            })
            .collect();

        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        scored.truncate(limit);

        let max_score = scored.first().map(|(_, s)| *s as f32).unwrap_or(1.0);
        scored
            .into_iter()
            .map(|(name, score)| {
                let normalized = if max_score > 0.0 { score as f32 / max_score } else { 0.0 };
                (name.to_string(), normalized)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misspelt_field_is_found() {
        let candidates = [
            "visability_severely_restricted",
            "visibility_good",
            "road_surface_wet",
            "driver_first_name",
        ];
        let mut search = FieldSearch::new();
        let suggestions = search.suggest("visibility_severely_restricted", &candidates, 3);

        assert_eq!(suggestions[0].0, "visability_severely_restricted");
        assert_eq!(suggestions[0].1, 1.0);
        assert!(!suggestions.iter().any(|(name, _)| name == "driver_first_name"));
    }

    #[test]
    fn test_no_candidates() {
        let mut search = FieldSearch::new();
        assert!(search.suggest("witness_name", &[], 5).is_empty());
    }
}
