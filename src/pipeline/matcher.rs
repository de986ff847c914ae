//! Block identity matching.
//!
//! Vision models echo block ids back imperfectly: case changes, dropped
//! separators, the odd misread character. This module reconciles a model
//! response against the requested id set using exact, normalized, and
//! bounded-fuzzy matching. The edit distance is deliberately small and
//! specialized to the 11-character ArmorID format.

use std::collections::HashMap;

use crate::models::normalize_id;

/// Classic two-row Levenshtein distance. Inputs are short ids, so no cutoff
/// tricks are needed.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Match quality, lower is better. Exact beats normalized beats fuzzy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Quality {
    Exact,
    Normalized,
    Fuzzy(usize),
}

fn best_candidate(
    response_id: &str,
    requested: &[String],
    fuzzy_threshold: u32,
) -> Option<(usize, Quality)> {
    let normalized = normalize_id(response_id);
    let mut best: Option<(usize, Quality)> = None;
    for (index, candidate) in requested.iter().enumerate() {
        let quality = if candidate == response_id {
            Quality::Exact
        } else if normalize_id(candidate) == normalized {
            Quality::Normalized
        } else {
            let distance = levenshtein(&normalize_id(candidate), &normalized);
            if distance as u32 > fuzzy_threshold {
                continue;
            }
            Quality::Fuzzy(distance)
        };
        match best {
            Some((_, current)) if current <= quality => {}
            _ => best = Some((index, quality)),
        }
    }
    best
}

/// Extract (id, text) pairs from a model response.
///
/// The batch prompt asks for a JSON object keyed by id, so that is tried
/// first (with code fences stripped). A JSON array matching the requested
/// count assigns by position. Otherwise `ID: text` lines are parsed, with
/// continuation lines folded into the previous entry.
fn extract_pairs(response: &str, requested: &[String]) -> Vec<(String, String)> {
    let trimmed = strip_code_fences(response);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        match value {
            serde_json::Value::Object(map) => {
                return map
                    .into_iter()
                    .map(|(k, v)| (k, value_to_text(v)))
                    .collect();
            }
            serde_json::Value::Array(items) if items.len() == requested.len() => {
                return requested
                    .iter()
                    .cloned()
                    .zip(items.into_iter().map(value_to_text))
                    .collect();
            }
            _ => {}
        }
    }

    // Line-based fallback: "AAAA-BBBB-001: text".
    let mut pairs: Vec<(String, String)> = Vec::new();
    for line in trimmed.lines() {
        if let Some((head, tail)) = line.split_once(':') {
            let head = head.trim().trim_matches(|c| c == '"' || c == '*');
            if head.len() >= 8 && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                pairs.push((head.to_string(), tail.trim().to_string()));
                continue;
            }
        }
        if let Some(last) = pairs.last_mut() {
            if !line.trim().is_empty() {
                if !last.1.is_empty() {
                    last.1.push('\n');
                }
                last.1.push_str(line.trim_end());
            }
        }
    }
    pairs
}

fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn value_to_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Reconcile a strip response against the requested ids.
///
/// Each requested id is claimed at most once; when two response entries
/// compete, the higher-quality match wins. Requested ids with no assignment
/// are simply absent from the map (the verification pass picks them up).
pub fn match_response(
    response: &str,
    requested: &[String],
    fuzzy_threshold: u32,
) -> HashMap<String, String> {
    let pairs = extract_pairs(response, requested);

    // Rank candidate assignments so exact matches claim their id first.
    let mut ranked: Vec<(usize, Quality, String)> = pairs
        .into_iter()
        .filter_map(|(response_id, text)| {
            best_candidate(&response_id, requested, fuzzy_threshold)
                .map(|(index, quality)| (index, quality, text))
        })
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1));

    let mut assigned: HashMap<String, String> = HashMap::new();
    for (index, _, text) in ranked {
        let id = &requested[index];
        assigned.entry(id.clone()).or_insert(text);
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested() -> Vec<String> {
        vec!["XYZ9-AAAA-001".to_string(), "XYZ9-AAAA-002".to_string()]
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", "abd"), 1);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("XYZAAAA001", "XYZAAAA01Z"), 2);
    }

    #[test]
    fn test_exact_json_response() {
        let response = r#"{"XYZ9-AAAA-001": "first", "XYZ9-AAAA-002": "second"}"#;
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "first");
        assert_eq!(matched["XYZ9-AAAA-002"], "second");
    }

    #[test]
    fn test_mangled_ids_recovered() {
        // Lowercased id and a two-character typo, as models actually do.
        let response = r#"{"xyz9-aaaa-001": "first", "XYZ9-AAAA-02Z": "second"}"#;
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "first");
        assert_eq!(matched["XYZ9-AAAA-002"], "second");
    }

    #[test]
    fn test_unrelated_ids_stay_unmatched() {
        let response = r#"{"QQQQ-QQQQ-999": "noise"}"#;
        let matched = match_response(response, &requested(), 2);
        assert!(matched.is_empty());
    }

    #[test]
    fn test_fenced_json() {
        let response = "```json\n{\"XYZ9-AAAA-001\": \"first\"}\n```";
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "first");
    }

    #[test]
    fn test_array_assigns_by_position() {
        let response = r#"["first", "second"]"#;
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "first");
        assert_eq!(matched["XYZ9-AAAA-002"], "second");
    }

    #[test]
    fn test_line_based_fallback_with_continuation() {
        let response = "XYZ9-AAAA-001: first line\nsecond line\nXYZ9-AAAA-002: other";
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "first line\nsecond line");
        assert_eq!(matched["XYZ9-AAAA-002"], "other");
    }

    #[test]
    fn test_conflict_prefers_exact_match() {
        // Both entries resolve to -001, but one is exact: it must win.
        let response = r#"{"XYZ9-AAAA-001": "exact", "xyz9aaaa001": "normalized"}"#;
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "exact");
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn test_missing_entry_absent_from_map() {
        let response = r#"{"XYZ9-AAAA-001": "only one"}"#;
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched.len(), 1);
        assert!(!matched.contains_key("XYZ9-AAAA-002"));
    }

    #[test]
    fn test_non_string_values_stringified() {
        let response = r#"{"XYZ9-AAAA-001": 42}"#;
        let matched = match_response(response, &requested(), 2);
        assert_eq!(matched["XYZ9-AAAA-001"], "42");
    }
}
