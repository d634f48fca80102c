//! Recovery of candidate records from model output that may be fenced,
//! wrapped in prose, or truncated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use keystone_store::CandidateSet;

pub const KEY_EXTRACTED_SYSTEMS: &str = "extractedSystems";
pub const KEY_EXTRACTED_DETAILS: &str = "extractedSystemDetails";
pub const KEY_SUGGESTED_SYSTEMS: &str = "suggestedSystems";
pub const KEY_SUGGESTED_DETAILS: &str = "suggestedSystemDetails";

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence regex")
});

static KEY_RES: LazyLock<[(&'static str, Regex); 4]> = LazyLock::new(|| {
    [
        KEY_EXTRACTED_SYSTEMS,
        KEY_EXTRACTED_DETAILS,
        KEY_SUGGESTED_SYSTEMS,
        KEY_SUGGESTED_DETAILS,
    ]
    .map(|key| {
        let re = Regex::new(&format!(r#""{key}"\s*:\s*\["#)).expect("key regex");
        (key, re)
    })
});

/// Which fallback tier produced the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseTier {
    /// The whole reply or one of its fenced blocks parsed as an object.
    Direct,
    /// First complete object found inside surrounding prose.
    Embedded,
    /// Individual arrays located by key.
    Regex,
    /// Nothing recoverable.
    None,
}

impl ParseTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Embedded => "embedded",
            Self::Regex => "regex",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for ParseTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parser result. Never an error: the raw text is always kept so a reviewer
/// can salvage it by hand.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedResponse {
    pub candidates: CandidateSet,
    pub tier: ParseTier,
    pub raw_content: String,
}

/// Run the fallback chain over a model reply.
pub fn parse_response(raw: &str) -> ParsedResponse {
    if let Some((object, tier)) = extract_object_with_tier(raw, has_candidate_key) {
        return ParsedResponse {
            candidates: candidates_from_object(&object),
            tier,
            raw_content: raw.to_string(),
        };
    }

    let mut found_any = false;
    let mut arrays: Map<String, Value> = Map::new();
    for (key, re) in KEY_RES.iter() {
        let Some(m) = re.find(raw) else { continue };
        let open = m.end() - 1;
        let Some(close) = match_brackets(raw, open) else {
            debug!(key, "array literal not terminated");
            continue;
        };
        match serde_json::from_str::<Value>(&raw[open..=close]) {
            Ok(value @ Value::Array(_)) => {
                found_any = true;
                arrays.insert((*key).to_string(), value);
            }
            Ok(_) | Err(_) => debug!(key, "array literal not parseable"),
        }
    }

    let tier = if found_any { ParseTier::Regex } else { ParseTier::None };
    debug!(%tier, "structured parse fell back");
    ParsedResponse {
        candidates: candidates_from_object(&arrays),
        tier,
        raw_content: raw.to_string(),
    }
}

/// First two tiers only: a JSON object either as the whole (optionally
/// fenced) reply or embedded in prose.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    extract_object_with_tier(raw, |_| true).map(|(object, _)| object)
}

fn has_candidate_key(object: &Map<String, Value>) -> bool {
    [
        KEY_EXTRACTED_SYSTEMS,
        KEY_EXTRACTED_DETAILS,
        KEY_SUGGESTED_SYSTEMS,
        KEY_SUGGESTED_DETAILS,
    ]
    .iter()
    .any(|key| object.contains_key(*key))
}

/// Objects are tried in order: the whole reply, each fenced block, then each
/// complete object embedded in prose. The first one passing `accept` wins,
/// so an example object shown before the answer is passed over.
fn extract_object_with_tier(
    raw: &str,
    accept: fn(&Map<String, Value>) -> bool,
) -> Option<(Map<String, Value>, ParseTier)> {
    let fenced = FENCE_RE
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()));
    for payload in std::iter::once(raw).chain(fenced) {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(payload.trim()) {
            if accept(&object) {
                return Some((object, ParseTier::Direct));
            }
        }
    }

    // Spans learned by earlier scans; an unclosed brace is scanned once.
    let mut spans: BTreeMap<usize, Option<usize>> = BTreeMap::new();
    let mut from = 0;
    while let Some(offset) = raw[from..].find('{') {
        let start = from + offset;
        if !spans.contains_key(&start) {
            spans.extend(bracket_spans(raw, start));
        }
        if let Some(Some(end)) = spans.get(&start).copied() {
            if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&raw[start..=end]) {
                if accept(&object) {
                    return Some((object, ParseTier::Embedded));
                }
            }
        }
        from = start + 1;
    }
    None
}

/// Index of the bracket closing the one at `start`, honouring string
/// literals and escapes. `None` if the text ends first.
fn match_brackets(text: &str, start: usize) -> Option<usize> {
    bracket_spans(text, start).get(&start).copied().flatten()
}

/// Scan from the bracket at `start` until it closes, recording the closing
/// index of every bracket opened on the way (`None` for those still open
/// when the text ends).
fn bracket_spans(text: &str, start: usize) -> BTreeMap<usize, Option<usize>> {
    let mut spans = BTreeMap::new();
    let mut open: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => open.push(i),
            b'}' | b']' => {
                let Some(opened) = open.pop() else { break };
                spans.insert(opened, Some(i));
                if open.is_empty() {
                    return spans;
                }
            }
            _ => {}
        }
        if open.is_empty() {
            break;
        }
    }
    spans.extend(open.into_iter().map(|i| (i, None)));
    spans
}

fn candidates_from_object(object: &Map<String, Value>) -> CandidateSet {
    CandidateSet {
        extracted_systems: candidate_list(object, KEY_EXTRACTED_SYSTEMS),
        extracted_system_details: candidate_list(object, KEY_EXTRACTED_DETAILS),
        suggested_systems: candidate_list(object, KEY_SUGGESTED_SYSTEMS),
        suggested_system_details: candidate_list(object, KEY_SUGGESTED_DETAILS),
    }
}

/// Elements that are not objects with a non-empty string `name` are dropped
/// one by one.
fn candidate_list<T: DeserializeOwned>(object: &Map<String, Value>, key: &str) -> Vec<T> {
    let Some(Value::Array(items)) = object.get(key) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let named = item
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| !n.trim().is_empty());
            if !named {
                debug!(key, index, "dropping candidate without a name");
                return None;
            }
            match serde_json::from_value::<T>(item.clone()) {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    debug!(key, index, error = %e, "dropping malformed candidate");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::candidates::{DetailCandidate, SystemCandidate};
    use serde_json::json;

    fn names(list: &[SystemCandidate]) -> Vec<&str> {
        list.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn bare_object_parses_directly() {
        let raw = r#"{"extractedSystems":[{"name":"Combat","systemSlug":"combat"}],"extractedSystemDetails":[{"name":"Crits","targetSystemSlug":"combat"}]}"#;
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Direct);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Combat"]);
        assert_eq!(
            parsed.candidates.extracted_system_details[0].target_system_slug.as_deref(),
            Some("combat")
        );
        assert_eq!(parsed.raw_content, raw);
    }

    #[test]
    fn fenced_object_parses_directly() {
        let raw = "```json\n{\"extractedSystems\":[{\"name\":\"Health\"}],\"extractedSystemDetails\":[]}\n```";
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Direct);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Health"]);

        let bare_fence = "```\n{\"extractedSystems\":[{\"name\":\"Loot\"}]}\n```";
        assert_eq!(parse_response(bare_fence).tier, ParseTier::Direct);
    }

    #[test]
    fn matches_serde_on_valid_objects() {
        let value = json!({
            "extractedSystems": [
                {"name": "Combat", "systemSlug": "combat", "purpose": "fights", "dependencies": ["health"]},
                {"name": "Health", "mvpCriticality": "core"}
            ],
            "extractedSystemDetails": [{"name": "Damage types", "detailType": "mechanic", "spec": "fire, ice"}]
        });
        let parsed = parse_response(&value.to_string());
        let expected: Vec<SystemCandidate> =
            serde_json::from_value(value["extractedSystems"].clone()).unwrap();
        let expected_details: Vec<DetailCandidate> =
            serde_json::from_value(value["extractedSystemDetails"].clone()).unwrap();
        assert_eq!(parsed.candidates.extracted_systems, expected);
        assert_eq!(parsed.candidates.extracted_system_details, expected_details);
    }

    #[test]
    fn example_fence_before_answer_is_passed_over() {
        let raw = "The schema is:\n```json\n{\"name\": \"string\", \"systemSlug\": \"string\"}\n```\n\
Here is my answer:\n```json\n{\"extractedSystems\":[{\"name\":\"Combat\"}],\"extractedSystemDetails\":[]}\n```";
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Direct);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Combat"]);
    }

    #[test]
    fn unclosed_prose_brace_does_not_hide_later_object() {
        let raw = r#"Open { bracket and then {"extractedSystems":[{"name":"Trading"}]} later"#;
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Embedded);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Trading"]);
    }

    #[test]
    fn bracket_spans_records_nested_opens() {
        let text = r#"x { "a": [1, {"b": 2}] tail"#;
        let spans = bracket_spans(text, 2);
        assert_eq!(spans[&2], None);
        assert_eq!(spans[&9], Some(21));
        assert_eq!(spans[&13], Some(20));
    }

    #[test]
    fn embedded_object_with_braces_in_strings() {
        let raw = r#"Sure! Here is the result:
{"extractedSystems":[{"name":"Parser","purpose":"Use { and } safely \"quoted\""}],"extractedSystemDetails":[]}
Let me know if you need more."#;
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Embedded);
        assert_eq!(
            parsed.candidates.extracted_systems[0].purpose.as_deref(),
            Some("Use { and } safely \"quoted\"")
        );
    }

    #[test]
    fn embedded_scan_skips_non_json_braces() {
        let raw = r#"Note {not json} then {"extractedSystems":[{"name":"Crafting"}]}"#;
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Embedded);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Crafting"]);
    }

    #[test]
    fn regex_fallback_recovers_bare_array() {
        let raw = r#"{"extractedSystems": [{"name": "Combat"}, {"name": "Health"}], "extractedSystemDetails": [{"name": "broken"#;
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::Regex);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Combat", "Health"]);
        assert!(parsed.candidates.extracted_system_details.is_empty());
    }

    #[test]
    fn non_json_degrades_to_empty() {
        let raw = "I could not find any systems in these notes.";
        let parsed = parse_response(raw);
        assert_eq!(parsed.tier, ParseTier::None);
        assert!(parsed.candidates.is_empty());
        assert_eq!(parsed.raw_content, raw);
    }

    #[test]
    fn top_level_array_is_not_an_object() {
        let parsed = parse_response(r#"[{"name":"Combat"}]"#);
        assert_eq!(parsed.tier, ParseTier::None);
        assert!(parsed.candidates.extracted_systems.is_empty());
    }

    #[test]
    fn invalid_elements_dropped_individually() {
        let raw = r#"{"extractedSystems":[{"name":"Combat"},"oops",{"purpose":"no name"},{"name":""},{"name":42},{"name":"Health"}]}"#;
        let parsed = parse_response(raw);
        assert_eq!(names(&parsed.candidates.extracted_systems), vec!["Combat", "Health"]);
    }

    #[test]
    fn suggested_keys_are_recovered() {
        let raw = r#"{"extractedSystems":[],"suggestedSystems":[{"name":"Stamina"}],"suggestedSystemDetails":[{"name":"Regen"}]}"#;
        let parsed = parse_response(raw);
        assert_eq!(names(&parsed.candidates.suggested_systems), vec!["Stamina"]);
        assert_eq!(parsed.candidates.suggested_system_details[0].name, "Regen");
    }

    #[test]
    fn extract_json_object_for_evolve_replies() {
        let raw = "Bumped the version.\n```json\n{\"updates\": {\"version\": \"v0.2\"}}\n```";
        let object = extract_json_object(raw).unwrap();
        assert_eq!(object["updates"]["version"], "v0.2");
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn bracket_matcher_handles_escapes() {
        let text = r#"{"a":"\\"}"#;
        assert_eq!(match_brackets(text, 0), Some(text.len() - 1));
        assert_eq!(match_brackets(r#"{"a": [1, 2"#, 0), None);
    }
}
