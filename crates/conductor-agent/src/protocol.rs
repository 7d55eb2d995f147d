//! Parsing of the textual directives a model emits in its responses.
//!
//! Each matcher is a pure function tried in order; the first hit wins and
//! anything no matcher recognizes is a conversational answer.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub const FINAL_ANSWER_MARKER: &str = "FINAL_ANSWER:";
pub const TOOL_CALL_MARKER: &str = "TOOL_CALL:";
pub const PARAMS_MARKER: &str = "PARAMS:";

/// What a model response asks the executor to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// Stop with this answer.
    FinalAnswer(String),
    /// Invoke a tool. `thought` is any reasoning text before the directive.
    ToolCall {
        name: String,
        params: Value,
        thought: String,
    },
    /// Off-protocol text, taken as the answer.
    Unknown(String),
}

type Matcher = fn(&str) -> Option<ParsedResponse>;

const MATCHERS: &[Matcher] = &[match_final_answer, match_tool_call];

/// Parse a raw model response.
pub fn parse_response(text: &str) -> ParsedResponse {
    MATCHERS
        .iter()
        .find_map(|m| m(text))
        .unwrap_or_else(|| ParsedResponse::Unknown(text.trim().to_string()))
}

/// `FINAL_ANSWER:` anywhere in the text; the answer is everything after it.
pub fn match_final_answer(text: &str) -> Option<ParsedResponse> {
    let pos = text.find(FINAL_ANSWER_MARKER)?;
    let answer = text[pos + FINAL_ANSWER_MARKER.len()..].trim();
    Some(ParsedResponse::FinalAnswer(answer.to_string()))
}

fn tool_call_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TOOL_CALL:\s*(\w+)").ok())
        .as_ref()
}

/// `TOOL_CALL: <name>` optionally followed by `PARAMS: <json object>`.
pub fn match_tool_call(text: &str) -> Option<ParsedResponse> {
    let caps = tool_call_regex()?.captures(text)?;
    let whole = caps.get(0)?;
    let name = caps.get(1)?.as_str().to_string();

    let thought = text[..whole.start()]
        .trim()
        .trim_start_matches("Thought:")
        .trim()
        .to_string();
    let params = extract_params(&text[whole.end()..]);

    Some(ParsedResponse::ToolCall {
        name,
        params,
        thought,
    })
}

/// First JSON object after `PARAMS:`. Missing or malformed → `{}`.
pub fn extract_params(text: &str) -> Value {
    let empty = || Value::Object(Default::default());
    let Some(pos) = text.find(PARAMS_MARKER) else {
        return empty();
    };
    let rest = &text[pos + PARAMS_MARKER.len()..];
    let Some(brace) = rest.find('{') else {
        return empty();
    };

    let mut stream = serde_json::Deserializer::from_str(&rest[brace..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(v @ Value::Object(_))) => v,
        _ => empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_answer_is_trimmed_tail() {
        assert_eq!(
            parse_response("Thinking done.\nFINAL_ANSWER:   Paris is the capital.  \n"),
            ParsedResponse::FinalAnswer("Paris is the capital.".into())
        );
    }

    #[test]
    fn final_answer_wins_over_earlier_tool_call() {
        let text = "TOOL_CALL: search\nPARAMS: {\"q\": \"x\"}\nFINAL_ANSWER: done";
        assert_eq!(
            parse_response(text),
            ParsedResponse::FinalAnswer("done".into())
        );
    }

    #[test]
    fn tool_call_with_params() {
        let text = "I should look this up.\nTOOL_CALL: echo\nPARAMS: {\"x\": 1, \"nested\": {\"y\": [1, 2]}}\nextra";
        match parse_response(text) {
            ParsedResponse::ToolCall {
                name,
                params,
                thought,
            } => {
                assert_eq!(name, "echo");
                assert_eq!(params, json!({"x": 1, "nested": {"y": [1, 2]}}));
                assert_eq!(thought, "I should look this up.");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn thought_prefix_is_stripped() {
        match parse_response("Thought: need data\nTOOL_CALL:read_file") {
            ParsedResponse::ToolCall { thought, name, .. } => {
                assert_eq!(thought, "need data");
                assert_eq!(name, "read_file");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn malformed_params_degrade_to_empty_object() {
        match parse_response("TOOL_CALL: echo\nPARAMS: {not json}") {
            ParsedResponse::ToolCall { params, .. } => assert_eq!(params, json!({})),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_params_is_empty_object() {
        assert_eq!(extract_params("nothing here"), json!({}));
        assert_eq!(extract_params("PARAMS: none"), json!({}));
    }

    #[test]
    fn params_inside_code_fence() {
        assert_eq!(
            extract_params("\nPARAMS: ```json\n{\"a\": \"b\"}\n```"),
            json!({"a": "b"})
        );
    }

    #[test]
    fn anything_else_is_unknown() {
        assert_eq!(
            parse_response("  Just chatting.  "),
            ParsedResponse::Unknown("Just chatting.".into())
        );
        // Marker without a tool name is not a call.
        assert!(matches!(
            parse_response("TOOL_CALL: "),
            ParsedResponse::Unknown(_)
        ));
    }
}
