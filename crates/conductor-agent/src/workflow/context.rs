use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key the workflow input is stored under.
pub const INPUT_KEY: &str = "input";

/// Last-writer-wins key/value bag shared by the nodes of one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    data: HashMap<String, Value>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the workflow input.
    pub fn with_input(input: &str) -> Self {
        let mut ctx = Self::new();
        ctx.set_str(INPUT_KEY, input);
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    /// Store a node's output under its id.
    ///
    /// When the output is a JSON object its top-level keys are merged in as
    /// well, overwriting earlier writers.
    pub fn ingest_output(&mut self, node_id: &str, output: &str) {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(output.trim()) {
            for (k, v) in obj {
                self.data.insert(k, v);
            }
        }
        self.set_str(node_id, output);
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Point-in-time copy as a JSON object (keys sorted).
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_operations() {
        let mut ctx = SharedContext::with_input("hello");
        ctx.set("count", json!(42));
        assert_eq!(ctx.get_str(INPUT_KEY), Some("hello"));
        assert_eq!(ctx.get("count"), Some(&json!(42)));
        assert_eq!(ctx.get("missing"), None);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn ingest_plain_text() {
        let mut ctx = SharedContext::new();
        ctx.ingest_output("draft", "Some prose.");
        assert_eq!(ctx.get_str("draft"), Some("Some prose."));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn ingest_json_object_merges_keys() {
        let mut ctx = SharedContext::new();
        ctx.set_str("verdict", "old");
        ctx.ingest_output("review", r#"{"verdict": "pass", "score": 9}"#);
        assert_eq!(ctx.get_str("verdict"), Some("pass"));
        assert_eq!(ctx.get("score"), Some(&json!(9)));
        assert!(ctx.get_str("review").unwrap().contains("pass"));
    }

    #[test]
    fn node_id_key_wins_over_embedded_key() {
        let mut ctx = SharedContext::new();
        ctx.ingest_output("a", r#"{"a": "inner"}"#);
        assert_eq!(ctx.get_str("a"), Some(r#"{"a": "inner"}"#));
    }

    #[test]
    fn snapshot_is_sorted_object() {
        let mut ctx = SharedContext::new();
        ctx.set_str("b", "2");
        ctx.set_str("a", "1");
        let snap = ctx.snapshot();
        let keys: Vec<_> = snap.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
