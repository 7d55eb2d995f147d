use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Tool;
use conductor_core::types::{ParameterSpec, ToolContext, ToolOutput, ToolSchema};

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    json: Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }

    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'items[0].name')."
    }

    fn parameters(&self) -> ToolSchema {
        let mut schema = ToolSchema::new();
        schema.insert(
            "json".into(),
            ParameterSpec::new("string", "JSON document (string or inline value)"),
        );
        schema.insert(
            "path".into(),
            ParameterSpec::new("string", "Dot-notation path (e.g. 'items[0].name')"),
        );
        schema
    }

    fn execute(
        &self,
        params: Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(params)
                .map_err(|e| ConductorError::ToolValidation(e.to_string()))?;

            // Agents often pass the document as a JSON string.
            let doc = match p.json {
                Value::String(s) => match serde_json::from_str(&s) {
                    Ok(v) => v,
                    Err(e) => return Ok(ToolOutput::failure(format!("Invalid JSON: {}", e))),
                },
                other => other,
            };

            let result = json_path_query(&doc, &p.path);
            let text = serde_json::to_string_pretty(&result)?;
            Ok(ToolOutput::success(text).with_data(result))
        })
    }
}

/// Resolve a dot/bracket path such as `a.b[2].c`. Missing segments yield `Null`.
pub fn json_path_query(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        for idx in indices
            .split(']')
            .filter_map(|s| s.strip_prefix('['))
        {
            match idx.parse::<usize>().ok().and_then(|i| current.get(i)) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_paths() {
        let doc = json!({"items": [{"name": "a"}, {"name": "b", "tags": [[1, 2], [3]]}]});
        assert_eq!(json_path_query(&doc, "items[1].name"), json!("b"));
        assert_eq!(json_path_query(&doc, "items[1].tags[1][0]"), json!(3));
        assert_eq!(json_path_query(&doc, "items[5].name"), Value::Null);
        assert_eq!(json_path_query(&doc, "missing.key"), Value::Null);
        assert_eq!(json_path_query(&doc, ""), doc);
    }

    #[tokio::test]
    async fn accepts_string_or_inline_documents() {
        let ctx = ToolContext::new("a", ".");
        let from_str = JsonQueryTool
            .execute(json!({"json": "{\"x\": {\"y\": 7}}", "path": "x.y"}), ctx.clone())
            .await
            .unwrap();
        assert_eq!(from_str.output, "7");

        let inline = JsonQueryTool
            .execute(json!({"json": {"x": [true]}, "path": "x[0]"}), ctx)
            .await
            .unwrap();
        assert_eq!(inline.data, json!(true));
    }

    #[tokio::test]
    async fn invalid_document_is_failed_output() {
        let out = JsonQueryTool
            .execute(json!({"json": "{not json", "path": "a"}), ToolContext::new("a", "."))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.output.starts_with("Invalid JSON"));
    }
}
