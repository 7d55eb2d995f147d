use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Tool;
use conductor_core::types::{ParameterSpec, ToolContext, ToolOutput, ToolSchema};

use super::{resolve_path, truncate};

const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_LEN: usize = 2000;

pub struct ReadFileTool;

#[derive(Deserialize)]
struct ReadFileInput {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Supports a starting line and a line limit."
    }

    fn parameters(&self) -> ToolSchema {
        let mut schema = ToolSchema::new();
        schema.insert(
            "file_path".into(),
            ParameterSpec::new("string", "Path to the file, relative to the workspace"),
        );
        schema.insert(
            "offset".into(),
            ParameterSpec::new("integer", "Line number to start from (1-indexed)"),
        );
        schema.insert(
            "limit".into(),
            ParameterSpec::new("integer", "Maximum number of lines (default: 2000)"),
        );
        schema
    }

    fn execute(
        &self,
        params: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: ReadFileInput = serde_json::from_value(params)
                .map_err(|e| ConductorError::ToolValidation(e.to_string()))?;

            let Some(path) = resolve_path(&p.file_path, &ctx.working_dir) else {
                return Ok(ToolOutput::failure(format!(
                    "{}: path is outside the workspace",
                    p.file_path
                )));
            };
            // Symlinks can still point elsewhere.
            if let (Ok(real), Ok(root)) = (
                tokio::fs::canonicalize(&path).await,
                tokio::fs::canonicalize(&ctx.working_dir).await,
            ) {
                if !real.starts_with(&root) {
                    return Ok(ToolOutput::failure(format!(
                        "{}: path is outside the workspace",
                        p.file_path
                    )));
                }
            }
            debug!(path = %path.display(), agent = %ctx.agent_id, "Reading file");

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    return Ok(ToolOutput::failure(format!("{}: {}", path.display(), e)));
                }
            };

            let lines: Vec<&str> = content.lines().collect();
            let total = lines.len();
            let start = p.offset.unwrap_or(1).max(1) - 1;
            let end = start.saturating_add(p.limit.unwrap_or(DEFAULT_LIMIT)).min(total);

            let mut output = String::new();
            if start < total {
                for (i, line) in lines[start..end].iter().enumerate() {
                    output.push_str(&format!("{:>6}\t{}\n", start + i + 1, truncate(line, MAX_LINE_LEN)));
                }
            }
            if output.is_empty() {
                output = "(no content)".to_string();
            }

            Ok(ToolOutput::success(output).with_data(serde_json::json!({
                "path": path.display().to_string(),
                "total_lines": total,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new("reader", dir)
    }

    #[tokio::test]
    async fn reads_relative_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("notes.txt")).unwrap();
        writeln!(f, "alpha\nbeta\ngamma").unwrap();

        let out = ReadFileTool
            .execute(serde_json::json!({"file_path": "notes.txt"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.output.contains("1\talpha"));
        assert!(out.output.contains("3\tgamma"));
        assert_eq!(out.data["total_lines"], 3);
    }

    #[tokio::test]
    async fn offset_and_limit_select_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.txt"), "1\n2\n3\n4\n5\n").unwrap();

        let out = ReadFileTool
            .execute(
                serde_json::json!({"file_path": "n.txt", "offset": 2, "limit": 2}),
                ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(out.output, "     2\t2\n     3\t3\n");
    }

    #[tokio::test]
    async fn missing_file_is_a_failed_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileTool
            .execute(serde_json::json!({"file_path": "ghost.txt"}), ctx(dir.path()))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.output.contains("ghost.txt"));
    }

    #[tokio::test]
    async fn missing_path_param_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFileTool
            .execute(serde_json::json!({}), ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn paths_outside_workspace_are_refused() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "hidden").unwrap();
        let workspace = outer.path().join("ws");
        std::fs::create_dir(&workspace).unwrap();
        let absolute = outer.path().join("secret.txt");

        for file_path in ["../secret.txt", absolute.to_str().unwrap()] {
            let out = ReadFileTool
                .execute(serde_json::json!({ "file_path": file_path }), ctx(&workspace))
                .await
                .unwrap();
            assert!(!out.success, "{}", file_path);
            assert!(out.output.contains("outside the workspace"));
            assert!(!out.output.contains("hidden"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_out_of_workspace_is_refused() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.txt"), "hidden").unwrap();
        let workspace = outer.path().join("ws");
        std::fs::create_dir(&workspace).unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), workspace.join("link.txt"))
            .unwrap();

        let out = ReadFileTool
            .execute(serde_json::json!({"file_path": "link.txt"}), ctx(&workspace))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.output.contains("outside the workspace"));
    }
}
