use crate::registry::{Tool, ToolOutput};

const MAX_READ_BYTES: usize = 500_000;

pub struct ReadFileTool;

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a UTF-8 text file from disk and returns its contents."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
        let Some(path) = arguments.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::error("missing required argument: path");
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let truncated = bytes.len() > MAX_READ_BYTES;
                let slice = &bytes[..bytes.len().min(MAX_READ_BYTES)];
                let mut content = String::from_utf8_lossy(slice).into_owned();
                if truncated {
                    content.push_str("\n[...truncated...]");
                }
                ToolOutput::text(content)
            }
            Err(e) => ToolOutput::error(format!("failed to read {path}: {e}")),
        }
    }
}

pub struct WriteFileTool;

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes text content to a file on disk, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
        let (Some(path), Some(content)) = (
            arguments.get("path").and_then(|v| v.as_str()),
            arguments.get("content").and_then(|v| v.as_str()),
        ) else {
            return ToolOutput::error("missing required argument: path or content");
        };
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutput::error(format!("failed to create parent directory: {e}"));
                }
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolOutput::text(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolOutput::error(format!("failed to write {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let path_str = path.to_str().unwrap();

        let write_out = WriteFileTool
            .execute(serde_json::json!({"path": path_str, "content": "hello"}))
            .await;
        assert!(!write_out.is_error());

        let read_out = ReadFileTool
            .execute(serde_json::json!({"path": path_str}))
            .await;
        assert_eq!(read_out.content.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn read_missing_file_is_an_error() {
        let out = ReadFileTool
            .execute(serde_json::json!({"path": "/nonexistent/does/not/exist.txt"}))
            .await;
        assert!(out.is_error());
    }
}
