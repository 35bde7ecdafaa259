//! Loading resolved execution graphs from disk.
//!
//! The worker accepts ComfyUI API-format workflows: a JSON object keyed by
//! node id whose values carry a `class_type`. A `{"prompt": {...}}`
//! wrapper, as written by the ComfyUI history endpoint, is unwrapped.

use std::path::{Path, PathBuf};

use switchgen_core::job::GenerationRequest;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not an API-format workflow: {0}")]
    Format(String),
}

/// Read `path` and build a request labelled with the file stem.
pub fn load_request(path: &Path) -> Result<GenerationRequest, WorkflowError> {
    let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let label = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_request(&text, &label)
}

/// Parse workflow JSON into a request.
pub fn parse_request(text: &str, label: &str) -> Result<GenerationRequest, WorkflowError> {
    let mut value: serde_json::Value = serde_json::from_str(text)?;

    let wrapped = value
        .get_mut("prompt")
        .filter(|p| p.is_object())
        .map(serde_json::Value::take);
    if let Some(inner) = wrapped {
        value = inner;
    }

    let nodes = value
        .as_object()
        .ok_or_else(|| WorkflowError::Format("top level must be an object".into()))?;

    if nodes.contains_key("nodes") && nodes.contains_key("links") {
        return Err(WorkflowError::Format(
            "UI-format workflow; export it with \"Save (API Format)\"".into(),
        ));
    }
    if nodes.is_empty() {
        return Err(WorkflowError::Format("workflow has no nodes".into()));
    }
    if let Some((id, _)) = nodes
        .iter()
        .find(|(_, node)| node.get("class_type").and_then(|c| c.as_str()).is_none())
    {
        return Err(WorkflowError::Format(format!("node {id} has no class_type")));
    }

    Ok(GenerationRequest::new(value).with_label(label))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const TXT2IMG: &str = r#"{
        "3": {"class_type": "KSampler", "inputs": {"seed": 7, "steps": 20}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["8", 0]}}
    }"#;

    #[test]
    fn api_format_is_accepted() {
        let request = parse_request(TXT2IMG, "txt2img").unwrap();
        assert_eq!(request.label.as_deref(), Some("txt2img"));
        assert_eq!(request.graph["3"]["class_type"], "KSampler");
    }

    #[test]
    fn prompt_wrapper_is_unwrapped() {
        let wrapped = format!(r#"{{"prompt": {TXT2IMG}, "client_id": "x"}}"#);
        let request = parse_request(&wrapped, "wrapped").unwrap();
        assert_eq!(request.graph["9"]["class_type"], "SaveImage");
        assert!(request.graph.get("client_id").is_none());
    }

    #[test]
    fn ui_format_is_rejected() {
        let err = parse_request(r#"{"nodes": [], "links": []}"#, "ui").unwrap_err();
        assert_matches!(err, WorkflowError::Format(msg) if msg.contains("API Format"));
    }

    #[test]
    fn nodes_need_class_type() {
        let err = parse_request(r#"{"1": {"inputs": {}}}"#, "x").unwrap_err();
        assert_matches!(err, WorkflowError::Format(msg) if msg == "node 1 has no class_type");
    }

    #[test]
    fn non_objects_are_rejected() {
        assert_matches!(parse_request("[]", "x"), Err(WorkflowError::Format(_)));
        assert_matches!(parse_request("{}", "x"), Err(WorkflowError::Format(_)));
        assert_matches!(parse_request("{", "x"), Err(WorkflowError::Json(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_request(Path::new("/definitely/not/here.json")).unwrap_err();
        assert_matches!(err, WorkflowError::Io { path, .. } if path.ends_with("here.json"));
    }
}
