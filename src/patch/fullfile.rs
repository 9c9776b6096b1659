//! Full-file replacement payloads: `{"files": [{"path", "content"}]}`.
//!
//! Every entry parses to a `Create` operation; the governed apply path
//! converts creates targeting existing files into whole-file replacements,
//! so the parser never needs to look at the disk.

use serde::{Deserialize, Serialize};

use super::{EditPlan, FileOperation, PatchError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilesPayload {
    files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    path: String,
    content: String,
}

/// Parse a full-file JSON payload into operations.
pub fn parse(json_text: &str) -> Result<Vec<FileOperation>, PatchError> {
    let payload: FilesPayload =
        serde_json::from_str(json_text).map_err(|e| PatchError::Unparseable {
            detail: format!("not a files payload: {}", e),
        })?;

    if payload.files.is_empty() {
        return Err(PatchError::Unparseable {
            detail: "files payload is empty".to_string(),
        });
    }

    Ok(payload
        .files
        .into_iter()
        .map(|entry| FileOperation::Create {
            path: entry.path,
            content: entry.content,
        })
        .collect())
}

/// Render a plan back into the full-file payload form. Only whole-file
/// operations are representable; span and diff edits are omitted.
pub fn render(plan: &EditPlan) -> String {
    let files: Vec<FileEntry> = plan
        .operations
        .iter()
        .filter_map(|op| match op {
            FileOperation::Create { path, content }
            | FileOperation::ModifyByReplaceAll { path, content } => Some(FileEntry {
                path: path.clone(),
                content: content.clone(),
            }),
            _ => None,
        })
        .collect();

    serde_json::to_string(&FilesPayload { files }).unwrap_or_else(|_| "{\"files\":[]}".to_string())
}
