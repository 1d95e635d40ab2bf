//! The edit envelope -- the structured file-write format brains emit.
//!
//! An execution response carries a JSON object listing whole-file contents:
//!
//! ```json
//! {"files": [{"path": "src/lib.rs", "content": "..."}], "summary": "..."}
//! ```
//!
//! The grammar is part of the brain-provider contract; an output that does
//! not contain an envelope is a quality failure handled at escalation
//! level 1.

use serde::Deserialize;

use crate::error::CoreError;

/// One file write.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

/// The full edit envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct EditEnvelope {
    pub files: Vec<FileEdit>,
    #[serde(default)]
    pub summary: String,
}

/// Extract the edit envelope from raw brain output.
///
/// Accepts the object verbatim, inside a ```json fence, or embedded in
/// prose. An envelope with no files is rejected -- an execution that edits
/// nothing produced nothing to review.
pub fn parse_edit_envelope(raw: &str) -> Result<EditEnvelope, CoreError> {
    let envelope: EditEnvelope = crate::decompose::plan_format::extract_plan(raw)
        .map_err(|_| CoreError::ParseError("brain output carries no edit envelope".into()))?;

    if envelope.files.is_empty() {
        return Err(CoreError::ParseError("edit envelope lists no files".into()));
    }

    Ok(envelope)
}
