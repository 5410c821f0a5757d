//! Provider-independent file objects

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// What an uploaded file is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilePurpose {
    #[serde(rename = "batch")]
    Batch,
    #[serde(rename = "batch_output")]
    BatchOutput,
    #[serde(rename = "fine-tune")]
    FineTune,
    #[serde(rename = "fine-tune-results")]
    FineTuneResults,
    #[serde(rename = "assistants")]
    Assistants,
    #[serde(rename = "assistants_output")]
    AssistantsOutput,
    #[serde(rename = "vision")]
    Vision,
    #[serde(rename = "user_data")]
    UserData,
    #[serde(rename = "responses")]
    Responses,
    #[serde(rename = "evals")]
    Evals,
}

impl FilePurpose {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::BatchOutput => "batch_output",
            Self::FineTune => "fine-tune",
            Self::FineTuneResults => "fine-tune-results",
            Self::Assistants => "assistants",
            Self::AssistantsOutput => "assistants_output",
            Self::Vision => "vision",
            Self::UserData => "user_data",
            Self::Responses => "responses",
            Self::Evals => "evals",
        }
    }

    /// Lenient parse; both `batch_output` and `batch-output` spellings are accepted
    pub fn parse(purpose: &str) -> Result<Self, LlmError> {
        Ok(match purpose.replace('-', "_").as_str() {
            "batch" => Self::Batch,
            "batch_output" => Self::BatchOutput,
            "fine_tune" => Self::FineTune,
            "fine_tune_results" => Self::FineTuneResults,
            "assistants" => Self::Assistants,
            "assistants_output" => Self::AssistantsOutput,
            "vision" => Self::Vision,
            "user_data" => Self::UserData,
            "responses" => Self::Responses,
            "evals" => Self::Evals,
            _ => return Err(LlmError::InvalidRequest(format!("unknown file purpose '{purpose}'"))),
        })
    }
}

impl fmt::Display for FilePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    Processed,
    Error,
    Deleted,
}

impl FileStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Processed => "processed",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(status: &str) -> Self {
        match status {
            "processed" => Self::Processed,
            "error" => Self::Error,
            "deleted" => Self::Deleted,
            _ => Self::Uploaded,
        }
    }
}

/// A stored file as last observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileObject {
    pub id: String,
    pub filename: String,
    pub purpose: FilePurpose,
    pub bytes: u64,
    /// Unix seconds
    pub created_at: i64,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// File upload as received from a caller
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub purpose: FilePurpose,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl FileUpload {
    pub fn jsonl(filename: impl Into<String>, purpose: FilePurpose, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            purpose,
            content_type: "application/jsonl".to_owned(),
            data,
        }
    }
}

/// Raw file bytes with their media type
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content_type: String,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purpose_accepts_both_spellings() {
        assert_eq!(FilePurpose::parse("batch_output").unwrap(), FilePurpose::BatchOutput);
        assert_eq!(FilePurpose::parse("fine-tune").unwrap(), FilePurpose::FineTune);
        assert_eq!(FilePurpose::FineTune.as_str(), "fine-tune");
        assert_eq!(FilePurpose::parse("evals").unwrap(), FilePurpose::Evals);
        assert!(FilePurpose::parse("memes").is_err());
    }

    #[test]
    fn unknown_status_reads_as_uploaded() {
        assert_eq!(FileStatus::parse("processed"), FileStatus::Processed);
        assert_eq!(FileStatus::parse("pending"), FileStatus::Uploaded);
    }
}
