//! Batch and file lifecycle
//!
//! Provider-independent job and file models plus the [`LifecycleManager`]
//! that enforces state transitions and capability gates on top of each
//! provider's native API.

pub mod batch;
pub mod files;
mod manager;

use serde::{Deserialize, Serialize};

pub use batch::{
    BatchCreate, BatchEndpoint, BatchJob, BatchRequestCounts, BatchRequestItem, BatchResultItem, BatchSource,
    BatchStatus,
};
pub use files::{FileContent, FileObject, FilePurpose, FileStatus, FileUpload};
pub use manager::LifecycleManager;

/// Largest page any list call asks upstream for
pub const MAX_PAGE_SIZE: u32 = 100;

/// Cursor pagination shared by file and batch listings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    /// Return items after this id
    #[serde(default)]
    pub after: Option<String>,
}

impl ListQuery {
    pub fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub has_more: bool,
    /// Cursor for the next page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<String>,
}

impl<T> Page<T> {
    pub fn complete(data: Vec<T>) -> Self {
        Self {
            data,
            has_more: false,
            last_id: None,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            has_more: self.has_more,
            last_id: self.last_id,
        }
    }
}
