//! Collaborator interfaces owned by each service.
//!
//! Every service keeps its own authoritative store; no store is shared and
//! nothing here spans services. The consistency layer only needs the handful
//! of operations below: lookups by business key, owner-scoped deletes, and
//! idempotent upserts for derived records.
//!
//! # Implementations
//!
//! In-memory versions live in `ripple-testing`. Production deployments plug
//! in their own database and object-storage clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Errors returned by collaborator stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached. Safe to retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the data. Retrying will not help.
    #[error("Invalid data: {0}")]
    Invalid(String),

    /// Referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// True for errors that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A stored piece of content (post).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    /// Identifier.
    pub id: String,
    /// Author.
    pub author_id: String,
    /// Text body.
    pub body: String,
    /// Attached media.
    pub media_ids: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Input for [`ContentStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContent {
    /// Author.
    pub author_id: String,
    /// Text body.
    pub body: String,
    /// Attached media.
    pub media_ids: Vec<String>,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// 1-based page number.
    pub page: u32,
    /// Requested page size.
    pub limit: u32,
    /// Total items across all pages.
    pub total: u64,
}

/// The search service's derived copy of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    /// Business key: the source content id.
    pub content_id: String,
    /// Author.
    pub actor_id: String,
    /// Searchable text.
    pub body: String,
    /// When the source content was created.
    pub created_at: DateTime<Utc>,
}

/// Metadata of an uploaded media blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    /// Identifier.
    pub id: String,
    /// Object-storage id of the blob.
    pub public_id: String,
    /// File name as uploaded.
    pub original_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Public URL.
    pub url: String,
    /// Uploader.
    pub owner_id: String,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

/// Input for [`MediaStore::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMedia {
    /// Object-storage id of the blob.
    pub public_id: String,
    /// File name as uploaded.
    pub original_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Public URL.
    pub url: String,
    /// Uploader.
    pub owner_id: String,
}

/// A file received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// File name as uploaded.
    pub original_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Contents.
    pub bytes: Vec<u8>,
}

/// Location of a blob in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object-storage id.
    pub public_id: String,
    /// Public URL.
    pub url: String,
}

/// Authoritative content store.
pub trait ContentStore: Send + Sync {
    /// Insert new content and return the committed record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn create(&self, content: NewContent) -> impl Future<Output = Result<ContentRecord, StoreError>> + Send;

    /// Look up by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn find_by_id(&self, id: &str) -> impl Future<Output = Result<Option<ContentRecord>, StoreError>> + Send;

    /// Delete content only if `author_id` owns it. Returns the deleted record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn delete_owned(
        &self,
        id: &str,
        author_id: &str,
    ) -> impl Future<Output = Result<Option<ContentRecord>, StoreError>> + Send;

    /// Newest-first page. `page` is 1-based.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn list(&self, page: u32, limit: u32) -> impl Future<Output = Result<Page<ContentRecord>, StoreError>> + Send;
}

/// The search service's index of derived records, keyed by content id.
pub trait SearchIndex: Send + Sync {
    /// Insert or replace by `content_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn upsert(&self, record: SearchRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete if present. Returns whether a record was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn delete_by_content_id(&self, content_id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Records whose body contains `query` (case-insensitive), newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn search(&self, query: &str, limit: usize) -> impl Future<Output = Result<Vec<SearchRecord>, StoreError>> + Send;
}

/// The media service's metadata store.
pub trait MediaStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn insert(&self, media: NewMedia) -> impl Future<Output = Result<MediaRecord, StoreError>> + Send;

    /// Look up by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn find_by_id(&self, id: &str) -> impl Future<Output = Result<Option<MediaRecord>, StoreError>> + Send;

    /// Delete if present. Returns whether a record was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn delete_by_id(&self, id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Every record, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be reached.
    fn list_all(&self) -> impl Future<Output = Result<Vec<MediaRecord>, StoreError>> + Send;
}

/// Blob storage for uploaded media.
pub trait ObjectStorage: Send + Sync {
    /// Store a file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upload fails.
    fn upload(&self, file: &UploadedFile) -> impl Future<Output = Result<StoredObject, StoreError>> + Send;

    /// Delete a blob. An absent blob is not an error and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if storage cannot be reached.
    fn delete(&self, public_id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
