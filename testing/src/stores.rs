//! In-memory collaborator stores.
//!
//! Each store keeps records in insertion order (newest last) behind a
//! `RwLock` and can be told to fail its next few calls with
//! [`StoreError::Unavailable`], which handlers treat as transient.

#![allow(clippy::unwrap_used)] // Lock poisoning only follows an earlier panic
#![allow(clippy::missing_panics_doc)]

use chrono::Utc;
use ripple_core::store::{
    ContentRecord, ContentStore, MediaRecord, MediaStore, NewContent, NewMedia, ObjectStorage,
    Page, SearchIndex, SearchRecord, StoreError, StoredObject, UploadedFile,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Counts down injected failures.
#[derive(Debug, Clone, Default)]
struct Faults(Arc<AtomicU32>);

impl Faults {
    fn arm(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn check(&self, store: &str) -> Result<(), StoreError> {
        let tripped = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable(format!("{store} unavailable (injected)")))
        } else {
            Ok(())
        }
    }
}

/// In-memory [`ContentStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryContentStore {
    records: Arc<RwLock<Vec<ContentRecord>>>,
    faults: Faults,
}

impl InMemoryContentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly.
    pub fn insert(&self, record: ContentRecord) {
        self.records.write().unwrap().push(record);
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for InMemoryContentStore {
    async fn create(&self, content: NewContent) -> Result<ContentRecord, StoreError> {
        self.faults.check("content store")?;
        let now = Utc::now();
        let record = ContentRecord {
            id: Uuid::new_v4().to_string(),
            author_id: content.author_id,
            body: content.body,
            media_ids: content.media_ids,
            created_at: now,
            updated_at: now,
        };
        self.records.write().unwrap().push(record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ContentRecord>, StoreError> {
        self.faults.check("content store")?;
        Ok(self.records.read().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn delete_owned(&self, id: &str, author_id: &str) -> Result<Option<ContentRecord>, StoreError> {
        self.faults.check("content store")?;
        let mut records = self.records.write().unwrap();
        let position = records
            .iter()
            .position(|r| r.id == id && r.author_id == author_id);
        Ok(position.map(|index| records.remove(index)))
    }

    async fn list(&self, page: u32, limit: u32) -> Result<Page<ContentRecord>, StoreError> {
        self.faults.check("content store")?;
        let records = self.records.read().unwrap();
        let skip = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);
        let items = records
            .iter()
            .rev()
            .skip(skip)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            page,
            limit,
            total: records.len() as u64,
        })
    }
}

/// In-memory [`SearchIndex`] keyed by content id.
#[derive(Debug, Clone, Default)]
pub struct InMemorySearchIndex {
    records: Arc<RwLock<BTreeMap<String, (u64, SearchRecord)>>>,
    sequence: Arc<AtomicU64>,
    faults: Faults,
}

impl InMemorySearchIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// Record for `content_id`, bypassing fault injection.
    #[must_use]
    pub fn get(&self, content_id: &str) -> Option<SearchRecord> {
        self.records
            .read()
            .unwrap()
            .get(content_id)
            .map(|(_, record)| record.clone())
    }

    /// Records whose content id equals `content_id`. Never more than one.
    #[must_use]
    pub fn count_for(&self, content_id: &str) -> usize {
        usize::from(self.records.read().unwrap().contains_key(content_id))
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, record: SearchRecord) -> Result<(), StoreError> {
        self.faults.check("search index")?;
        let mut records = self.records.write().unwrap();
        // Keep the original insertion position on replace.
        let sequence = records
            .get(&record.content_id)
            .map_or_else(|| self.sequence.fetch_add(1, Ordering::SeqCst), |(seq, _)| *seq);
        records.insert(record.content_id.clone(), (sequence, record));
        Ok(())
    }

    async fn delete_by_content_id(&self, content_id: &str) -> Result<bool, StoreError> {
        self.faults.check("search index")?;
        Ok(self.records.write().unwrap().remove(content_id).is_some())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchRecord>, StoreError> {
        self.faults.check("search index")?;
        let needle = query.to_lowercase();
        let records = self.records.read().unwrap();
        let mut hits: Vec<&(u64, SearchRecord)> = records
            .values()
            .filter(|(_, record)| record.body.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

/// In-memory [`MediaStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryMediaStore {
    records: Arc<RwLock<Vec<MediaRecord>>>,
    faults: Faults,
}

impl InMemoryMediaStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly.
    pub fn seed(&self, record: MediaRecord) {
        self.records.write().unwrap().push(record);
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// True if a record with `id` exists, bypassing fault injection.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.records.read().unwrap().iter().any(|r| r.id == id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MediaStore for InMemoryMediaStore {
    async fn insert(&self, media: NewMedia) -> Result<MediaRecord, StoreError> {
        self.faults.check("media store")?;
        let record = MediaRecord {
            id: Uuid::new_v4().to_string(),
            public_id: media.public_id,
            original_name: media.original_name,
            mime_type: media.mime_type,
            url: media.url,
            owner_id: media.owner_id,
            created_at: Utc::now(),
        };
        self.records.write().unwrap().push(record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<MediaRecord>, StoreError> {
        self.faults.check("media store")?;
        Ok(self.records.read().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, StoreError> {
        self.faults.check("media store")?;
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() < before)
    }

    async fn list_all(&self) -> Result<Vec<MediaRecord>, StoreError> {
        self.faults.check("media store")?;
        Ok(self.records.read().unwrap().iter().rev().cloned().collect())
    }
}

/// In-memory [`ObjectStorage`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStorage {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    faults: Faults,
}

impl InMemoryObjectStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob under a known id.
    pub fn seed(&self, public_id: &str, bytes: &[u8]) {
        self.blobs
            .write()
            .unwrap()
            .insert(public_id.to_string(), bytes.to_vec());
    }

    /// Fail the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.faults.arm(count);
    }

    /// True if a blob exists, bypassing fault injection.
    #[must_use]
    pub fn contains(&self, public_id: &str) -> bool {
        self.blobs.read().unwrap().contains_key(public_id)
    }

    /// Number of blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    /// True if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, file: &UploadedFile) -> Result<StoredObject, StoreError> {
        self.faults.check("object storage")?;
        let public_id = format!("ripple/{}", Uuid::new_v4());
        self.seed(&public_id, &file.bytes);
        Ok(StoredObject {
            url: format!("memory://{public_id}"),
            public_id,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<bool, StoreError> {
        self.faults.check("object storage")?;
        Ok(self.blobs.write().unwrap().remove(public_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, body: &str) -> SearchRecord {
        SearchRecord {
            content_id: id.to_string(),
            actor_id: "u1".to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn content_list_is_newest_first_and_paged() {
        let store = InMemoryContentStore::new();
        for body in ["a", "b", "c"] {
            store
                .create(NewContent {
                    author_id: "u1".into(),
                    body: body.into(),
                    media_ids: vec![],
                })
                .await
                .unwrap();
        }

        let first = store.list(1, 2).await.unwrap();
        let bodies: Vec<_> = first.items.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, vec!["c", "b"]);
        assert_eq!(first.total, 3);
        assert_eq!(store.list(2, 2).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn delete_owned_ignores_other_authors() {
        let store = InMemoryContentStore::new();
        let created = store
            .create(NewContent {
                author_id: "u1".into(),
                body: "x".into(),
                media_ids: vec![],
            })
            .await
            .unwrap();

        assert!(store.delete_owned(&created.id, "u2").await.unwrap().is_none());
        assert!(store.delete_owned(&created.id, "u1").await.unwrap().is_some());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn search_upsert_replaces_by_content_id() {
        let index = InMemorySearchIndex::new();
        index.upsert(record("p1", "Hello")).await.unwrap();
        index.upsert(record("p1", "Hello again")).await.unwrap();
        index.upsert(record("p2", "other")).await.unwrap();

        assert_eq!(index.count_for("p1"), 1);
        assert_eq!(index.get("p1").unwrap().body, "Hello again");
        assert_eq!(index.search("HELLO", 10).await.unwrap().len(), 1);
        assert!(index.delete_by_content_id("p1").await.unwrap());
        assert!(!index.delete_by_content_id("p1").await.unwrap());
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_counted_down() {
        let storage = InMemoryObjectStorage::new();
        storage.seed("blob", b"x");
        storage.fail_next(1);

        let err = storage.delete("blob").await.unwrap_err();
        assert!(err.is_transient());
        assert!(storage.delete("blob").await.unwrap());
        assert!(!storage.delete("blob").await.unwrap());
    }
}
