//! Media service: uploads, and cleanup of media orphaned by deleted content.
//!
//! [`MediaJanitor`] reacts to `content.deleted` only. It walks the event's
//! explicit `mediaIds` list and never infers anything from the content id.
//! Both steps per id are idempotent, so a redelivered event finds the blob
//! and the record already gone and does nothing.

use async_trait::async_trait;
use ripple_core::event::{DomainEvent, EventKind};
use ripple_core::handler::{EventHandler, HandlerError};
use ripple_core::store::{MediaRecord, MediaStore, NewMedia, ObjectStorage, StoreError, UploadedFile};
use ripple_runtime::{RateAdmissionController, RateLimitPolicy};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`MediaService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No authenticated actor.
    #[error("Unauthorized")]
    Unauthorized,

    /// The actor used up their upload quota.
    #[error("Too many requests")]
    RateLimited,

    /// The upload carried no file contents.
    #[error("No file found")]
    NoFile,

    /// Storage or the metadata store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Deletes the blobs and records a deleted piece of content referenced.
pub struct MediaJanitor<M, O> {
    media: Arc<M>,
    storage: Arc<O>,
}

impl<M: MediaStore, O: ObjectStorage> MediaJanitor<M, O> {
    /// Janitor over the media store and object storage.
    #[must_use]
    pub const fn new(media: Arc<M>, storage: Arc<O>) -> Self {
        Self { media, storage }
    }

    async fn remove(&self, content_id: &str, media_id: &str) -> Result<(), StoreError> {
        let Some(record) = self.media.find_by_id(media_id).await? else {
            tracing::debug!(content_id, media_id, "Media record already gone");
            return Ok(());
        };

        if !self.storage.delete(&record.public_id).await? {
            tracing::debug!(content_id, media_id, public_id = %record.public_id, "Blob already gone");
        }
        self.media.delete_by_id(&record.id).await?;
        tracing::info!(content_id, media_id, "Deleted media of deleted content");
        Ok(())
    }
}

#[async_trait]
impl<M, O> EventHandler for MediaJanitor<M, O>
where
    M: MediaStore + 'static,
    O: ObjectStorage + 'static,
{
    fn name(&self) -> &str {
        "media-janitor"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        if event.kind() != EventKind::ContentDeleted {
            return Ok(());
        }

        let media_ids = event.media_ids()?;
        for media_id in &media_ids {
            self.remove(event.content_id(), media_id).await?;
        }
        tracing::info!(
            content_id = event.content_id(),
            media = media_ids.len(),
            "Processed media cleanup"
        );
        Ok(())
    }
}

/// Uploads and listings.
pub struct MediaService<M, O> {
    media: Arc<M>,
    storage: Arc<O>,
    limiter: RateAdmissionController,
}

impl<M: MediaStore, O: ObjectStorage> MediaService<M, O> {
    /// Service over the media store and object storage.
    #[must_use]
    pub const fn new(media: Arc<M>, storage: Arc<O>, limiter: RateAdmissionController) -> Self {
        Self {
            media,
            storage,
            limiter,
        }
    }

    /// Store `file` for `actor` and record its metadata.
    ///
    /// If the metadata insert fails the blob is deleted again, best effort.
    ///
    /// # Errors
    ///
    /// - [`MediaError::Unauthorized`] for a blank actor
    /// - [`MediaError::RateLimited`] once the upload quota is used up
    /// - [`MediaError::NoFile`] for an empty file
    /// - [`MediaError::Store`] if storage or the metadata store fails
    pub async fn upload(&self, actor: &str, file: UploadedFile) -> Result<MediaRecord, MediaError> {
        if actor.trim().is_empty() {
            return Err(MediaError::Unauthorized);
        }
        if !self
            .limiter
            .try_consume(&RateLimitPolicy::MEDIA_UPLOAD, actor, 1)
            .await
        {
            return Err(MediaError::RateLimited);
        }
        if file.bytes.is_empty() {
            return Err(MediaError::NoFile);
        }

        tracing::info!(actor, name = %file.original_name, mime = %file.mime_type, "Uploading media");
        let stored = self.storage.upload(&file).await?;

        let inserted = self
            .media
            .insert(NewMedia {
                public_id: stored.public_id.clone(),
                original_name: file.original_name,
                mime_type: file.mime_type,
                url: stored.url,
                owner_id: actor.to_string(),
            })
            .await;

        match inserted {
            Ok(record) => {
                tracing::info!(media_id = %record.id, public_id = %record.public_id, "Media uploaded");
                Ok(record)
            }
            Err(error) => {
                if let Err(cleanup) = self.storage.delete(&stored.public_id).await {
                    tracing::warn!(
                        public_id = %stored.public_id,
                        error = %cleanup,
                        "Failed to remove blob after metadata insert failed"
                    );
                }
                Err(error.into())
            }
        }
    }

    /// Every media record, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Store`] if the store fails.
    pub async fn list_all(&self) -> Result<Vec<MediaRecord>, MediaError> {
        Ok(self.media.list_all().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ripple_testing::{InMemoryCacheStore, InMemoryMediaStore, InMemoryObjectStorage, test_clock};

    type Janitor = MediaJanitor<InMemoryMediaStore, InMemoryObjectStorage>;

    fn file() -> UploadedFile {
        UploadedFile {
            original_name: "cat.png".into(),
            mime_type: "image/png".into(),
            bytes: vec![1, 2, 3],
        }
    }

    fn setup() -> (
        Janitor,
        MediaService<InMemoryMediaStore, InMemoryObjectStorage>,
        Arc<InMemoryMediaStore>,
        Arc<InMemoryObjectStorage>,
    ) {
        let media = Arc::new(InMemoryMediaStore::new());
        let storage = Arc::new(InMemoryObjectStorage::new());
        let limiter = RateAdmissionController::new(Arc::new(InMemoryCacheStore::new()));
        (
            MediaJanitor::new(Arc::clone(&media), Arc::clone(&storage)),
            MediaService::new(Arc::clone(&media), Arc::clone(&storage), limiter),
            media,
            storage,
        )
    }

    fn deleted(media_ids: &[String]) -> DomainEvent {
        DomainEvent::content_deleted("p1", "u1", media_ids, test_clock().now_fixed())
    }

    #[tokio::test]
    async fn upload_stores_blob_and_record() {
        let (_, service, media, storage) = setup();
        let record = service.upload("u1", file()).await.unwrap();

        assert!(media.contains(&record.id));
        assert!(storage.contains(&record.public_id));
        assert_eq!(record.owner_id, "u1");
        assert_eq!(service.list_all().await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let (_, service, _, storage) = setup();
        let empty = UploadedFile {
            bytes: Vec::new(),
            ..file()
        };
        assert_eq!(service.upload("u1", empty).await, Err(MediaError::NoFile));
        assert_eq!(service.upload(" ", file()).await, Err(MediaError::Unauthorized));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn failed_metadata_insert_removes_the_blob() {
        let (_, service, media, storage) = setup();
        media.fail_next(1);

        assert!(matches!(service.upload("u1", file()).await, Err(MediaError::Store(_))));
        assert!(storage.is_empty());
        assert!(media.is_empty());
    }

    #[tokio::test]
    async fn deletion_removes_listed_media_only() {
        let (janitor, service, media, storage) = setup();
        let m1 = service.upload("u1", file()).await.unwrap();
        let m2 = service.upload("u1", file()).await.unwrap();
        let keep = service.upload("u1", file()).await.unwrap();

        janitor.handle(&deleted(&[m1.id.clone(), m2.id.clone()])).await.unwrap();

        assert!(!media.contains(&m1.id) && !media.contains(&m2.id));
        assert!(!storage.contains(&m1.public_id) && !storage.contains(&m2.public_id));
        assert!(media.contains(&keep.id));
        assert!(storage.contains(&keep.public_id));
    }

    #[tokio::test]
    async fn redelivery_and_unknown_ids_are_no_ops() {
        let (janitor, service, media, _) = setup();
        let m1 = service.upload("u1", file()).await.unwrap();
        let event = deleted(&[m1.id.clone(), "never-uploaded".to_string()]);

        janitor.handle(&event).await.unwrap();
        janitor.handle(&event).await.unwrap();
        assert!(media.is_empty());
    }

    #[tokio::test]
    async fn blob_already_gone_still_removes_the_record() {
        let (janitor, service, media, storage) = setup();
        let m1 = service.upload("u1", file()).await.unwrap();
        storage.delete(&m1.public_id).await.unwrap();

        janitor.handle(&deleted(&[m1.id.clone()])).await.unwrap();
        assert!(!media.contains(&m1.id));
    }

    #[tokio::test]
    async fn storage_outage_is_retried_and_converges() {
        let (janitor, service, media, storage) = setup();
        let m1 = service.upload("u1", file()).await.unwrap();
        storage.fail_next(1);

        let event = deleted(&[m1.id.clone()]);
        let error = janitor.handle(&event).await.unwrap_err();
        assert!(error.is_transient());
        assert!(media.contains(&m1.id));

        janitor.handle(&event).await.unwrap();
        assert!(!media.contains(&m1.id));
        assert!(!storage.contains(&m1.public_id));
    }

    #[tokio::test]
    async fn created_events_are_ignored() {
        let (janitor, service, media, _) = setup();
        let m1 = service.upload("u1", file()).await.unwrap();
        let created = DomainEvent::content_created("p1", "u1", "hi", &[m1.id.clone()], test_clock().now_fixed());

        janitor.handle(&created).await.unwrap();
        assert!(media.contains(&m1.id));
    }
}
