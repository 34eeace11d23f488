//! Post lifecycle: atomic creation of a post with its photos, reads, and
//! secret-gated deletion with best-effort blob cleanup.
//!
//! The relational store is the system of record. Blobs are written before
//! the rows that reference them and removed only after those rows are gone,
//! so a committed image row never points at a missing blob. The price is
//! that a blob can be orphaned (written but never referenced, or left behind
//! after deletion); those are logged and counted, never retried here.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::credential::{CredentialError, CredentialGuard};
use crate::models::*;
use crate::repo::{PostRepo, RepoError};
use crate::storage::{blob_key, BlobStore, BlobStoreError};

pub const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<RepoError> for LifecycleError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => LifecycleError::NotFound,
            other => LifecycleError::Storage(other.to_string()),
        }
    }
}

impl From<BlobStoreError> for LifecycleError {
    fn from(e: BlobStoreError) -> Self {
        LifecycleError::Storage(e.to_string())
    }
}

impl From<CredentialError> for LifecycleError {
    fn from(e: CredentialError) -> Self {
        LifecycleError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_attachments: usize,
    pub max_bytes: usize,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self { max_attachments: 10, max_bytes: 10 * 1024 * 1024 }
    }
}

impl AttachmentLimits {
    pub fn check(&self, attachments: &[Attachment]) -> Result<(), ValidationError> {
        if attachments.is_empty() {
            return Err(ValidationError::NoAttachments);
        }
        if attachments.len() > self.max_attachments {
            return Err(ValidationError::TooManyAttachments { max: self.max_attachments });
        }
        for (index, a) in attachments.iter().enumerate() {
            if a.bytes.len() > self.max_bytes {
                return Err(ValidationError::AttachmentTooLarge { index, max_bytes: self.max_bytes });
            }
            let mime = a.mime();
            if !ALLOWED_MIME.contains(&mime.as_str()) {
                return Err(ValidationError::UnsupportedMedia { index, mime });
            }
        }
        Ok(())
    }
}

/// How blob removal after a committed delete is attempted. The default is a
/// single attempt per blob; failures are logged and the blob is left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub max_retries: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub leaked: Vec<String>,
}

impl CleanupPolicy {
    pub async fn sweep(&self, blobs: &dyn BlobStore, locators: &[String]) -> CleanupReport {
        let mut report = CleanupReport::default();
        for locator in locators {
            let mut attempt = 0;
            loop {
                match blobs.delete(locator).await {
                    Ok(()) => {
                        report.removed += 1;
                        break;
                    }
                    Err(e) if attempt < self.max_retries => {
                        attempt += 1;
                        debug!(%locator, attempt, error = %e, "retrying blob delete");
                    }
                    Err(e) => {
                        warn!(%locator, error = %e, "blob delete failed; leaving orphan");
                        report.leaked.push(locator.clone());
                        break;
                    }
                }
            }
        }
        if !report.leaked.is_empty() {
            metrics::counter!("lostpet_orphaned_blobs_total", report.leaked.len() as u64);
        }
        report
    }
}

/// Phases of a deletion, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePhase {
    Verifying,
    Deleting,
    Cleaning,
    Done,
}

impl fmt::Display for DeletePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeletePhase::Verifying => "verifying",
            DeletePhase::Deleting => "deleting",
            DeletePhase::Cleaning => "cleaning",
            DeletePhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Orchestrates the repository, the blob store and the credential guard.
#[derive(Clone)]
pub struct PostService {
    repo: Arc<dyn PostRepo>,
    blobs: Arc<dyn BlobStore>,
    guard: CredentialGuard,
    limits: AttachmentLimits,
    cleanup: CleanupPolicy,
}

impl PostService {
    pub fn new(repo: Arc<dyn PostRepo>, blobs: Arc<dyn BlobStore>, guard: CredentialGuard) -> Self {
        Self { repo, blobs, guard, limits: AttachmentLimits::default(), cleanup: CleanupPolicy::default() }
    }

    pub fn with_limits(mut self, limits: AttachmentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn limits(&self) -> AttachmentLimits {
        self.limits
    }

    pub fn repo(&self) -> &Arc<dyn PostRepo> {
        &self.repo
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Creates a post and its images atomically. Returns the new id and the
    /// image locators in submission order.
    #[instrument(skip_all, fields(attachments = attachments.len()))]
    pub async fn create_post(
        &self,
        fields: PostFields,
        attachments: Vec<Attachment>,
        secret: &str,
    ) -> Result<CreatedPost, LifecycleError> {
        let validated = fields.validate();
        if secret.trim().is_empty() {
            let mut missing = match validated {
                Err(ValidationError::MissingFields(missing)) => missing,
                _ => Vec::new(),
            };
            missing.push("password");
            return Err(ValidationError::MissingFields(missing).into());
        }
        let new = validated?;
        self.limits.check(&attachments)?;

        let credential_hash = self.guard.hash_blocking(secret).await?;

        let mut tx = self.repo.begin().await?;
        let mut written: Vec<String> = Vec::with_capacity(attachments.len());
        let staged = async {
            let id = tx.insert_post(&new, &credential_hash).await?;
            for attachment in &attachments {
                let locator = self.blobs.put(&blob_key(id, &attachment.bytes), &attachment.bytes).await?;
                written.push(locator.clone());
                tx.insert_image(id, &locator).await?;
            }
            Ok::<Id, LifecycleError>(id)
        }
        .await;

        let id = match staged {
            Ok(id) => id,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "rollback failed; transaction will be discarded by the store");
                }
                self.note_orphans(&written);
                return Err(e);
            }
        };
        if let Err(e) = tx.commit().await {
            self.note_orphans(&written);
            return Err(e.into());
        }

        metrics::increment_counter!("lostpet_posts_created_total");
        info!(post_id = id, images = written.len(), "post created");
        Ok(CreatedPost { id, images: written })
    }

    fn note_orphans(&self, locators: &[String]) {
        if locators.is_empty() {
            return;
        }
        metrics::counter!("lostpet_orphaned_blobs_total", locators.len() as u64);
        warn!(orphans = ?locators, "post creation failed after blob writes; blobs left unreferenced");
    }

    /// All posts matching every predicate of `filter`, newest first.
    #[instrument(skip(self))]
    pub async fn list_posts(&self, filter: PostFilter) -> Result<Vec<Post>, LifecycleError> {
        Ok(self.repo.list_posts(&filter.normalized()).await?)
    }

    pub async fn get_post(&self, id: Id) -> Result<Post, LifecycleError> {
        Ok(self.repo.get_post(id).await?)
    }

    /// Deletes a post and its images if `secret` matches. Succeeds once the
    /// rows are committed away, whatever happens to the blobs afterwards.
    #[instrument(skip(self, secret))]
    pub async fn delete_post(&self, id: Id, secret: &str) -> Result<CleanupReport, LifecycleError> {
        let mut phase = DeletePhase::Verifying;
        debug!(%phase);
        let stored = self.repo.credential_hash(id).await?;
        if !self.guard.verify_blocking(secret, &stored).await {
            metrics::increment_counter!("lostpet_delete_forbidden_total");
            info!(post_id = id, "delete rejected: secret mismatch");
            return Err(LifecycleError::Forbidden);
        }

        phase = DeletePhase::Deleting;
        debug!(%phase);
        // NotFound here means a concurrent delete won the race.
        let locators = self.repo.delete_post(id).await?;

        phase = DeletePhase::Cleaning;
        debug!(%phase, blobs = locators.len());
        let report = self.cleanup.sweep(self.blobs.as_ref(), &locators).await;

        phase = DeletePhase::Done;
        metrics::increment_counter!("lostpet_posts_deleted_total");
        info!(%phase, post_id = id, removed = report.removed, leaked = report.leaked.len(), "post deleted");
        Ok(report)
    }
}
