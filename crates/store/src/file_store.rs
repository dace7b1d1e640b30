//! Document storage behind the session store.
//!
//! Files are addressed by id only. The local adapter names each file `{kind}_{uuid}.{ext}` under
//! its root, so the id is the storage stem and the kind can be recovered from the name alone.
//! That keeps files written by an earlier process run listable and sweepable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use pricewise_core::domain::file::{FileId, FileKind, FileRef, FileStatus};
use pricewise_core::domain::session::PricingContext;
use pricewise_core::errors::{ApplicationError, ResourceKind};
use pricewise_core::pricing::{self, ValidationReport};

const MAX_AGE_HOURS: u64 = 24 * 365 * 100;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("file `{0}` not found")]
    NotFound(FileId),
    #[error("unsupported file type for `{name}` (expected one of .yaml, .yml, .json)")]
    UnsupportedExtension { name: String },
    #[error("storage i/o failed at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<FileStoreError> for ApplicationError {
    fn from(value: FileStoreError) -> Self {
        match value {
            FileStoreError::NotFound(id) => Self::NotFound { kind: ResourceKind::File, id: id.0 },
            rejected @ FileStoreError::UnsupportedExtension { .. } => {
                Self::Validation(rejected.to_string())
            }
            io @ FileStoreError::Io { .. } => Self::Fatal(io.to_string()),
        }
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn save(
        &self,
        bytes: &[u8],
        original_name: &str,
        kind: FileKind,
    ) -> Result<FileRef, FileStoreError>;

    async fn read(&self, id: &FileId) -> Result<Vec<u8>, FileStoreError>;

    async fn validate(&self, id: &FileId) -> Result<ValidationReport, FileStoreError>;

    async fn delete(&self, id: &FileId) -> Result<(), FileStoreError>;

    async fn list_by_prefix(&self, kind: FileKind) -> Result<Vec<FileRef>, FileStoreError>;

    /// Removes files older than the given age. Returns how many were removed.
    async fn sweep(&self, older_than_hours: u64) -> Result<usize, FileStoreError>;

    async fn health_check(&self) -> Result<(), FileStoreError>;
}

/// Reads a stored file into a pricing context. Non-UTF-8 bytes are replaced, not rejected.
pub async fn load_context(
    store: &dyn FileStore,
    file: &FileRef,
) -> Result<PricingContext, FileStoreError> {
    let bytes = store.read(&file.id).await?;
    Ok(PricingContext {
        content: String::from_utf8_lossy(&bytes).into_owned(),
        file_name: file.original_name.clone(),
        file_id: file.id.clone(),
    })
}

pub struct LocalFileStore {
    root: PathBuf,
    index: RwLock<HashMap<FileId, FileRef>>,
}

impl LocalFileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, FileStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|source| io_error(&root, source))?;
        Ok(Self { root, index: RwLock::new(HashMap::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn sweep_before(&self, cutoff: DateTime<Utc>) -> Result<usize, FileStoreError> {
        let mut removed = 0;
        for file in self.scan().await? {
            if file.uploaded_at >= cutoff {
                continue;
            }
            match fs::remove_file(&file.storage_path).await {
                Ok(()) => removed += 1,
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    warn!(
                        event_name = "storage.sweep.remove_failed",
                        file_id = %file.id,
                        error = %source,
                        "could not remove stale file"
                    );
                    continue;
                }
            }
            self.index.write().await.remove(&file.id);
        }

        info!(
            event_name = "storage.sweep.completed",
            removed,
            cutoff = %cutoff.to_rfc3339(),
            "stale file sweep finished"
        );
        Ok(removed)
    }

    async fn locate(&self, id: &FileId) -> Result<FileRef, FileStoreError> {
        if let Some(file) = self.index.read().await.get(id).cloned() {
            return Ok(file);
        }
        self.scan()
            .await?
            .into_iter()
            .find(|file| &file.id == id)
            .ok_or_else(|| FileStoreError::NotFound(id.clone()))
    }

    /// Every recognised file under the root. Indexed entries keep their original names.
    async fn scan(&self) -> Result<Vec<FileRef>, FileStoreError> {
        let known = self.index.read().await.clone();
        let mut entries =
            fs::read_dir(&self.root).await.map_err(|source| io_error(&self.root, source))?;
        let mut files = Vec::new();

        while let Some(entry) =
            entries.next_entry().await.map_err(|source| io_error(&self.root, source))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let id = FileId(stem.to_string());
            if let Some(file) = known.get(&id) {
                files.push(file.clone());
                continue;
            }

            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(kind) = FileKind::from_storage_name(name) else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(|source| io_error(&path, source))?;
            if !metadata.is_file() {
                continue;
            }
            let uploaded_at =
                metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

            files.push(FileRef {
                id,
                original_name: name.to_string(),
                storage_path: path.clone(),
                size_bytes: metadata.len(),
                uploaded_at,
                status: FileStatus::Uploaded,
                kind,
            });
        }

        files.sort_by(|left, right| left.uploaded_at.cmp(&right.uploaded_at));
        Ok(files)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(
        &self,
        bytes: &[u8],
        original_name: &str,
        kind: FileKind,
    ) -> Result<FileRef, FileStoreError> {
        if !pricing::is_allowed_upload(original_name) {
            return Err(FileStoreError::UnsupportedExtension { name: original_name.to_string() });
        }
        let extension = pricing::extension_of(original_name).unwrap_or_else(|| "yaml".to_string());

        let id = FileId(format!("{}_{}", kind.prefix(), Uuid::new_v4().simple()));
        let storage_path = self.root.join(format!("{id}.{extension}"));
        fs::write(&storage_path, bytes).await.map_err(|source| io_error(&storage_path, source))?;

        let file = FileRef {
            id: id.clone(),
            original_name: original_name.to_string(),
            storage_path,
            size_bytes: bytes.len() as u64,
            uploaded_at: Utc::now(),
            status: FileStatus::Uploaded,
            kind,
        };
        self.index.write().await.insert(id, file.clone());
        Ok(file)
    }

    async fn read(&self, id: &FileId) -> Result<Vec<u8>, FileStoreError> {
        let file = self.locate(id).await?;
        fs::read(&file.storage_path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                FileStoreError::NotFound(id.clone())
            } else {
                io_error(&file.storage_path, source)
            }
        })
    }

    async fn validate(&self, id: &FileId) -> Result<ValidationReport, FileStoreError> {
        let bytes = self.read(id).await?;
        let report = match std::str::from_utf8(&bytes) {
            Ok(content) => pricing::validate_document(content),
            Err(_) => ValidationReport {
                is_valid: false,
                missing_fields: Vec::new(),
                reason: Some("document is not UTF-8 text".to_string()),
            },
        };

        if !report.is_valid {
            if let Some(file) = self.index.write().await.get_mut(id) {
                file.status = FileStatus::Invalid;
            }
        }
        Ok(report)
    }

    async fn delete(&self, id: &FileId) -> Result<(), FileStoreError> {
        let file = self.locate(id).await?;
        match fs::remove_file(&file.storage_path).await {
            Ok(()) => {}
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(&file.storage_path, source)),
        }
        self.index.write().await.remove(id);
        Ok(())
    }

    async fn list_by_prefix(&self, kind: FileKind) -> Result<Vec<FileRef>, FileStoreError> {
        Ok(self.scan().await?.into_iter().filter(|file| file.kind == kind).collect())
    }

    async fn sweep(&self, older_than_hours: u64) -> Result<usize, FileStoreError> {
        let age = Duration::hours(older_than_hours.min(MAX_AGE_HOURS) as i64);
        self.sweep_before(Utc::now() - age).await
    }

    async fn health_check(&self) -> Result<(), FileStoreError> {
        let metadata =
            fs::metadata(&self.root).await.map_err(|source| io_error(&self.root, source))?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(io_error(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::Other, "storage root is not a directory"),
            ))
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> FileStoreError {
    FileStoreError::Io { path: path.to_path_buf(), source }
}
