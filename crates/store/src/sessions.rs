use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use pricewise_core::domain::file::{FileId, FileKind, FileRef, FileStatus};
use pricewise_core::domain::job::JobRef;
use pricewise_core::domain::message::Message;
use pricewise_core::domain::session::{PricingContextInfo, Session, SessionId};
use pricewise_core::errors::{ApplicationError, ResourceKind};
use pricewise_core::pricing::{self, ValidationReport};

use crate::file_store::{load_context, FileStore, FileStoreError};

/// Shared handle to one session. Holding the mutex serializes turns within the session.
pub type SessionHandle = Arc<Mutex<Session>>;

/// A locked session that is still registered in the store.
pub type SessionGuard = OwnedMutexGuard<Session>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session `{0}` not found")]
    SessionNotFound(SessionId),
    #[error("file `{0}` not found in this session or among transformation outputs")]
    FileNotFound(FileId),
    #[error(transparent)]
    Files(#[from] FileStoreError),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::SessionNotFound(id) => Self::session_not_found(id.0),
            StoreError::FileNotFound(id) => Self::NotFound { kind: ResourceKind::File, id: id.0 },
            StoreError::Files(error) => error.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachOutcome {
    pub file: FileRef,
    pub validation: ValidationReport,
    pub context_adopted: bool,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    files: Arc<dyn FileStore>,
}

impl SessionStore {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), files }
    }

    pub fn file_store(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    /// Starts a session with empty collections and no pricing context.
    pub async fn create(&self) -> Session {
        let session = Session::new(SessionId::generate());
        let snapshot = session.clone();
        self.sessions.write().await.insert(session.id.clone(), Arc::new(Mutex::new(session)));

        info!(
            event_name = "session.created",
            session_id = %snapshot.id,
            correlation_id = "session",
            "session created"
        );
        snapshot
    }

    pub(crate) async fn handle(&self, id: &SessionId) -> Result<SessionHandle, StoreError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))
    }

    /// Locks a session for exclusive use.
    ///
    /// The reaper or a delete may drop the session between the map lookup and the lock. Both
    /// retire the session under its lock, so a retired session is reported as not found.
    pub async fn lock(&self, id: &SessionId) -> Result<SessionGuard, StoreError> {
        let session = self.handle(id).await?.lock_owned().await;
        if session.is_retired() {
            return Err(StoreError::SessionNotFound(id.clone()));
        }
        Ok(session)
    }

    pub async fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        let session = self.lock(id).await?;
        Ok(session.clone())
    }

    pub async fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.lock(id).await?.touch();
        Ok(())
    }

    pub async fn attach_file(
        &self,
        id: &SessionId,
        bytes: &[u8],
        original_name: &str,
    ) -> Result<AttachOutcome, StoreError> {
        let mut session = self.lock(id).await?;
        self.attach_file_locked(&mut session, bytes, original_name).await
    }

    /// Stores, validates and attaches an upload to a session the caller already holds.
    ///
    /// Invalid documents stay attached with status `invalid` so the user can see why. A document
    /// is adopted as pricing context only when it both looks like a pricing file and validates.
    pub async fn attach_file_locked(
        &self,
        session: &mut Session,
        bytes: &[u8],
        original_name: &str,
    ) -> Result<AttachOutcome, StoreError> {
        session.touch();
        let mut file = self.files.save(bytes, original_name, FileKind::Upload).await?;
        let validation = match self.files.validate(&file.id).await {
            Ok(validation) => validation,
            Err(error) => {
                self.discard_file(&session.id, &file.id).await;
                return Err(error.into());
            }
        };
        if !validation.is_valid {
            file.status = FileStatus::Invalid;
        }

        let content = String::from_utf8_lossy(bytes);
        let context_adopted =
            validation.is_valid && pricing::looks_like_pricing_document(original_name, &content);
        let context = if context_adopted {
            match load_context(self.files.as_ref(), &file).await {
                Ok(context) => Some(context),
                Err(error) => {
                    self.discard_file(&session.id, &file.id).await;
                    return Err(error.into());
                }
            }
        } else {
            None
        };

        session.attach_file(file.clone());
        if let Some(context) = context {
            session.set_pricing_context(context);
        }

        info!(
            event_name = "session.file_attached",
            session_id = %session.id,
            correlation_id = "upload",
            file_id = %file.id,
            valid = validation.is_valid,
            context_adopted,
            "file attached to session"
        );
        Ok(AttachOutcome { file, validation, context_adopted })
    }

    /// Finds a file the session may use: its own files first, then completed transformations.
    pub async fn resolve_file_locked(
        &self,
        session: &Session,
        file_id: &FileId,
    ) -> Result<Option<FileRef>, StoreError> {
        if let Some(file) = session.file(file_id) {
            return Ok(Some(file.clone()));
        }
        let pool = self.files.list_by_prefix(FileKind::Transformation).await?;
        Ok(pool.into_iter().find(|file| &file.id == file_id))
    }

    pub async fn set_pricing_context(
        &self,
        id: &SessionId,
        file_id: &FileId,
    ) -> Result<PricingContextInfo, StoreError> {
        let mut session = self.lock(id).await?;
        session.touch();

        let file = self
            .resolve_file_locked(&session, file_id)
            .await?
            .ok_or_else(|| StoreError::FileNotFound(file_id.clone()))?;
        if !file.is_usable() {
            warn!(
                event_name = "session.context.invalid_file",
                session_id = %session.id,
                file_id = %file.id,
                "explicitly selected context file failed validation"
            );
        }

        let context = load_context(self.files.as_ref(), &file).await.map_err(|error| {
            if error.is_not_found() {
                StoreError::FileNotFound(file_id.clone())
            } else {
                error.into()
            }
        })?;
        session.set_pricing_context(context);

        info!(
            event_name = "session.context.set",
            session_id = %session.id,
            correlation_id = "context",
            file_id = %file.id,
            "pricing context set"
        );
        Ok(session.pricing_context_info())
    }

    pub async fn clear_pricing_context(
        &self,
        id: &SessionId,
    ) -> Result<PricingContextInfo, StoreError> {
        let mut session = self.lock(id).await?;
        session.touch();
        session.clear_pricing_context();

        info!(
            event_name = "session.context.cleared",
            session_id = %session.id,
            correlation_id = "context",
            "pricing context cleared"
        );
        Ok(session.pricing_context_info())
    }

    pub async fn pricing_context_info(
        &self,
        id: &SessionId,
    ) -> Result<PricingContextInfo, StoreError> {
        Ok(self.lock(id).await?.pricing_context_info())
    }

    pub async fn list_messages(&self, id: &SessionId) -> Result<Vec<Message>, StoreError> {
        Ok(self.lock(id).await?.messages().to_vec())
    }

    pub async fn list_files(&self, id: &SessionId) -> Result<Vec<FileRef>, StoreError> {
        Ok(self.lock(id).await?.files().cloned().collect())
    }

    pub async fn list_jobs(&self, id: &SessionId) -> Result<Vec<JobRef>, StoreError> {
        Ok(self.lock(id).await?.jobs().cloned().collect())
    }

    /// Forgets the session and releases its files. Waits for an in-flight turn to finish.
    pub async fn delete(&self, id: &SessionId) -> Result<usize, StoreError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))?;

        let mut session = handle.lock().await;
        session.retire();
        let files = session.take_files();
        drop(session);
        let released = self.release_files(id, files).await;

        info!(
            event_name = "session.deleted",
            session_id = %id,
            correlation_id = "session",
            files_released = released,
            "session deleted"
        );
        Ok(released)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub(crate) async fn entries(&self) -> Vec<(SessionId, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    /// Removes the entry only if it still points at `handle`.
    pub(crate) async fn remove_if_current(&self, id: &SessionId, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Deletes a file that was stored but never handed to a session.
    pub async fn discard_file(&self, id: &SessionId, file_id: &FileId) {
        if let Err(error) = self.files.delete(file_id).await {
            if !error.is_not_found() {
                warn!(
                    event_name = "session.file_discard_failed",
                    session_id = %id,
                    file_id = %file_id,
                    error = %error,
                    "could not discard unattached file"
                );
            }
        }
    }

    pub(crate) async fn release_files(&self, id: &SessionId, files: Vec<FileRef>) -> usize {
        let mut released = 0;
        for file in files {
            match self.files.delete(&file.id).await {
                Ok(()) => released += 1,
                Err(error) if error.is_not_found() => {}
                Err(error) => warn!(
                    event_name = "session.file_release_failed",
                    session_id = %id,
                    file_id = %file.id,
                    error = %error,
                    "could not release session file"
                ),
            }
        }
        released
    }
}
