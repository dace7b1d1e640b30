pub mod file_store;
pub mod reaper;
pub mod sessions;

pub use file_store::{FileStore, FileStoreError, LocalFileStore};
pub use reaper::{ReapReport, SessionReaper};
pub use sessions::{AttachOutcome, SessionGuard, SessionHandle, SessionStore, StoreError};
