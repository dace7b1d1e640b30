pub mod config;
pub mod domain;
pub mod errors;
pub mod pricing;

pub use config::{AppConfig, ConfigError, LoadOptions, LogFormat};
pub use domain::file::{FileId, FileKind, FileRef, FileStatus};
pub use domain::job::{JobId, JobKind, JobRef, JobStatus};
pub use domain::message::{Message, MessagePart, Role, ToolCallRequest, ToolCallResult, ToolOutcome};
pub use domain::session::{PricingContext, PricingContextInfo, Session, SessionId};
pub use errors::{ApplicationError, InterfaceError, ResourceKind};
pub use pricing::ValidationReport;
