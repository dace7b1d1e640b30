use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Session,
    File,
    Job,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::File => "file",
            Self::Job => "job",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{} `{id}` not found", .kind.as_str())]
    NotFound { kind: ResourceKind, id: String },
    #[error("collaborator `{service}` failed: {message}")]
    Collaborator { service: String, message: String },
    #[error("malformed model output: {0}")]
    Protocol(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl ApplicationError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: ResourceKind::Session, id: id.into() }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    /// Detail that is safe to echo back to the caller.
    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::ServiceUnavailable { message, .. } => message,
            Self::Internal { .. } => self.user_message(),
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Validation(message) => Self::BadRequest { message, correlation_id },
            not_found @ ApplicationError::NotFound { .. } => {
                Self::NotFound { message: not_found.to_string(), correlation_id }
            }
            collaborator @ ApplicationError::Collaborator { .. } => {
                Self::ServiceUnavailable { message: collaborator.to_string(), correlation_id }
            }
            ApplicationError::Protocol(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Fatal(message) => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ApplicationError, InterfaceError, ResourceKind};

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface =
            ApplicationError::Validation("missing field `message`".to_owned()).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(interface.detail(), "missing field `message`");
    }

    #[test]
    fn unknown_session_is_a_client_error() {
        let interface = ApplicationError::session_not_found("s-404").into_interface("req-2");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
        assert_eq!(interface.detail(), "session `s-404` not found");
        assert_eq!(interface.user_message(), "The requested resource does not exist.");
    }

    #[test]
    fn collaborator_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Collaborator {
            service: "model".to_owned(),
            message: "request timed out".to_owned(),
        }
        .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn fatal_error_maps_to_internal_without_leaking_detail() {
        let error = ApplicationError::Fatal("storage root vanished".to_owned());
        assert!(error.is_fatal());

        let interface = error.into_interface("req-4");
        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.detail(), "An unexpected internal error occurred.");
    }

    #[test]
    fn not_found_names_resource_kind() {
        let error = ApplicationError::NotFound { kind: ResourceKind::File, id: "f-1".to_owned() };
        assert_eq!(error.to_string(), "file `f-1` not found");
    }
}
