use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::file::{FileId, FileRef};
use crate::domain::job::{JobId, JobRef};
use crate::domain::message::Message;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Document embedded in the session's system preamble.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingContext {
    pub content: String,
    pub file_name: String,
    pub file_id: FileId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingContextInfo {
    pub has_context: bool,
    pub file_name: Option<String>,
    pub file_id: Option<FileId>,
    pub content_length: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    messages: Vec<Message>,
    files: BTreeMap<FileId, FileRef>,
    jobs: BTreeMap<JobId, JobRef>,
    pricing_context: Option<PricingContext>,
    #[serde(skip)]
    retired: bool,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            messages: Vec::new(),
            files: BTreeMap::new(),
            jobs: BTreeMap::new(),
            pricing_context: None,
            retired: false,
        }
    }

    /// Marks a session that has been dropped from the store. Holders of a stale handle must
    /// treat it as gone.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    pub fn is_inactive_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_activity < cutoff
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Appends a finished turn. The log is never reordered or truncated.
    pub fn commit_messages(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn files(&self) -> impl Iterator<Item = &FileRef> {
        self.files.values()
    }

    pub fn file(&self, id: &FileId) -> Option<&FileRef> {
        self.files.get(id)
    }

    pub fn attach_file(&mut self, file: FileRef) {
        self.files.insert(file.id.clone(), file);
    }

    /// Drains every owned file so the caller can release storage.
    pub fn take_files(&mut self) -> Vec<FileRef> {
        std::mem::take(&mut self.files).into_values().collect()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRef> {
        self.jobs.values()
    }

    pub fn job(&self, id: &JobId) -> Option<&JobRef> {
        self.jobs.get(id)
    }

    pub fn job_mut(&mut self, id: &JobId) -> Option<&mut JobRef> {
        self.jobs.get_mut(id)
    }

    pub fn record_job(&mut self, job: JobRef) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn pricing_context(&self) -> Option<&PricingContext> {
        self.pricing_context.as_ref()
    }

    /// Last write wins; the previous context is returned.
    pub fn set_pricing_context(&mut self, context: PricingContext) -> Option<PricingContext> {
        self.pricing_context.replace(context)
    }

    pub fn clear_pricing_context(&mut self) -> Option<PricingContext> {
        self.pricing_context.take()
    }

    pub fn pricing_context_info(&self) -> PricingContextInfo {
        match &self.pricing_context {
            Some(context) => PricingContextInfo {
                has_context: true,
                file_name: Some(context.file_name.clone()),
                file_id: Some(context.file_id.clone()),
                content_length: context.content.len(),
            },
            None => PricingContextInfo {
                has_context: false,
                file_name: None,
                file_id: None,
                content_length: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::domain::file::FileId;
    use crate::domain::message::Message;

    use super::{PricingContext, Session, SessionId};

    fn context(name: &str) -> PricingContext {
        PricingContext {
            content: format!("saasName: {name}"),
            file_name: format!("{name}.yaml"),
            file_id: FileId(format!("upload_{name}")),
        }
    }

    #[test]
    fn new_session_starts_without_context() {
        let session = Session::new(SessionId::generate());
        let info = session.pricing_context_info();

        assert!(!info.has_context);
        assert!(info.file_name.is_none());
        assert!(session.messages().is_empty());
    }

    #[test]
    fn context_is_last_write_wins() {
        let mut session = Session::new(SessionId::generate());
        assert!(session.set_pricing_context(context("first")).is_none());

        let previous = session.set_pricing_context(context("second"));
        assert_eq!(previous.map(|c| c.file_name), Some("first.yaml".to_string()));
        assert_eq!(session.pricing_context_info().file_name.as_deref(), Some("second.yaml"));

        session.clear_pricing_context();
        assert!(!session.pricing_context_info().has_context);
    }

    #[test]
    fn touch_never_moves_activity_backwards() {
        let mut session = Session::new(SessionId::generate());
        let original = session.last_activity;

        session.touch_at(original - Duration::hours(3));
        assert_eq!(session.last_activity, original);

        let later = Utc::now() + Duration::minutes(5);
        session.touch_at(later);
        assert_eq!(session.last_activity, later);
        assert!(!session.is_inactive_since(later));
        assert!(session.is_inactive_since(later + Duration::seconds(1)));
    }

    #[test]
    fn retired_flag_is_not_serialized() {
        let mut session = Session::new(SessionId::generate());
        assert!(!session.is_retired());
        session.retire();
        assert!(session.is_retired());

        let json = serde_json::to_value(&session).expect("serialize");
        assert!(json.get("retired").is_none());
    }

    #[test]
    fn committed_messages_keep_order() {
        let mut session = Session::new(SessionId::generate());
        session.commit_messages([Message::user_text("hi"), Message::model_text("hello")]);
        session.commit_messages([Message::user_text("again")]);

        let texts = session.messages().iter().filter_map(Message::text).collect::<Vec<_>>();
        assert_eq!(texts, vec!["hi", "hello", "again"]);
    }
}
