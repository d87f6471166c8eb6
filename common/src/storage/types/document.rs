use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use uuid::Uuid;

use crate::error::AppError;

/// Persisted error messages are capped so a deep collaborator stack trace
/// cannot blow up the document record.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 512;

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentStatus {
    #[default]
    Uploaded,
    Parsing,
    Parsed,
    Indexing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "Uploaded",
            DocumentStatus::Parsing => "Parsing",
            DocumentStatus::Parsed => "Parsed",
            DocumentStatus::Indexing => "Indexing",
            DocumentStatus::Indexed => "Indexed",
            DocumentStatus::Failed => "Failed",
        }
    }

    /// `Indexed` is the only status nothing may ever leave. `Failed` is
    /// re-enterable through the retry edges until the retry budget runs out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Indexed)
    }

    /// The event that moves a document *into* this status, used to validate
    /// repository updates against the lifecycle machine.
    fn entering_transition(&self) -> Option<DocumentTransition> {
        match self {
            DocumentStatus::Uploaded => None,
            DocumentStatus::Parsing => Some(DocumentTransition::BeginParsing),
            DocumentStatus::Parsed => Some(DocumentTransition::CompleteParsing),
            DocumentStatus::Indexing => Some(DocumentTransition::BeginIndexing),
            DocumentStatus::Indexed => Some(DocumentTransition::CompleteIndexing),
            DocumentStatus::Failed => Some(DocumentTransition::Fail),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DocumentTransition {
    BeginParsing,
    CompleteParsing,
    BeginIndexing,
    CompleteIndexing,
    Fail,
}

impl DocumentTransition {
    fn as_str(&self) -> &'static str {
        match self {
            DocumentTransition::BeginParsing => "begin_parsing",
            DocumentTransition::CompleteParsing => "complete_parsing",
            DocumentTransition::BeginIndexing => "begin_indexing",
            DocumentTransition::CompleteIndexing => "complete_indexing",
            DocumentTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: DocumentLifecycleMachine,
        initial: Uploaded,
        states: [Uploaded, Parsing, Parsed, Indexing, Indexed, Failed],
        events {
            begin_parsing {
                transition: { from: Uploaded, to: Parsing }
                transition: { from: Failed, to: Parsing }
            }
            complete_parsing {
                transition: { from: Parsing, to: Parsed }
                transition: { from: Uploaded, to: Parsed }
                transition: { from: Failed, to: Parsed }
            }
            begin_indexing {
                transition: { from: Parsed, to: Indexing }
                transition: { from: Failed, to: Indexing }
            }
            complete_indexing {
                transition: { from: Indexing, to: Indexed }
            }
            fail {
                transition: { from: Uploaded, to: Failed }
                transition: { from: Parsing, to: Failed }
                transition: { from: Parsed, to: Failed }
                transition: { from: Indexing, to: Failed }
                transition: { from: Failed, to: Failed }
            }
        }
    }

    pub(super) fn uploaded() -> DocumentLifecycleMachine<(), Uploaded> {
        DocumentLifecycleMachine::new(())
    }

    pub(super) fn parsing() -> DocumentLifecycleMachine<(), Parsing> {
        uploaded()
            .begin_parsing()
            .expect("begin_parsing transition from Uploaded should exist")
    }

    pub(super) fn parsed() -> DocumentLifecycleMachine<(), Parsed> {
        parsing()
            .complete_parsing()
            .expect("complete_parsing transition from Parsing should exist")
    }

    pub(super) fn indexing() -> DocumentLifecycleMachine<(), Indexing> {
        parsed()
            .begin_indexing()
            .expect("begin_indexing transition from Parsed should exist")
    }

    pub(super) fn failed() -> DocumentLifecycleMachine<(), Failed> {
        parsing()
            .fail()
            .expect("fail transition from Parsing should exist")
    }
}

fn invalid_transition(status: &DocumentStatus, event: DocumentTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid document transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(
    status: &DocumentStatus,
    event: DocumentTransition,
) -> Result<DocumentStatus, AppError> {
    use lifecycle::*;
    match (status, event) {
        (DocumentStatus::Uploaded, DocumentTransition::BeginParsing) => uploaded()
            .begin_parsing()
            .map(|_| DocumentStatus::Parsing)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Failed, DocumentTransition::BeginParsing) => failed()
            .begin_parsing()
            .map(|_| DocumentStatus::Parsing)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Parsing, DocumentTransition::CompleteParsing) => parsing()
            .complete_parsing()
            .map(|_| DocumentStatus::Parsed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Uploaded, DocumentTransition::CompleteParsing) => uploaded()
            .complete_parsing()
            .map(|_| DocumentStatus::Parsed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Failed, DocumentTransition::CompleteParsing) => failed()
            .complete_parsing()
            .map(|_| DocumentStatus::Parsed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Parsed, DocumentTransition::BeginIndexing) => parsed()
            .begin_indexing()
            .map(|_| DocumentStatus::Indexing)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Failed, DocumentTransition::BeginIndexing) => failed()
            .begin_indexing()
            .map(|_| DocumentStatus::Indexing)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Indexing, DocumentTransition::CompleteIndexing) => indexing()
            .complete_indexing()
            .map(|_| DocumentStatus::Indexed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Uploaded, DocumentTransition::Fail) => uploaded()
            .fail()
            .map(|_| DocumentStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Parsing, DocumentTransition::Fail) => parsing()
            .fail()
            .map(|_| DocumentStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Parsed, DocumentTransition::Fail) => parsed()
            .fail()
            .map(|_| DocumentStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Indexing, DocumentTransition::Fail) => indexing()
            .fail()
            .map(|_| DocumentStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        (DocumentStatus::Failed, DocumentTransition::Fail) => failed()
            .fail()
            .map(|_| DocumentStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        _ => Err(invalid_transition(status, event)),
    }
}

/// Checks that moving `current -> next` follows the lifecycle graph.
pub fn validate_transition(
    current: &DocumentStatus,
    next: &DocumentStatus,
) -> Result<(), AppError> {
    let Some(event) = next.entering_transition() else {
        return Err(AppError::Validation(format!(
            "Invalid document transition: {} -> {}",
            current.as_str(),
            next.as_str()
        )));
    };
    let computed = compute_next_status(current, event)?;
    debug_assert_eq!(&computed, next);
    Ok(())
}

pub fn truncate_error(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_MAX_CHARS).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub knowledge_base_id: String,
    pub file_name: String,
    pub content_type: String,
    pub object_key: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        tenant_id: impl Into<String>,
        knowledge_base_id: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        object_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            knowledge_base_id: knowledge_base_id.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            object_key: object_key.into(),
            status: DocumentStatus::Uploaded,
            error_message: None,
            retry_count: 0,
            last_retry_at: None,
            content: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_defaults() {
        let document = Document::new(
            "tenant-1",
            "kb-1",
            "notes.txt",
            "text/plain",
            "tenant-1/doc/notes.txt",
        );

        assert_eq!(document.status, DocumentStatus::Uploaded);
        assert_eq!(document.retry_count, 0);
        assert!(document.error_message.is_none());
        assert!(document.content.is_none());
    }

    #[test]
    fn forward_transitions_follow_the_graph() {
        let pairs = [
            (DocumentStatus::Uploaded, DocumentStatus::Parsing),
            (DocumentStatus::Parsing, DocumentStatus::Parsed),
            (DocumentStatus::Parsed, DocumentStatus::Indexing),
            (DocumentStatus::Indexing, DocumentStatus::Indexed),
        ];

        for (current, next) in pairs {
            assert!(
                validate_transition(&current, &next).is_ok(),
                "{} -> {} should be valid",
                current.as_str(),
                next.as_str()
            );
        }
    }

    #[test]
    fn failed_is_reachable_from_every_active_status() {
        for current in [
            DocumentStatus::Uploaded,
            DocumentStatus::Parsing,
            DocumentStatus::Parsed,
            DocumentStatus::Indexing,
            DocumentStatus::Failed,
        ] {
            assert!(validate_transition(&current, &DocumentStatus::Failed).is_ok());
        }
    }

    #[test]
    fn nothing_leaves_indexed() {
        for next in [
            DocumentStatus::Parsing,
            DocumentStatus::Parsed,
            DocumentStatus::Indexing,
            DocumentStatus::Failed,
        ] {
            assert!(
                validate_transition(&DocumentStatus::Indexed, &next).is_err(),
                "Indexed -> {} must be rejected",
                next.as_str()
            );
        }
    }

    #[test]
    fn retry_edges_re_enter_the_pipeline_from_failed() {
        assert!(validate_transition(&DocumentStatus::Failed, &DocumentStatus::Parsing).is_ok());
        assert!(validate_transition(&DocumentStatus::Failed, &DocumentStatus::Parsed).is_ok());
        assert!(validate_transition(&DocumentStatus::Failed, &DocumentStatus::Indexing).is_ok());
        assert!(validate_transition(&DocumentStatus::Failed, &DocumentStatus::Indexed).is_err());
    }

    #[test]
    fn skipping_stages_is_rejected() {
        assert!(validate_transition(&DocumentStatus::Uploaded, &DocumentStatus::Indexing).is_err());
        assert!(validate_transition(&DocumentStatus::Parsing, &DocumentStatus::Indexed).is_err());
        assert!(validate_transition(&DocumentStatus::Parsed, &DocumentStatus::Uploaded).is_err());
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(ERROR_MESSAGE_MAX_CHARS * 2);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), ERROR_MESSAGE_MAX_CHARS);

        let short = "broken pipe";
        assert_eq!(truncate_error(short), short);
    }
}
