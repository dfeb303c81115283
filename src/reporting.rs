//! User-facing error notifications
//!
//! Fetch failures are surfaced as global notifications that name the list
//! which could not be retrieved; data-integrity problems (an experiment
//! whose priority is unknown) are surfaced as page-level errors. Neither
//! kind is fatal; the panel stays usable for a new selection.

use crate::service::ServiceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Sink for the notifications raised while driving a panel.
pub trait ErrorReporter: Send + Sync {
    /// Reports a failed remote fetch together with a message naming what failed.
    fn global_error(&self, error: &ServiceError, context: &str);

    /// Reports a page-level error dialog.
    fn page_error(&self, title: &str, message: &str);
}

/// Kind of a recorded notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// Remote fetch failure
    Global,
    /// Data-integrity problem
    Page,
}

/// A notification raised by the panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Reporter that logs every notice through `tracing` and keeps it so the
/// owner of the panel can display it later.
#[derive(Debug, Default)]
pub struct NoticeLog {
    notices: Mutex<Vec<Notice>>,
}

impl NoticeLog {
    pub fn new() -> Self {
        NoticeLog {
            notices: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of all notices recorded so far, oldest first.
    pub fn notices(&self) -> Vec<Notice> {
        match self.notices.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Removes and returns all recorded notices.
    pub fn drain(&self) -> Vec<Notice> {
        match self.notices.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        match self.notices.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn push(&self, notice: Notice) {
        match self.notices.lock() {
            Ok(mut guard) => guard.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}

impl ErrorReporter for NoticeLog {
    fn global_error(&self, error: &ServiceError, context: &str) {
        tracing::error!(error = %error, "{}", context);
        self.push(Notice {
            kind: NoticeKind::Global,
            title: context.to_string(),
            message: error.to_string(),
            raised_at: Utc::now(),
        });
    }

    fn page_error(&self, title: &str, message: &str) {
        tracing::error!(title = %title, "{}", message);
        self.push(Notice {
            kind: NoticeKind::Page,
            title: title.to_string(),
            message: message.to_string(),
            raised_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_log_records_in_order() {
        let log = NoticeLog::new();
        log.global_error(
            &ServiceError::NetworkError("connection refused".to_string()),
            "The list of priorities could not be retrieved.",
        );
        log.page_error("Problem Getting Experiments", "missing priority");

        let notices = log.notices();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].kind, NoticeKind::Global);
        assert_eq!(notices[0].title, "The list of priorities could not be retrieved.");
        assert!(notices[0].message.contains("connection refused"));
        assert_eq!(notices[1].kind, NoticeKind::Page);
    }

    #[test]
    fn test_notice_log_drain_empties() {
        let log = NoticeLog::new();
        log.page_error("t", "m");
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
    }
}
