//! Fire-and-forget terminal-state notifications.
//!
//! The orchestrator emits one notice per session when it reaches a
//! terminal state and never blocks on delivery.

use tracing::info;

use cutover_state::{Outcome, SessionId};

/// Summary of a session that just reached a terminal state.
#[derive(Debug, Clone)]
pub struct TerminalNotice {
    pub session_id: SessionId,
    pub outcome: Outcome,
    pub summary: String,
}

/// Delivery sink for terminal notices.
///
/// Implementations must return promptly; anything slow belongs on a
/// queue behind the implementation.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: TerminalNotice);
}

/// Sink that records notices in the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notice: TerminalNotice) {
        info!(
            session_id = %notice.session_id,
            outcome = ?notice.outcome,
            summary = %notice.summary,
            "upgrade session finished"
        );
    }
}
