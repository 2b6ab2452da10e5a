//! Per-run event channel
//!
//! Progress, readiness, and violation notifications flow over an
//! explicit channel created per run. Consumers subscribe by holding
//! the receiver; there is no process-wide emitter.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::suite::ContractViolation;

/// Events emitted during a run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    ServerReady {
        name: String,
        url: String,
    },
    SuiteStarted {
        suite: String,
    },
    FileFinished {
        suite: String,
        file: String,
        passed: bool,
        duration_ms: u64,
    },
    SuiteFinished {
        suite: String,
        failed: usize,
    },
    ContractViolation(ContractViolation),
    Bail {
        suite: String,
    },
}

/// Sender half of a run's event channel
///
/// Cheap to clone; `emit` never blocks and silently drops events once
/// the subscriber goes away (teardown paths still emit safely).
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A bus with no subscriber, for standalone component use
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (bus, mut rx) = EventBus::channel();
        bus.emit(RunEvent::SuiteStarted { suite: "s".into() });
        bus.emit(RunEvent::SuiteFinished {
            suite: "s".into(),
            failed: 0,
        });

        assert!(matches!(
            rx.recv().await,
            Some(RunEvent::SuiteStarted { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(RunEvent::SuiteFinished { failed: 0, .. })
        ));
    }

    #[test]
    fn test_emit_without_subscriber_is_silent() {
        let bus = EventBus::detached();
        bus.emit(RunEvent::Bail { suite: "x".into() });
    }
}
