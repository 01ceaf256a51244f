use serde::Serialize;

use super::session::{SessionSummary, SummaryOutcome};
use super::stats::{format_duration, format_tokens};
use super::ui::{error, info, minted, success, warn};

/// Summary events for display. Fire-and-forget: the orchestrator never waits on a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Started {
        session_id: String,
        worker_count: u32,
        requested: u32,
        expected_yield: u64,
    },
    Minted {
        amount: u64,
        records: usize,
        total: u64,
    },
    Completed(SessionSummary),
    Stopped(SessionSummary),
    OrphansCleared {
        sessions: usize,
    },
    Error {
        message: String,
    },
}

impl Notification {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Minted { .. } => "minted",
            Self::Completed(_) => "completed",
            Self::Stopped(_) => "stopped",
            Self::OrphansCleared { .. } => "orphans_cleared",
            Self::Error { .. } => "error",
        }
    }

    pub fn message(&self, decimals: u32) -> String {
        match self {
            Self::Started {
                worker_count,
                requested,
                expected_yield,
                ..
            } => {
                let mut line = format!("{} started", plural(*worker_count as usize, "worker"));
                let failed = requested.saturating_sub(*worker_count);
                if failed > 0 {
                    line.push_str(&format!(" ({failed} failed to start)"));
                }
                line.push_str(&format!(
                    " | expected ~{} tokens",
                    format_tokens(*expected_yield, decimals)
                ));
                line
            }
            Self::Minted {
                amount,
                records,
                total,
            } => format!(
                "+{} tokens from {} | total {}",
                format_tokens(*amount, decimals),
                plural(*records, "deposit"),
                format_tokens(*total, decimals)
            ),
            Self::Completed(summary) | Self::Stopped(summary) => {
                let verb = match summary.outcome {
                    SummaryOutcome::Completed => "complete",
                    SummaryOutcome::Stopped => "stopped",
                };
                format!(
                    "session {} {verb} | minted {} tokens in {} | {}",
                    summary.session_id,
                    format_tokens(summary.minted, decimals),
                    format_duration(summary.elapsed()),
                    plural(summary.worker_count as usize, "worker")
                )
            }
            Self::OrphansCleared { sessions } => format!(
                "cleared {} left over from another instance",
                plural(*sessions, "stale session")
            ),
            Self::Error { message } => message.clone(),
        }
    }
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the terminal log.
pub struct LogNotifier {
    decimals: u32,
}

impl LogNotifier {
    pub fn new(decimals: u32) -> Self {
        Self { decimals }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let message = notification.message(self.decimals);
        match notification {
            Notification::Started { .. } => success("FARM", message),
            Notification::Minted { .. } => minted("MINT", message),
            Notification::Completed(_) => success("FARM", message),
            Notification::Stopped(_) => info("FARM", message),
            Notification::OrphansCleared { .. } => warn("RECONCILE", message),
            Notification::Error { .. } => error("FARM", message),
        }
    }
}
