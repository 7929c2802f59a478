//! Metrics collection for relay sessions
//!
//! Each finished session produces one [`SessionMetrics`] record. The collector
//! keeps a bounded history of them plus recent errors, for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for one finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Request frames written to the upload connection
    pub frames_sent: usize,
    pub bytes_sent: u64,
    /// Download chunks and the frames decoded from them
    pub chunks_received: usize,
    pub frames_decoded: usize,
    pub dropped_chunks: usize,
    /// Frames in the client-visible output
    pub frames_emitted: usize,
    /// "not_attempted", "applied", "unavailable" or "abandoned"
    pub augmentation: String,
    pub augmentation_latency_ms: Option<u64>,
    pub total_ms: u64,
    /// LAST frame reached the client
    pub complete: bool,
    pub error_message: Option<String>,
}

/// Summary statistics across recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub complete_sessions: u64,
    pub incomplete_sessions: u64,
    pub augmented_sessions: u64,
    /// Average total time (ms) across complete sessions in history
    pub avg_total_ms: u64,
    /// Average augmentation latency (ms) across sessions in history that waited on one
    pub avg_augmentation_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "upload", "download", "augmentation")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

pub struct MetricsCollector {
    /// Newest first
    history: VecDeque<SessionMetrics>,
    /// Newest first
    errors: VecDeque<ErrorRecord>,
    total_sessions: u64,
    complete_sessions: u64,
    augmented_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            total_sessions: 0,
            complete_sessions: 0,
            augmented_sessions: 0,
        }
    }

    pub fn record_session(&mut self, metrics: SessionMetrics) {
        self.total_sessions += 1;
        if metrics.complete {
            self.complete_sessions += 1;
        }
        if metrics.augmentation == "applied" {
            self.augmented_sessions += 1;
        }

        log::info!(
            "Metrics: session {} {} in {}ms ({} frames out, augmentation {})",
            metrics.session_id,
            if metrics.complete { "completed" } else { "ended early" },
            metrics.total_ms,
            metrics.frames_emitted,
            metrics.augmentation
        );

        if let Some(message) = &metrics.error_message {
            self.record_error(
                "session".to_string(),
                message.clone(),
                Some(metrics.session_id.clone()),
            );
        }

        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let complete: Vec<_> = self.history.iter().filter(|s| s.complete).collect();
        let avg_total_ms = if complete.is_empty() {
            0
        } else {
            complete.iter().map(|s| s.total_ms).sum::<u64>() / complete.len() as u64
        };

        let latencies: Vec<u64> = self
            .history
            .iter()
            .filter_map(|s| s.augmentation_latency_ms)
            .collect();
        let avg_augmentation_ms = if latencies.is_empty() {
            0
        } else {
            latencies.iter().sum::<u64>() / latencies.len() as u64
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            complete_sessions: self.complete_sessions,
            incomplete_sessions: self.total_sessions.saturating_sub(self.complete_sessions),
            augmented_sessions: self.augmented_sessions,
            avg_total_ms,
            avg_augmentation_ms,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Session history (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
