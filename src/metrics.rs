//! Metrics collection for conversation turns
//!
//! Tracks per-turn timing (time to first fragment, total response time),
//! turn outcomes, and a short error history. Shared across sessions behind
//! a mutex; every method is cheap.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of finished turns to retain in history
const MAX_TURN_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Generated text (audio may still have been substituted)
    Completed,
    /// Generation failed; the fallback message was used
    Fallback,
}

/// Metrics for a finished response turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub turn_id: String,
    /// Unix timestamp when the response started (seconds)
    pub started_at: u64,
    /// Time from response start to the first generated fragment
    pub first_fragment_ms: Option<u64>,
    /// Time from response start to the end of synthesis
    pub total_ms: u64,
    /// Length of the assistant message in characters
    pub response_chars: u64,
    pub outcome: TurnOutcome,
}

/// Summary statistics across all recorded turns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub sessions_opened: u64,
    pub active_sessions: u64,
    pub turns_completed: u64,
    pub empty_turns: u64,
    pub fallback_turns: u64,
    /// Average time to first fragment (ms) across turns that produced one
    pub avg_first_fragment_ms: u64,
    /// Average total response time (ms) across completed turns
    pub avg_total_ms: u64,
    pub last_error: Option<ErrorRecord>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sessions={} (active {}), turns={} (empty {}, fallback {}), avg first fragment {}ms, avg response {}ms",
            self.sessions_opened,
            self.active_sessions,
            self.turns_completed,
            self.empty_turns,
            self.fallback_turns,
            self.avg_first_fragment_ms,
            self.avg_total_ms
        )
    }
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Error class (`capability_failure`, `transport_failure`, ...)
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

struct TurnInProgress {
    started_at: Instant,
    started_at_unix: u64,
    first_fragment: Option<Instant>,
}

impl TurnInProgress {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            first_fragment: None,
        }
    }

    fn to_metrics(&self, turn_id: Uuid, response_chars: usize, outcome: TurnOutcome) -> TurnMetrics {
        TurnMetrics {
            turn_id: turn_id.to_string(),
            started_at: self.started_at_unix,
            first_fragment_ms: self
                .first_fragment
                .map(|t| t.duration_since(self.started_at).as_millis() as u64),
            total_ms: self.started_at.elapsed().as_millis() as u64,
            response_chars: response_chars as u64,
            outcome,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Collects metrics for response turns across all sessions
pub struct MetricsCollector {
    /// Finished turns (newest first)
    history: VecDeque<TurnMetrics>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    in_progress: HashMap<Uuid, TurnInProgress>,
    sessions_opened: u64,
    active_sessions: u64,
    turns_completed: u64,
    empty_turns: u64,
    fallback_turns: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_TURN_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            in_progress: HashMap::new(),
            sessions_opened: 0,
            active_sessions: 0,
            turns_completed: 0,
            empty_turns: 0,
            fallback_turns: 0,
        }
    }

    pub fn session_opened(&mut self) {
        self.sessions_opened += 1;
        self.active_sessions += 1;
    }

    pub fn session_closed(&mut self) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
    }

    /// A turn boundary arrived with no speech
    pub fn empty_turn(&mut self) {
        self.empty_turns += 1;
    }

    pub fn response_started(&mut self, turn_id: Uuid) {
        log::debug!("Metrics: response started for turn {}", turn_id);
        self.in_progress.insert(turn_id, TurnInProgress::new());
    }

    pub fn first_fragment(&mut self, turn_id: Uuid) {
        if let Some(turn) = self.in_progress.get_mut(&turn_id) {
            if turn.first_fragment.is_none() {
                turn.first_fragment = Some(Instant::now());
            }
        }
    }

    /// Response finished; `outcome` says whether the text was generated
    pub fn response_finished(&mut self, turn_id: Uuid, response_chars: usize, outcome: TurnOutcome) {
        let Some(turn) = self.in_progress.remove(&turn_id) else {
            return;
        };
        let metrics = turn.to_metrics(turn_id, response_chars, outcome);
        log::info!(
            "Metrics: turn {} {:?} - first fragment {:?}ms, total {}ms, {} chars",
            metrics.turn_id,
            outcome,
            metrics.first_fragment_ms,
            metrics.total_ms,
            metrics.response_chars
        );
        self.turns_completed += 1;
        if outcome == TurnOutcome::Fallback {
            self.fallback_turns += 1;
        }
        self.add_to_history(metrics);
    }

    /// Drop a turn that was cancelled (session closed mid-response)
    pub fn response_cancelled(&mut self, turn_id: Uuid) {
        if self.in_progress.remove(&turn_id).is_some() {
            log::debug!("Metrics: turn {} cancelled", turn_id);
        }
    }

    pub fn record_error(&mut self, error_type: &str, message: String, session_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type: error_type.to_string(),
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
        let firsts: Vec<u64> = self.history.iter().filter_map(|t| t.first_fragment_ms).collect();
        let avg_first_fragment_ms = if firsts.is_empty() {
            0
        } else {
            firsts.iter().sum::<u64>() / firsts.len() as u64
        };

        let completed: Vec<_> = self
            .history
            .iter()
            .filter(|t| t.outcome == TurnOutcome::Completed)
            .collect();
        let avg_total_ms = if completed.is_empty() {
            0
        } else {
            completed.iter().map(|t| t.total_ms).sum::<u64>() / completed.len() as u64
        };

        MetricsSummary {
            sessions_opened: self.sessions_opened,
            active_sessions: self.active_sessions,
            turns_completed: self.turns_completed,
            empty_turns: self.empty_turns,
            fallback_turns: self.fallback_turns,
            avg_first_fragment_ms,
            avg_total_ms,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished turns (newest first)
    pub fn get_history(&self) -> Vec<TurnMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: TurnMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_TURN_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide collector shared by sessions
pub type SharedMetrics = Arc<Mutex<MetricsCollector>>;

pub fn shared() -> SharedMetrics {
    Arc::new(Mutex::new(MetricsCollector::new()))
}

/// Run `f` against the collector; a poisoned lock skips the update
pub fn record<F: FnOnce(&mut MetricsCollector)>(metrics: &SharedMetrics, f: F) {
    if let Ok(mut collector) = metrics.lock() {
        f(&mut collector);
    }
}

pub fn summary(metrics: &SharedMetrics) -> Option<MetricsSummary> {
    metrics.lock().ok().map(|m| m.get_summary())
}
