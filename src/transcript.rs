//! Per-turn transcript accumulation
//!
//! - **Partials**: replace the display text; never touch the committed buffer
//! - **Finals**: appended to the committed buffer, single-space separated
//!
//! The turn ends on the recognizer's end-of-turn flag, never on timing.

use std::time::{Duration, Instant};

/// Text collected for one turn
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptAccumulator {
    /// Committed text from final events
    committed: String,
    /// Latest partial, for display only
    latest_partial: String,
    started_at: Instant,
    final_count: u32,
}

impl TranscriptAccumulator {
    /// Start a turn now
    pub fn start() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started_at: Instant) -> Self {
        Self {
            committed: String::new(),
            latest_partial: String::new(),
            started_at,
            final_count: 0,
        }
    }

    pub fn process_partial(&mut self, text: &str) {
        self.latest_partial.clear();
        self.latest_partial.push_str(text);
    }

    /// Append a final segment. Empty (or whitespace-only) finals are ignored.
    pub fn process_final(&mut self, text: &str) -> &str {
        let text = text.trim();
        if !text.is_empty() {
            if !self.committed.is_empty() {
                self.committed.push(' ');
            }
            self.committed.push_str(text);
            self.final_count += 1;
            log::debug!(
                "TranscriptAccumulator: {} finals, {} chars committed",
                self.final_count,
                self.committed.len()
            );
        }
        self.latest_partial.clear();
        &self.committed
    }

    /// Committed turn text
    pub fn text(&self) -> &str {
        &self.committed
    }

    /// Best text to show right now: committed text plus any pending partial
    pub fn display_text(&self) -> String {
        match (self.committed.is_empty(), self.latest_partial.is_empty()) {
            (_, true) => self.committed.clone(),
            (true, false) => self.latest_partial.clone(),
            (false, false) => format!("{} {}", self.committed, self.latest_partial),
        }
    }

    pub fn latest_partial(&self) -> &str {
        &self.latest_partial
    }

    /// No committed speech in this turn
    pub fn is_blank(&self) -> bool {
        self.committed.trim().is_empty()
    }

    pub fn started(&self) -> Instant {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}
