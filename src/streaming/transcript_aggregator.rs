//! Per-turn transcript assembly
//!
//! Deltas for the current turn are appended as they arrive; the `completed`
//! event for that turn is authoritative and closes it. Deltas are keyed by
//! item id so a late delta from a finished turn never leaks into the next.

#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    item_id: Option<String>,
    partial_text: String,
    delta_count: u64,
    turns_completed: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return the turn's text so far.
    ///
    /// A delta for a different item starts a new turn.
    pub fn process_delta(&mut self, item_id: Option<&str>, delta: &str) -> &str {
        if item_id.is_some() && item_id != self.item_id.as_deref() {
            self.partial_text.clear();
            self.item_id = item_id.map(str::to_string);
        }
        if !delta.is_empty() {
            self.partial_text.push_str(delta);
            self.delta_count += 1;
        }
        &self.partial_text
    }

    /// Close the current turn with the authoritative text.
    pub fn process_completed(&mut self, transcript: &str) -> String {
        log::debug!(
            "TranscriptAggregator: turn completed with {} chars ({} deltas, {} partial chars)",
            transcript.len(),
            self.delta_count,
            self.partial_text.len()
        );
        self.turns_completed += 1;
        self.reset();
        transcript.trim().to_string()
    }

    pub fn partial_text(&self) -> &str {
        &self.partial_text
    }

    pub fn turns_completed(&self) -> u64 {
        self.turns_completed
    }

    /// Forget the in-progress turn.
    pub fn reset(&mut self) {
        self.item_id = None;
        self.partial_text.clear();
        self.delta_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_deltas() {
        let mut agg = TranscriptAggregator::new();
        agg.process_delta(Some("a"), "hey");
        agg.process_delta(Some("a"), " ");
        assert_eq!(agg.process_delta(Some("a"), "lark"), "hey lark");
    }

    #[test]
    fn test_empty_delta_ignored() {
        let mut agg = TranscriptAggregator::new();
        agg.process_delta(None, "run");
        agg.process_delta(None, "");
        assert_eq!(agg.partial_text(), "run");
    }

    #[test]
    fn completed_overrides_and_resets() {
        let mut agg = TranscriptAggregator::new();
        agg.process_delta(Some("a"), "hey lrk");
        assert_eq!(agg.process_completed(" hey lark "), "hey lark");
        assert_eq!(agg.partial_text(), "");
        assert_eq!(agg.turns_completed(), 1);
    }

    #[test]
    fn new_item_starts_new_turn() {
        let mut agg = TranscriptAggregator::new();
        agg.process_delta(Some("a"), "first");
        assert_eq!(agg.process_delta(Some("b"), "second"), "second");
    }
}
