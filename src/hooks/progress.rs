//! Progress-block coalescing for `session.progress` streams.

use crate::capture::overlap_len;
use crate::config::ProgressMode;

/// One buffered progress block, keyed by turn.
#[derive(Debug)]
pub struct ProgressBlock {
    pub text: String,
    /// Channel the flush will target.
    pub channel: String,
    pub mode: ProgressMode,
    /// Single-shot flush timer; aborted on size-flush, final, or stop.
    pub timer: Option<tokio::task::AbortHandle>,
}

impl Drop for ProgressBlock {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Merge a new progress chunk into buffered text without repeating content
/// that already streamed. Uses the longest-suffix/prefix overlap, the same
/// rule the capture differ applies to pane snapshots.
pub fn merge_progress(existing: &str, incoming: &str) -> String {
    if existing.is_empty() {
        return incoming.to_string();
    }
    if incoming.is_empty() {
        return existing.to_string();
    }
    let overlap = overlap_len(existing, incoming);
    if overlap == incoming.len() {
        // Entirely already streamed.
        return existing.to_string();
    }
    let fresh = &incoming[overlap..];
    if overlap > 0 {
        format!("{existing}{fresh}")
    } else {
        format!("{existing}\n{fresh}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_chunks_join_with_newline() {
        assert_eq!(merge_progress("line one", "line two"), "line one\nline two");
    }

    #[test]
    fn overlapping_chunk_is_not_repeated() {
        let merged = merge_progress("reading src/main.rs", "src/main.rs done");
        assert_eq!(merged, "reading src/main.rs done");
    }

    #[test]
    fn fully_streamed_chunk_is_dropped() {
        assert_eq!(merge_progress("abcdef", "def"), "abcdef");
    }

    #[test]
    fn empty_sides_pass_through() {
        assert_eq!(merge_progress("", "x"), "x");
        assert_eq!(merge_progress("x", ""), "x");
    }
}
