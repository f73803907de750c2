//! Bounded ring buffer of recent diagnostic lines

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Most recent diagnostic lines of one process, shared between its reader tasks
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    max_line_bytes: usize,
}

impl DiagnosticTail {
    /// Create a tail keeping at most `capacity` lines of at most `max_line_bytes` each
    pub fn new(capacity: usize, max_line_bytes: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Append a line, evicting the oldest when full
    pub async fn push(&self, line: impl Into<String>) {
        let mut line = line.into();
        truncate_on_char_boundary(&mut line, self.max_line_bytes);

        let mut lines = self.lines.lock().await;
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of the retained lines, oldest first
    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.lines.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lines.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn truncate_on_char_boundary(line: &mut String, max_bytes: usize) {
    if line.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    line.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keeps_most_recent_lines() {
        let tail = DiagnosticTail::new(3, 128);
        for i in 0..5 {
            tail.push(format!("line {}", i)).await;
        }

        assert_eq!(tail.len().await, 3);
        assert_eq!(tail.lines().await, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_truncates_long_lines() {
        let tail = DiagnosticTail::new(4, 5);
        tail.push("abcdefgh").await;
        // 'é' is two bytes; a cut at byte 5 would split it
        tail.push("abcdé").await;

        let lines = tail.lines().await;
        assert_eq!(lines[0], "abcde");
        assert_eq!(lines[1], "abcd");
    }

    #[tokio::test]
    async fn test_clones_share_buffer() {
        let tail = DiagnosticTail::new(2, 64);
        let writer = tail.clone();
        writer.push("hello").await;

        assert!(!tail.is_empty().await);
        assert_eq!(tail.capacity(), 2);
    }
}
