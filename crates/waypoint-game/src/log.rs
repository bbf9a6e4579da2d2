//! Bounded chat/info log.

use std::collections::VecDeque;

/// Ring buffer of text lines with a denormalized display string.
///
/// Appending is O(1) while below capacity. Once full, each append evicts
/// the oldest line and rebuilds the display string.
#[derive(Debug, Clone)]
pub struct MessageLog {
    capacity: usize,
    lines: VecDeque<String>,
    display: String,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
            display: String::new(),
        }
    }

    /// Builds a log from existing lines, keeping the newest `capacity`.
    pub fn from_lines(capacity: usize, lines: impl IntoIterator<Item = String>) -> Self {
        let mut log = Self::new(capacity);
        for line in lines {
            log.push(line);
        }
        log
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.lines.push_back(line);
            self.rebuild();
        } else {
            if !self.display.is_empty() {
                self.display.push('\n');
            }
            self.display.push_str(&line);
            self.lines.push_back(line);
        }
    }

    fn rebuild(&mut self) {
        self.display.clear();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                self.display.push('\n');
            }
            self.display.push_str(line);
        }
    }

    /// All lines, oldest first, newline-separated.
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
