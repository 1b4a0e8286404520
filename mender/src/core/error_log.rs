//! Bounded FIFO log of diagnostic strings attached to each artifact.

use std::collections::VecDeque;

use serde::Serialize;

/// Ring buffer that keeps the most recent `capacity` entries in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorLog {
    capacity: usize,
    entries: VecDeque<String>,
}

impl ErrorLog {
    /// `capacity` is raised to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&mut self, entry: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<&str> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).map(String::as_str).collect()
    }

    pub fn last(&self) -> Option<&str> {
        self.entries.back().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_entries_in_order() {
        let mut log = ErrorLog::new(50);
        for i in 0..60 {
            log.push(format!("entry {i}"));
        }
        assert_eq!(log.len(), 50);
        let entries: Vec<&str> = log.iter().collect();
        assert_eq!(entries.first(), Some(&"entry 10"));
        assert_eq!(entries.last(), Some(&"entry 59"));
        for (offset, entry) in entries.iter().enumerate() {
            assert_eq!(*entry, format!("entry {}", offset + 10));
        }
    }

    #[test]
    fn tail_returns_oldest_first() {
        let mut log = ErrorLog::new(5);
        for entry in ["a", "b", "c"] {
            log.push(entry);
        }
        assert_eq!(log.tail(2), vec!["b", "c"]);
        assert_eq!(log.tail(10), vec!["a", "b", "c"]);
        assert_eq!(log.last(), Some("c"));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut log = ErrorLog::new(0);
        log.push("first");
        log.push("second");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.tail(5), vec!["second"]);
    }
}
