use parking_lot::RwLock;
use std::collections::VecDeque;

use super::LogLevel;
use crate::error::{GofwError, Result};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub index: u64,
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
}

struct Ring {
    records: VecDeque<LogRecord>,
    latest: u64,
}

/// Capacity-bounded ring of log records.
///
/// Indices start at 1 and are never reused. Records leave the ring either by
/// eviction when the capacity is exceeded or through [`LogBuffer::delete_since`].
pub struct LogBuffer {
    ring: RwLock<Ring>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Self {
            ring: RwLock::new(Ring {
                records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                latest: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, message: impl Into<String>, timestamp: u64) -> u64 {
        self.append_with_level(LogLevel::Info, message, timestamp)
    }

    pub fn append_with_level(&self, level: LogLevel, message: impl Into<String>, timestamp: u64) -> u64 {
        let mut ring = self.ring.write();
        ring.latest += 1;
        let index = ring.latest;
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(LogRecord {
            index,
            timestamp,
            level,
            message: message.into(),
        });
        index
    }

    /// Highest index ever assigned, 0 when nothing was appended.
    pub fn latest_index(&self) -> u64 {
        self.ring.read().latest
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.ring.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, index: u64) -> Result<String> {
        self.get(index).map(|record| record.message)
    }

    pub fn get(&self, index: u64) -> Result<LogRecord> {
        let ring = self.ring.read();
        if index > ring.latest {
            return Err(GofwError::OutOfRange { index, latest: ring.latest });
        }
        let oldest = match ring.records.front() {
            Some(record) => record.index,
            None => return Err(GofwError::NotFound(index)),
        };
        if index < oldest {
            return Err(GofwError::NotFound(index));
        }
        // Records are contiguous from `oldest` to `latest`.
        ring.records
            .get((index - oldest) as usize)
            .cloned()
            .ok_or(GofwError::NotFound(index))
    }

    /// Drops every record whose index is below `index`.
    pub fn delete_since(&self, index: u64) {
        let mut ring = self.ring.write();
        while let Some(front) = ring.records.front() {
            if front.index < index {
                ring.records.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.ring.read().records.iter().cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_index_is_one() {
        let buffer = LogBuffer::new(4);
        assert_eq!(buffer.latest_index(), 0);
        assert_eq!(buffer.append("a", 1), 1);
        assert_eq!(buffer.latest_index(), 1);
    }

    #[test]
    fn test_index_zero_is_never_assigned() {
        let buffer = LogBuffer::new(4);
        buffer.append("a", 1);
        assert!(matches!(buffer.read_at(0), Err(GofwError::NotFound(0))));
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let buffer = LogBuffer::new(0);
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
    }
}
