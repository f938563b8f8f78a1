#[cfg(test)]
mod tests {
    use gofw::error::GofwError;
    use gofw::logger::{EventBus, LogBuffer, LogEvent, LogLevel, Logger};
    use proptest::prelude::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn test_latest_index_starts_at_zero() {
        let buffer = LogBuffer::new(4);
        assert_eq!(buffer.latest_index(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_beyond_latest_is_out_of_range() {
        let buffer = LogBuffer::new(4);
        buffer.append("one", 10);
        assert!(matches!(
            buffer.read_at(2),
            Err(GofwError::OutOfRange { index: 2, latest: 1 })
        ));
    }

    #[test]
    fn test_eviction_keeps_indices() {
        let buffer = LogBuffer::new(2);
        buffer.append("a", 1);
        buffer.append("b", 2);
        buffer.append("c", 3);

        assert_eq!(buffer.latest_index(), 3);
        assert_eq!(buffer.len(), 2);
        assert!(matches!(buffer.read_at(1), Err(GofwError::NotFound(1))));
        assert_eq!(buffer.read_at(2).unwrap(), "b");
        assert_eq!(buffer.read_at(3).unwrap(), "c");
    }

    #[test]
    fn test_delete_since_is_idempotent() {
        let buffer = LogBuffer::new(8);
        for i in 0..5 {
            buffer.append(format!("m{}", i + 1), i);
        }
        buffer.delete_since(3);
        buffer.delete_since(3);
        buffer.delete_since(1);

        assert_eq!(buffer.latest_index(), 5);
        assert!(matches!(buffer.read_at(2), Err(GofwError::NotFound(2))));
        assert_eq!(buffer.read_at(3).unwrap(), "m3");
    }

    #[test]
    fn test_get_carries_timestamp_and_level() {
        let buffer = LogBuffer::new(4);
        let index = buffer.append_with_level(LogLevel::Warn, "careful", 42);
        let record = buffer.get(index).unwrap();
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.level, LogLevel::Warn);
    }

    #[test]
    fn test_logger_feeds_buffer_and_bus() {
        let buffer = Arc::new(LogBuffer::new(8));
        let bus = Arc::new(EventBus::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        bus.subscribe(Arc::new(move |event: &LogEvent| {
            sink_seen.lock().push(event.message.clone());
        }));

        let logger = Logger::new(Some(LogLevel::Debug), buffer.clone(), bus.clone());
        logger.trace("hidden");
        logger.debug("shown");
        logger.error("bad");

        assert_eq!(buffer.latest_index(), 2);
        assert_eq!(*seen.lock(), vec!["shown".to_string(), "bad".to_string()]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let sink_count = count.clone();
        let id = bus.subscribe(Arc::new(move |_: &LogEvent| {
            *sink_count.lock() += 1;
        }));
        let event = LogEvent {
            timestamp: 1,
            level: LogLevel::Info,
            message: "x".to_string(),
        };

        bus.publish(&event);
        assert!(bus.unsubscribe(id));
        bus.publish(&event);
        assert_eq!(*count.lock(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_concurrent_appends_get_distinct_indices() {
        let buffer = Arc::new(LogBuffer::new(10_000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        buffer.append(format!("{}-{}", t, i), 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(buffer.latest_index(), 1000);
        let indices: Vec<u64> = buffer.snapshot().iter().map(|r| r.index).collect();
        assert_eq!(indices, (1..=1000).collect::<Vec<u64>>());
    }

    proptest! {
        #[test]
        fn prop_latest_index_counts_appends(messages in prop::collection::vec(".{0,16}", 0..64), capacity in 1usize..32) {
            let buffer = LogBuffer::new(capacity);
            for (i, m) in messages.iter().enumerate() {
                prop_assert_eq!(buffer.append(m.clone(), i as u64), i as u64 + 1);
            }
            prop_assert_eq!(buffer.latest_index(), messages.len() as u64);

            let oldest_kept = messages.len().saturating_sub(capacity) + 1;
            for (i, m) in messages.iter().enumerate() {
                let index = i as u64 + 1;
                if (index as usize) >= oldest_kept {
                    prop_assert_eq!(buffer.read_at(index).unwrap(), m.clone());
                } else {
                    prop_assert!(matches!(buffer.read_at(index), Err(GofwError::NotFound(_))));
                }
            }
        }

        #[test]
        fn prop_delete_since_splits_the_range(count in 1u64..64, cut in 0u64..80) {
            let buffer = LogBuffer::new(128);
            for i in 1..=count {
                buffer.append(format!("m{}", i), i);
            }
            buffer.delete_since(cut);

            prop_assert_eq!(buffer.latest_index(), count);
            for i in 1..=count {
                if i < cut {
                    prop_assert!(matches!(buffer.read_at(i), Err(GofwError::NotFound(_))));
                } else {
                    prop_assert_eq!(buffer.read_at(i).unwrap(), format!("m{}", i));
                }
            }
        }
    }
}
