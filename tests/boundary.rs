#[cfg(test)]
mod tests {
    use gofw::boundary::ffi::{gofw_log_len, gofw_log_read, gofw_nickname, gofw_start, gofw_stop, gofw_switch};
    use gofw::boundary::{self, StartParams, CHAR_BUF_SIZE};
    use gofw::boundary::{SVR_ALREADY_STARTED, SVR_ERROR_BIND, SVR_ERROR_CODE, SVR_ERROR_CREATE, SVR_STARTED};
    use gofw::boundary::{SVR_GLOBAL, SVR_IPLIST, SVR_NONE};
    use gofw::logger::{LogEvent, LogSink};
    use gofw::mode::RoutePolicy;
    use std::ffi::{c_char, CStr, CString};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn params() -> StartParams {
        StartParams {
            log_level: "info".to_string(),
            upstream: "127.0.0.1:9".to_string(),
            local_addr: "127.0.0.1".to_string(),
            key: "boundary-key".to_string(),
            ..StartParams::default()
        }
    }

    #[test]
    fn test_policy_codes_match_route_policies() {
        assert_eq!(SVR_GLOBAL, RoutePolicy::Global.code());
        assert_eq!(SVR_IPLIST, RoutePolicy::IpList.code());
        assert_eq!(SVR_NONE, RoutePolicy::None.code());
    }

    fn counting_sink() -> (Arc<dyn LogSink>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sink: Arc<dyn LogSink> = Arc::new(move |_: &LogEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sink, count)
    }

    static FFI_LOGS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_log(_ts: u64, msg: *const c_char) {
        assert!(!CStr::from_ptr(msg).to_bytes().is_empty());
        FFI_LOGS.fetch_add(1, Ordering::SeqCst);
    }

    // The facade drives one process-wide server, so the whole lifecycle runs
    // in a single test.
    #[test]
    fn test_process_lifecycle() {
        assert_eq!(boundary::log_len(), u64::MAX);
        assert_eq!(boundary::nickname(), "");
        assert!(boundary::log_read(1).is_none());
        assert_eq!(boundary::switch(12345), -1);

        let bad_level = StartParams {
            log_level: "loud".to_string(),
            ..params()
        };
        assert_eq!(boundary::start(bad_level, None), SVR_ERROR_CODE | SVR_ERROR_CREATE);

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let in_use = StartParams {
            control_port: i32::from(taken.local_addr().unwrap().port()),
            ..params()
        };
        assert_eq!(boundary::start(in_use, None), SVR_ERROR_CODE | SVR_ERROR_BIND);
        drop(taken);

        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        let sink: Arc<dyn LogSink> = Arc::new(move |_: &LogEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(boundary::start(params(), Some(sink)), SVR_STARTED);
        assert_eq!(boundary::start(params(), None), SVR_ALREADY_STARTED);
        assert!(events.load(Ordering::SeqCst) > 0);

        // A refused start keeps the running server's sink.
        let (late_sink, late) = counting_sink();
        assert_eq!(boundary::start(params(), Some(late_sink)), SVR_ALREADY_STARTED);
        let before = events.load(Ordering::SeqCst);

        assert!(boundary::nickname().ends_with("@127.0.0.1:9"));
        assert_eq!(boundary::switch(SVR_GLOBAL), SVR_IPLIST);
        assert!(events.load(Ordering::SeqCst) > before);
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(boundary::switch(1), 2);
        assert_eq!(boundary::supervisor().mode_snapshot().policy, RoutePolicy::Global);
        assert!(!boundary::set_mitm(true));

        let latest = boundary::log_len();
        assert!(latest >= 1);
        assert!(boundary::log_read(1).unwrap().message.contains("started"));
        assert!(boundary::log_read(latest + 1).is_none());
        boundary::log_delete_since(latest);
        assert!(boundary::log_read(1).is_none());
        assert!(boundary::log_read(latest).is_some());

        assert!(boundary::stop());
        assert!(!boundary::stop());
        assert_eq!(boundary::nickname(), "");
        assert!(boundary::log_len() >= latest);

        // Racing starts: only the winner's sink stays subscribed.
        let racers: Vec<_> = (0..4)
            .map(|_| {
                let (sink, count) = counting_sink();
                let handle = std::thread::spawn(move || boundary::start(params(), Some(sink)));
                (handle, count)
            })
            .collect();
        let results: Vec<_> = racers
            .into_iter()
            .map(|(handle, count)| (handle.join().unwrap(), count))
            .collect();
        assert_eq!(results.iter().filter(|(code, _)| *code == SVR_STARTED).count(), 1);
        let baseline: Vec<usize> = results.iter().map(|(_, count)| count.load(Ordering::SeqCst)).collect();
        assert!(!boundary::set_mitm(false));
        for ((code, count), before) in results.iter().zip(baseline) {
            if *code == SVR_STARTED {
                assert!(count.load(Ordering::SeqCst) > before);
            } else {
                assert_eq!(*code, SVR_ALREADY_STARTED);
                assert_eq!(count.load(Ordering::SeqCst), before);
            }
        }
        assert!(boundary::stop());

        // Same lifecycle through the C entry points.
        let level = CString::new("debug").unwrap();
        let routes = CString::new("example.cn\n[proxy_list]\nads.example.cn\n").unwrap();
        let upstream = CString::new("127.0.0.1:9").unwrap();
        let local = CString::new("127.0.0.1").unwrap();
        let empty = CString::new("").unwrap();
        let code = unsafe {
            gofw_start(
                level.as_ptr(),
                routes.as_ptr(),
                Some(count_log),
                None,
                upstream.as_ptr(),
                local.as_ptr(),
                empty.as_ptr(),
                std::ptr::null(),
                0,
                64,
                0,
                0,
            )
        };
        assert_eq!(code, SVR_STARTED);
        assert!(FFI_LOGS.load(Ordering::SeqCst) > 0);

        let mut buf = vec![0 as c_char; CHAR_BUF_SIZE];
        unsafe { gofw_nickname(buf.as_mut_ptr()) };
        let nickname = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap().to_string();
        assert!(nickname.ends_with("@127.0.0.1:9"), "{}", nickname);

        assert_eq!(gofw_switch(SVR_NONE), SVR_IPLIST);

        let len = gofw_log_len();
        let timestamp = unsafe { gofw_log_read(1, buf.as_mut_ptr()) };
        assert!(len >= 1);
        assert!(timestamp > 0);
        let first = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap().to_string();
        assert!(!first.is_empty());

        gofw_stop();
        assert!(!boundary::supervisor().is_running());
    }
}
