//! `extern "C"` entry points. Strings arrive as NUL-terminated pointers and
//! leave through caller-supplied buffers of [`CHAR_BUF_SIZE`] bytes.

use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::{StartParams, CHAR_BUF_SIZE, SVR_ERROR_CODE, SVR_ERROR_PANIC};
use crate::logger::{LogEvent, LogLevel, LogSink};

/// `void (*)(unsigned long long ts, const char* msg)`
pub type LogCallback = Option<unsafe extern "C" fn(u64, *const c_char)>;

/// Forwards events to the embedder: errors to `err_cb`, everything else to
/// `log_cb`.
pub struct CallbackSink {
    log_cb: LogCallback,
    err_cb: LogCallback,
}

impl CallbackSink {
    pub fn new(log_cb: LogCallback, err_cb: LogCallback) -> Self {
        Self { log_cb, err_cb }
    }
}

impl LogSink for CallbackSink {
    fn on_event(&self, event: &LogEvent) {
        let callback = if event.level == LogLevel::Error { self.err_cb } else { self.log_cb };
        let Some(callback) = callback else {
            return;
        };
        let message = CString::new(event.message.replace('\0', " ")).unwrap_or_default();
        // SAFETY: the embedder promised a thread-safe callback that only reads
        // the message for the duration of the call.
        unsafe { callback(event.timestamp, message.as_ptr()) };
    }
}

unsafe fn string_arg(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

unsafe fn out_buf<'a>(ptr: *mut c_char) -> Option<&'a mut [u8]> {
    if ptr.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts_mut(ptr as *mut u8, CHAR_BUF_SIZE))
}

/// # Safety
/// String arguments must be null or valid NUL-terminated strings. Callbacks
/// may be invoked from any worker thread until the next start replaces them.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn gofw_start(
    log_level: *const c_char,
    route_list: *const c_char,
    log_callback: LogCallback,
    err_callback: LogCallback,
    upstream: *const c_char,
    local_addr: *const c_char,
    auth: *const c_char,
    key: *const c_char,
    partial: c_int,
    buffer_size: c_int,
    control_port: c_int,
    data_port: c_int,
) -> c_int {
    let params = StartParams {
        log_level: string_arg(log_level),
        route_list: string_arg(route_list),
        upstream: string_arg(upstream),
        local_addr: string_arg(local_addr),
        auth: string_arg(auth),
        key: string_arg(key),
        partial: partial == 1,
        buffer_size,
        control_port,
        data_port,
    };
    let sink: Option<Arc<dyn LogSink>> = if log_callback.is_some() || err_callback.is_some() {
        Some(Arc::new(CallbackSink::new(log_callback, err_callback)))
    } else {
        None
    };

    catch_unwind(AssertUnwindSafe(|| super::start(params, sink))).unwrap_or(SVR_ERROR_CODE | SVR_ERROR_PANIC)
}

#[no_mangle]
pub extern "C" fn gofw_stop() {
    let _ = catch_unwind(super::stop);
}

/// # Safety
/// `buf` must be null or point to at least `CHAR_BUF_SIZE` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn gofw_nickname(buf: *mut c_char) {
    if let Some(dst) = out_buf(buf) {
        super::copy_to_buf(dst, &super::nickname());
    }
}

#[no_mangle]
pub extern "C" fn gofw_switch(code: c_int) -> c_int {
    super::switch(code)
}

#[no_mangle]
pub extern "C" fn gofw_mitm(enabled: c_int) {
    super::set_mitm(enabled != 0);
}

#[no_mangle]
pub extern "C" fn gofw_log_len() -> u64 {
    super::log_len()
}

/// Copies record `index` into `buf` and returns its timestamp; 0 (and an empty
/// string) when the record is missing.
///
/// # Safety
/// `buf` must be null or point to at least `CHAR_BUF_SIZE` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn gofw_log_read(index: u64, buf: *mut c_char) -> u64 {
    let record = super::log_read(index);
    if let Some(dst) = out_buf(buf) {
        let message = record.as_ref().map_or("", |r| r.message.as_str());
        super::copy_to_buf(dst, message);
    }
    record.map_or(0, |r| r.timestamp)
}

#[no_mangle]
pub extern "C" fn gofw_log_delete_since(index: u64) {
    super::log_delete_since(index);
}
