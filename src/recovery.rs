//! Fault boundary.
//!
//! Turns a panic escaping a handler future into a [`Recovered`] value before
//! it reaches the decorator layer.

use std::{
    any::Any,
    backtrace::Backtrace,
    future::Future,
    panic::{self, AssertUnwindSafe},
};

use futures_util::{future::CatchUnwind, FutureExt};

/// Diagnostic information about a panic caught while handling a request.
#[derive(Debug)]
pub struct Recovered {
    message: String,
    backtrace: Option<Backtrace>,
}

impl Recovered {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>, capture_backtrace: bool) -> Self {
        Self {
            message: panic_message(payload.as_ref()),
            backtrace: capture_backtrace.then(Backtrace::force_capture),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }

    /// Text attached to the `error` log field.
    pub fn diagnostic(&self) -> String {
        format!("recovery info: {}", self.message)
    }
}

/// Extracts the message out of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Wraps a handler future so a panic is returned as an `Err` payload.
pub(crate) fn catch_panic<F: Future>(future: F) -> CatchUnwind<AssertUnwindSafe<F>> {
    AssertUnwindSafe(future).catch_unwind()
}

/// Runs `f`, swallowing a panic. Returns whether `f` completed.
pub(crate) fn guarded(f: impl FnOnce()) -> bool {
    panic::catch_unwind(AssertUnwindSafe(f)).is_ok()
}
