//! Terminal access log record.
//!
//! An [`Envelope`] is opened when a request enters the recovery layer and
//! collects everything the record needs while the request is handled. The
//! record is written when the envelope is dropped, which happens exactly
//! once on every exit path: normal return, handler error, recovered panic or
//! cancellation of the request future.

use std::time::{Duration, Instant};

use tracing::Level;

use crate::{
    context::Logger,
    recovery::{self, Recovered},
};

const ACCESS_TARGET: &str = "trace_middleware::access";

/// Request metadata copied into the record.
#[derive(Debug, Default)]
pub(crate) struct RequestMeta {
    /// Prefix of the log message, `HTTP` or `RPC`.
    pub(crate) protocol: &'static str,
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) user_agent: String,
    pub(crate) req_header: String,
    pub(crate) ip: String,
}

#[derive(Debug)]
enum Outcome {
    Completed,
    Recovered(Recovered),
    Cancelled,
}

pub(crate) struct Envelope {
    logger: Logger,
    start: Instant,
    meta: RequestMeta,
    status_code: String,
    request: Option<Vec<u8>>,
    response: Option<Vec<u8>>,
    capture_limit: Option<usize>,
    error: Option<String>,
    outcome: Option<Outcome>,
}

impl Envelope {
    pub(crate) fn open(logger: Logger, meta: RequestMeta, capture_limit: Option<usize>) -> Self {
        Self {
            logger,
            start: Instant::now(),
            meta,
            status_code: "OK".to_owned(),
            request: None,
            response: None,
            capture_limit,
            error: None,
            outcome: None,
        }
    }

    pub(crate) fn set_status(&mut self, status_code: impl Into<String>) {
        self.status_code = status_code.into();
    }

    pub(crate) fn capture_request(&mut self, bytes: &[u8]) {
        let mut buffer = Vec::new();
        append_bounded(&mut buffer, bytes, self.capture_limit);
        self.request = Some(buffer);
    }

    /// Starts response capture. Further chunks are added with
    /// [`Envelope::append_response`].
    pub(crate) fn capture_response(&mut self, bytes: &[u8]) {
        self.response = Some(Vec::new());
        self.append_response(bytes);
    }

    pub(crate) fn append_response(&mut self, chunk: &[u8]) {
        if let Some(buffer) = self.response.as_mut() {
            append_bounded(buffer, chunk, self.capture_limit);
        }
    }

    /// Attaches an error. Errors are accumulated so a later failure never
    /// hides an earlier one.
    pub(crate) fn fail(&mut self, error: impl ToString) {
        let error = error.to_string();
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{previous}; {error}"),
            None => error,
        });
    }

    pub(crate) fn complete(&mut self) {
        self.outcome.get_or_insert(Outcome::Completed);
    }

    pub(crate) fn recover(&mut self, recovered: Recovered) {
        self.outcome = Some(Outcome::Recovered(recovered));
    }

    /// Marks a request whose response was produced but not fully delivered.
    pub(crate) fn interrupt(&mut self) {
        self.outcome = Some(Outcome::Cancelled);
    }

    fn level(&self) -> Level {
        match self.outcome {
            Some(Outcome::Completed) if self.error.is_none() => Level::DEBUG,
            _ => Level::ERROR,
        }
    }

    fn emit(&self, duration: Duration) {
        let request = self.request.as_deref().map(String::from_utf8_lossy);
        let response = self.response.as_deref().map(String::from_utf8_lossy);

        let mut error = self.error.clone();
        let mut stack = None;
        match &self.outcome {
            Some(Outcome::Recovered(recovered)) => {
                error = Some(match error {
                    Some(previous) => format!("{previous}; {}", recovered.diagnostic()),
                    None => recovered.diagnostic(),
                });
                stack = recovered.backtrace().map(ToString::to_string);
            }
            Some(Outcome::Cancelled) => {
                error.get_or_insert_with(|| "request cancelled before completion".to_owned());
            }
            _ => {}
        }

        let meta = &self.meta;
        let message = format!("{} {} {}", meta.protocol, meta.method, meta.path);

        macro_rules! access_event {
            ($level:expr) => {
                tracing::event!(
                    target: ACCESS_TARGET,
                    $level,
                    duration = ?duration,
                    method = %meta.method,
                    "user-agent" = %meta.user_agent,
                    req_header = %meta.req_header,
                    ip = %meta.ip,
                    path = %meta.path,
                    status_code = %self.status_code,
                    request = request.as_deref(),
                    response = response.as_deref(),
                    error = error.as_deref(),
                    stack = stack.as_deref(),
                    trace_id = self.logger.trace_id(),
                    "{message}"
                )
            };
        }

        if self.level() == Level::DEBUG {
            access_event!(Level::DEBUG);
        } else {
            access_event!(Level::ERROR);
        }
    }

    fn emit_minimal(&self) {
        tracing::error!(
            target: ACCESS_TARGET,
            method = %self.meta.method,
            path = %self.meta.path,
            status_code = %self.status_code,
            "failed to assemble access log record"
        );
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            if std::thread::panicking() {
                self.fail("request aborted by panic");
            }
            self.outcome = Some(Outcome::Cancelled);
        }

        let duration = self.start.elapsed();
        let logger = self.logger.clone();

        logger.in_scope(|| {
            if !recovery::guarded(|| self.emit(duration)) {
                self.emit_minimal();
            }
        });
    }
}

fn append_bounded(buffer: &mut Vec<u8>, chunk: &[u8], limit: Option<usize>) {
    let take = match limit {
        Some(limit) => limit.saturating_sub(buffer.len()).min(chunk.len()),
        None => chunk.len(),
    };
    buffer.extend_from_slice(&chunk[..take]);
}
