//! Status and body capture for HTTP responses.
//!
//! The handler's [`Response`] is passed through untouched apart from its body,
//! which may be swapped for a [`CaptureBody`]. That body hands every frame to
//! the caller exactly as produced and keeps a copy of the data frames for the
//! access log.

use std::{
    fmt::Display,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{ready, Context, Poll},
};

use axum::body::Body;
use bytes::Bytes;
use http::{Response, StatusCode};
use http_body::{Frame, SizeHint};
use pin_project::{pin_project, pinned_drop};

use crate::{record::Envelope, recovery};

/// Formats a status the way it appears in the `status_code` log field.
pub fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map_or_else(|| status.as_str().to_owned(), ToOwned::to_owned)
}

/// Records the final status of `response` into `envelope` and closes it.
///
/// With `capture_body` the envelope travels inside the response body and
/// the record is written once the body has been fully delivered.
pub(crate) fn record_response(
    mut envelope: Envelope,
    response: Response<Body>,
    capture_body: bool,
) -> Response<Body> {
    envelope.set_status(status_text(response.status()));
    envelope.complete();

    if !capture_body {
        return response;
    }

    envelope.capture_response(&[]);
    // Hyper may never poll a body that is already at its end.
    if http_body::Body::is_end_stream(response.body()) {
        return response;
    }

    response.map(|body| Body::new(CaptureBody::new(body, envelope)))
}

/// Response body which copies data frames into an [`Envelope`].
///
/// Frames, trailers and errors are forwarded unchanged and in order. The
/// envelope is closed on end of stream, on a body error, on a panic while
/// polling the inner body, or when the body is dropped early, whichever comes
/// first. A panic is recorded and then resumed.
#[pin_project(PinnedDrop)]
pub struct CaptureBody<B> {
    #[pin]
    inner: B,
    envelope: Option<Envelope>,
}

impl<B> CaptureBody<B> {
    pub(crate) fn new(inner: B, envelope: Envelope) -> Self {
        Self {
            inner,
            envelope: Some(envelope),
        }
    }
}

impl<B> http_body::Body for CaptureBody<B>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let inner = this.inner;
        let polled = match panic::catch_unwind(AssertUnwindSafe(|| inner.poll_frame(cx))) {
            Ok(polled) => polled,
            Err(payload) => {
                if let Some(mut envelope) = this.envelope.take() {
                    envelope.fail(format!(
                        "response body panicked: {}",
                        recovery::panic_message(payload.as_ref())
                    ));
                }
                panic::resume_unwind(payload)
            }
        };
        let frame = ready!(polled);

        match &frame {
            Some(Ok(frame)) => {
                if let (Some(data), Some(envelope)) = (frame.data_ref(), this.envelope.as_mut()) {
                    envelope.append_response(data);
                }
            }
            Some(Err(error)) => {
                if let Some(mut envelope) = this.envelope.take() {
                    envelope.fail(format!("writing response body: {error}"));
                }
            }
            None => {
                this.envelope.take();
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<B> PinnedDrop for CaptureBody<B> {
    fn drop(self: Pin<&mut Self>) {
        if let Some(envelope) = self.project().envelope.as_mut() {
            if std::thread::panicking() {
                envelope.fail("response body aborted by panic");
            } else {
                envelope.interrupt();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StatusCode::OK, "OK")]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")]
    #[case(StatusCode::from_u16(499).unwrap(), "499")]
    fn status_text_uses_reason_phrase(#[case] status: StatusCode, #[case] expected: &str) {
        assert_eq!(status_text(status), expected);
    }
}
