use http::{HeaderMap, HeaderName, Request};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use tracing::{field::Empty, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Injects the current [`opentelemetry::Context`] into a [`Request`]
/// headers to allow propagation downstream.
pub fn inject_opentelemetry_context_into_request<T>(request: &mut Request<T>) -> &mut Request<T> {
    let context = Span::current().context();

    global::get_text_map_propagator(|injector| {
        injector.inject_context(&context, &mut HeaderInjector(request.headers_mut()))
    });

    request
}

/// Constructs a [`opentelemetry::Context`] from [`Request`] headers
/// and assigns parent to the returned server [`Span`].
///
/// The span is named `HTTP {method} {path}` through the `otel.name` field.
/// `http.response.status_code` and `otel.status_code` are left empty and
/// get recorded once the response is known.
#[track_caller]
pub fn extract_opentelemetry_context_from_request<T>(request: &Request<T>) -> Span {
    let context = extract_context(&HeaderExtractor(request.headers()));

    let method = request.method().as_str();
    let path = request.uri().path();

    let span = tracing::info_span!(
        "HTTP request",
        otel.name = %format!("HTTP {method} {path}"),
        otel.kind = "server",
        otel.status_code = Empty,
        http.request.method = method,
        http.response.status_code = Empty,
        url.path = path,
        url.query = request.uri().query(),
    );
    span.set_parent(context);

    span
}

fn extract_context(extractor: &dyn Extractor) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(extractor))
}

// "traceparent" => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format

/// Injector used via opentelemetry propagator to tell the extractor how to
/// insert the "traceparent" header value. This will allow the propagator to
/// inject opentelemetry context into a standard data structure. Will basically
/// insert a "traceparent" string value
/// "{version}-{trace_id}-{span_id}-{trace_flags}" of the spans context into the
/// headers. Listeners can then re-hydrate the context to add additional spans
/// to the same trace.
struct HeaderInjector<'a>(&'a mut HeaderMap);

impl<'a> Injector for HeaderInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = key.parse::<HeaderName>() else {
            tracing::debug!(%key, "failed to parse header name");
            return;
        };
        let Ok(value) = value.parse() else {
            tracing::debug!(%value, "failed to parse header value");
            return;
        };
        self.0.insert(key, value);
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|h| h.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(feature = "rpc")]
pub use metadata::*;

#[cfg(feature = "rpc")]
mod metadata {
    use opentelemetry::{
        global,
        propagation::{Extractor, Injector},
        Context,
    };
    use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};

    /// Writes `context` into outgoing RPC metadata. Keys which are not valid
    /// ASCII metadata keys are skipped.
    pub fn inject_context_into_metadata(context: &Context, metadata: &mut MetadataMap) {
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(context, &mut MetadataInjector(metadata))
        });
    }

    /// Reads the remote parent context out of incoming RPC metadata.
    pub fn extract_context_from_metadata(metadata: &MetadataMap) -> Context {
        global::get_text_map_propagator(|propagator| {
            propagator.extract(&MetadataExtractor(metadata))
        })
    }

    struct MetadataInjector<'a>(&'a mut MetadataMap);

    impl<'a> Injector for MetadataInjector<'a> {
        fn set(&mut self, key: &str, value: String) {
            let Ok(key) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
                tracing::debug!(%key, "failed to parse metadata key");
                return;
            };
            let Ok(value) = MetadataValue::try_from(value.as_str()) else {
                tracing::debug!(%value, "failed to parse metadata value");
                return;
            };
            self.0.insert(key, value);
        }
    }

    struct MetadataExtractor<'a>(&'a MetadataMap);

    impl<'a> Extractor for MetadataExtractor<'a> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).and_then(|v| v.to_str().ok())
        }

        fn keys(&self) -> Vec<&str> {
            self.0
                .iter()
                .map(|entry| match entry {
                    KeyAndValueRef::Ascii(key, _) => key.as_str(),
                    KeyAndValueRef::Binary(key, _) => key.as_str(),
                })
                .collect()
        }
    }
}
