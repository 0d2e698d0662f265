//! Log subscriber setup and the spans that tie log lines to an HTTP request
//! or a gateway connection.

use std::{fmt, time::Duration};

use axum::{
    body::HttpBody,
    extract::MatchedPath,
    http::{Request, Response},
};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    request_id::RequestId,
    trace::{DefaultOnRequest, MakeSpan, OnResponse, TraceLayer},
};
use tracing::{
    field::{Field, Visit},
    span::{Attributes, Id},
    Event, Span, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::{Format, Writer},
        writer::MakeWriter,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::{config::LogFormat, lifecycle::Connection};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const DEFAULT_FILTER: &str = "info,homeward_server=info";

/// Install the global subscriber. A second call keeps the first subscriber.
pub fn init(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if let Err(err) = tracing::subscriber::set_global_default(subscriber(format, filter)) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

pub fn subscriber(format: LogFormat, filter: EnvFilter) -> Box<dyn Subscriber + Send + Sync> {
    subscriber_with_writer(format, filter, std::io::stderr)
}

pub fn subscriber_with_writer<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let output = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .event_format(ContextPrefix(Format::default().with_target(true).json()))
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .event_format(ContextPrefix(Format::default().with_target(true).compact()))
            .with_writer(writer)
            .boxed(),
    };

    Box::new(
        tracing_subscriber::registry()
            .with(filter)
            .with(SpanContextLayer)
            .with(output),
    )
}

/// Span wrapping one gateway socket; every log line inside it is prefixed
/// with the connection id.
pub fn connection_span(connection: &Connection) -> Span {
    tracing::info_span!(
        "gateway.connection",
        connection_id = %connection.id,
        role = %connection.role,
        user_id = %connection.user_id(),
        identity = connection.identity.kind(),
    )
}

pub type HttpTraceLayer =
    TraceLayer<SharedClassifier<ServerErrorsAsFailures>, HttpSpans, DefaultOnRequest, HttpSpans>;

pub fn http_trace_layer() -> HttpTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(HttpSpans)
        .on_response(HttpSpans)
}

/// Opens the `http.request` span and records status and latency on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSpans;

impl HttpSpans {
    fn request_id<B>(request: &Request<B>) -> String {
        request
            .extensions()
            .get::<RequestId>()
            .map(RequestId::header_value)
            .or_else(|| request.headers().get(REQUEST_ID_HEADER))
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string()
    }
}

impl<B> MakeSpan<B> for HttpSpans {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| request.uri().path(), MatchedPath::as_str);
        tracing::info_span!(
            "http.request",
            method = %request.method(),
            route = %route,
            request_id = %Self::request_id(request),
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}

impl<B> OnResponse<B> for HttpSpans
where
    B: HttpBody,
{
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        span.record("status", response.status().as_u16());
        span.record("latency_ms", latency_ms);
        tracing::debug!(parent: span, status = response.status().as_u16(), latency_ms, "request completed");
    }
}

/// Correlation ids captured from span fields when a span opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LogContext {
    request_id: Option<String>,
    connection_id: Option<String>,
}

impl LogContext {
    fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.connection_id.is_none()
    }

    fn set(&mut self, field: &str, value: String) {
        match field {
            "request_id" => self.request_id = Some(value),
            "connection_id" => self.connection_id = Some(value),
            _ => {}
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(request_id) = &self.request_id {
            write!(f, "[request_id={request_id}] ")?;
        }
        if let Some(connection_id) = &self.connection_id {
            write!(f, "[connection_id={connection_id}] ")?;
        }
        Ok(())
    }
}

impl Visit for LogContext {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.set(field.name(), format!("{value:?}").trim_matches('"').to_string());
    }
}

struct SpanContextLayer;

impl<S> Layer<S> for SpanContextLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut context = LogContext::default();
        attrs.record(&mut context);
        if context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(context);
        }
    }
}

/// Writes the nearest enclosing [`LogContext`] in front of each event.
struct ContextPrefix<E>(E);

impl<S, N, E> FormatEvent<S, N> for ContextPrefix<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if let Some(scope) = ctx.event_scope() {
            for span in scope {
                if let Some(context) = span.extensions().get::<LogContext>() {
                    write!(writer, "{context}")?;
                    break;
                }
            }
        }
        self.0.format_event(ctx, writer, event)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::ResolvedIdentity;
    use axum::body::Body;
    use homeward_core::{Identity, Role, VerifiedSource};
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };
    use uuid::Uuid;

    /// In-memory log sink shared with the tests in `http`.
    #[derive(Clone, Default)]
    pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn client_request_id_header_labels_http_logs() {
        let logs = LogBuffer::default();
        let subscriber =
            subscriber_with_writer(LogFormat::Compact, EnvFilter::new("info"), logs.clone());
        tracing::subscriber::with_default(subscriber, || {
            let request = Request::builder()
                .uri("/ready")
                .header(REQUEST_ID_HEADER, "from-client")
                .body(Body::empty())
                .unwrap();
            let span = HttpSpans.make_span(&request);
            let _entered = span.enter();
            tracing::info!("checking readiness");
        });

        assert!(logs.contents().contains("[request_id=from-client] "));
    }

    #[test]
    fn gateway_logs_carry_the_connection_id_through_child_spans() {
        let connection = Connection::authenticate(
            Uuid::new_v4(),
            ResolvedIdentity {
                identity: Identity::verified(Uuid::new_v4().to_string(), VerifiedSource::SessionToken),
                role: Role::Agent,
            },
            None,
        );
        let logs = LogBuffer::default();
        let subscriber =
            subscriber_with_writer(LogFormat::Json, EnvFilter::new("info"), logs.clone());
        tracing::subscriber::with_default(subscriber, || {
            let _connection = connection_span(&connection).entered();
            let _handler = tracing::info_span!("join").entered();
            tracing::info!("joined property room");
        });

        let output = logs.contents();
        assert!(output.starts_with(&format!("[connection_id={}] ", connection.id)));
        assert!(output.contains("\"role\":\"agent\""));
        assert!(output.contains("\"message\":\"joined property room\""));
    }

    #[test]
    fn logs_outside_any_span_are_unprefixed() {
        let logs = LogBuffer::default();
        let subscriber =
            subscriber_with_writer(LogFormat::Compact, EnvFilter::new("info"), logs.clone());
        tracing::subscriber::with_default(subscriber, || tracing::info!("sweeping rooms"));

        let output = logs.contents();
        assert!(output.contains("sweeping rooms"));
        assert!(!output.contains("[request_id="));
        assert!(!output.contains("[connection_id="));
    }
}
