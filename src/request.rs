use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::body::PutBodyFeeder;
use crate::error::Error;
use crate::headers::parse_header_line;
use crate::response::{Response, ResponseFuture};
use crate::retry::{RetrySettings, RetryState, RetryVerdict, aggregate_timeout};
use crate::span::{
    HEADER_REQUEST_ID, HEADER_SPAN_ID, HEADER_TRACE_ID, SYNTHETIC_TRANSPORT_STATUS, SpanFactory,
    TAG_ERROR, TAG_HTTP_STATUS_CODE, TAG_HTTP_URL, TracingSpan,
};
use crate::stats::StatsSink;
use crate::transfer::reactor::{TimerError, TimerGuard, TimerHandle};
use crate::transfer::{
    CompletionHandler, FormPayload, HttpVersion, TransferError, TransferHandle,
};
use crate::util::lock_unpoisoned;

/// Maximum number of redirect hops when location following is enabled.
const MAX_REDIRECT_COUNT: usize = 10;

/// Fluent surface for configuring one request. Every option returns the
/// builder back for chaining; `async_perform` freezes the configuration and
/// submits the first attempt.
///
/// Construction defaults: redirects are followed (with POST replay), TLS
/// verification is on, and a single attempt is made.
pub struct RequestBuilder {
    handle: Box<dyn TransferHandle>,
    stats: Arc<dyn StatsSink>,
    span_factory: Arc<dyn SpanFactory>,
    timer: TimerHandle,
    client_name: Arc<str>,
    timeout: Duration,
    retry: RetrySettings,
    put_feeder: Option<Arc<Mutex<PutBodyFeeder>>>,
}

impl RequestBuilder {
    pub(crate) fn new(
        mut handle: Box<dyn TransferHandle>,
        stats: Arc<dyn StatsSink>,
        span_factory: Arc<dyn SpanFactory>,
        timer: TimerHandle,
        client_name: Arc<str>,
    ) -> Self {
        handle.set_no_signal(true);
        let mut builder = Self {
            handle,
            stats,
            span_factory,
            timer,
            client_name,
            timeout: Duration::ZERO,
            retry: RetrySettings::single(),
            put_feeder: None,
        };
        builder = builder.follow_redirects(true);
        builder.verify(true)
    }

    pub fn url(mut self, url: &str) -> Self {
        self.handle.set_url(url);
        self
    }

    /// Per-attempt timeout applied to both connect and overall transfer.
    /// Zero means the engine default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.handle.set_timeout(timeout);
        self.handle.set_connect_timeout(timeout);
        self
    }

    /// Enables location following up to ten hops; also enables POST replay
    /// across redirects. The two stay coupled by design of the engine
    /// contract.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.handle.set_follow_location(follow);
        self.handle.set_post_redirect_replay(follow);
        if follow {
            self.handle.set_max_redirects(MAX_REDIRECT_COUNT);
        }
        self
    }

    /// Toggles TLS peer and hostname verification together.
    pub fn verify(mut self, verify: bool) -> Self {
        self.handle.set_verify_peer(verify);
        self.handle.set_verify_host(verify);
        self
    }

    /// File holding one or more PEM certificates to verify the peer with.
    pub fn ca_info(mut self, file_path: impl AsRef<Path>) -> Self {
        self.handle.set_ca_bundle(file_path.as_ref());
        self
    }

    /// Directory with trusted certificates.
    pub fn ca_file(mut self, dir_path: impl AsRef<Path>) -> Self {
        self.handle.set_ca_directory(dir_path.as_ref());
        self
    }

    pub fn crl_file(mut self, file_path: impl AsRef<Path>) -> Self {
        self.handle.set_crl_file(file_path.as_ref());
        self
    }

    pub fn http_version(mut self, version: HttpVersion) -> Self {
        self.handle.set_http_version(version);
        self
    }

    /// Number of attempts (clamped to at least one) and whether transport
    /// errors count as a retry reason.
    pub fn retry(mut self, attempts: u16, on_transport_failure: bool) -> Self {
        self.retry = RetrySettings::new(attempts, on_transport_failure);
        self
    }

    pub fn form(mut self, form: FormPayload) -> Self {
        self.handle.set_method(&Method::POST);
        self.handle.set_form(form);
        self
    }

    pub fn headers<K, V, I>(mut self, headers: I) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in headers {
            self.handle.add_header(name.as_ref(), value.as_ref());
        }
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        match method {
            Method::GET | Method::POST => self.handle.set_method(&method),
            Method::HEAD => {
                self.handle.set_no_body(true);
                self.handle.set_method(&method);
            }
            Method::PUT => {
                self.handle.set_upload(true);
                self.handle.set_method(&method);
            }
            other => self.handle.set_custom_verb(other.as_str()),
        }
        self
    }

    pub fn get(self, url: &str) -> Self {
        self.method(Method::GET).url(url)
    }

    pub fn head(self, url: &str) -> Self {
        self.method(Method::HEAD).url(url)
    }

    pub fn post(mut self, url: &str, data: impl Into<Bytes>) -> Self {
        self.handle.set_post_body(data.into());
        self.method(Method::POST).url(url)
    }

    pub fn post_form(self, url: &str, form: FormPayload) -> Self {
        self.form(form).url(url)
    }

    /// Moves `data` into the PUT body feeder and announces its length to the
    /// engine. The feeder streams the payload on demand and rewinds before
    /// every retry attempt.
    pub fn put(mut self, url: &str, data: impl Into<Bytes>) -> Self {
        let feeder = Arc::new(Mutex::new(PutBodyFeeder::new(data.into())));
        let size = lock_unpoisoned(&feeder).len() as u64;
        let read_source = Arc::clone(&feeder);
        self.handle
            .set_read_function(Box::new(move |out| lock_unpoisoned(&read_source).fill(out)));
        self.handle.set_upload_size(size);
        self.put_feeder = Some(feeder);
        self.method(Method::PUT).url(url)
    }

    pub fn patch(mut self, url: &str, data: impl Into<Bytes>) -> Self {
        self.handle.set_post_body(data.into());
        self.method(Method::PATCH).url(url)
    }

    pub fn delete(self, url: &str) -> Self {
        self.method(Method::DELETE).url(url)
    }

    /// Submits the request and returns the future of its final outcome,
    /// bounded by the aggregate deadline covering every attempt and its
    /// worst-case backoff.
    pub fn async_perform(mut self) -> ResponseFuture {
        let deadline = aggregate_timeout(self.timeout, self.retry.attempts());
        let (promise, future) = oneshot::channel();

        let mut span = self.span_factory.start_span(&self.client_name);
        self.handle.add_header(HEADER_SPAN_ID, span.span_id());
        self.handle.add_header(HEADER_TRACE_ID, span.trace_id());
        self.handle.add_header(HEADER_REQUEST_ID, span.link_id());
        span.set_tag(TAG_HTTP_URL, self.handle.effective_url());

        let current_response: Arc<Mutex<Option<Response>>> = Arc::new(Mutex::new(None));
        let parser_target = Arc::clone(&current_response);
        self.handle.set_header_function(Box::new(move |raw| {
            if let Some((key, value)) = parse_header_line(raw)
                && let Some(response) = lock_unpoisoned(&parser_target).as_ref()
            {
                response.insert_header(key, value);
            }
        }));
        self.handle.set_accept_encoding("gzip,deflate");

        self.stats.start();
        debug!(
            target: "reqflow::request",
            url = %self.handle.effective_url(),
            attempts = self.retry.attempts(),
            trace_id = %span.trace_id(),
            "submitting http request"
        );

        let inner = Arc::new(RequestInner {
            stats: self.stats,
            timer: self.timer,
            cancelled: AtomicBool::new(false),
            runtime: Mutex::new(RequestRuntime {
                handle: self.handle,
                current_response,
                promise: Some(promise),
                retry: RetryState::new(self.retry),
                span: Some(span),
                put_feeder: self.put_feeder,
                pending_timer: None,
            }),
        });

        // A single attempt resolves straight through the terminal handler;
        // anything more goes through the retry decision first.
        let with_retry = inner.attempts_configured() > 1;
        inner.perform_request(with_retry);

        ResponseFuture::new(future, deadline, Request { inner })
    }

    /// Convenience that submits and awaits the future in one step.
    pub async fn perform(self) -> crate::Result<Response> {
        self.async_perform().get().await
    }
}

/// Shareable handle to a submitted request, usable to cancel it from any
/// thread. Clones refer to the same request.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Asks the engine to abort the in-flight transfer, or cancels the
    /// pending retry timer when the request is waiting out a backoff. The
    /// future resolves with a cancelled error; repeated calls have no
    /// further effect.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

struct RequestInner {
    stats: Arc<dyn StatsSink>,
    timer: TimerHandle,
    cancelled: AtomicBool,
    runtime: Mutex<RequestRuntime>,
}

/// Runtime state of a submitted request. Mutated only from reactor context;
/// the promise resolution is the only synchronisation point the awaiter
/// observes.
struct RequestRuntime {
    handle: Box<dyn TransferHandle>,
    current_response: Arc<Mutex<Option<Response>>>,
    promise: Option<oneshot::Sender<crate::Result<Response>>>,
    retry: RetryState,
    span: Option<Box<dyn TracingSpan>>,
    put_feeder: Option<Arc<Mutex<PutBodyFeeder>>>,
    pending_timer: Option<TimerGuard>,
}

impl RequestInner {
    fn attempts_configured(&self) -> u16 {
        lock_unpoisoned(&self.runtime).retry.settings().attempts()
    }

    /// Installs a fresh response as the body/header target and submits one
    /// attempt. Prior attempts' responses are dropped here.
    fn perform_request(self: &Arc<Self>, with_retry: bool) {
        let mut runtime = lock_unpoisoned(&self.runtime);
        if runtime.promise.is_none() {
            return;
        }
        runtime.pending_timer = None;
        // A cancel that raced the retry timer must not submit another
        // attempt.
        if self.cancelled.load(Ordering::SeqCst) {
            self.finalize(&mut runtime, Some(TransferError::cancelled()));
            return;
        }

        if let Some(feeder) = &runtime.put_feeder {
            lock_unpoisoned(feeder).rewind();
        }

        let response = Response::new();
        runtime.handle.set_body_sink(response.sink());
        *lock_unpoisoned(&runtime.current_response) = Some(response);

        let holder = Arc::clone(self);
        let handler: CompletionHandler = Box::new(move |error| {
            if with_retry {
                holder.on_retry(error);
            } else {
                holder.on_completed(error);
            }
        });
        runtime.handle.async_perform(handler);
    }

    /// Per-attempt completion when retries are configured: records the
    /// attempt, then either finishes or schedules the next attempt after an
    /// exponentially growing randomized delay.
    fn on_retry(self: &Arc<Self>, error: Option<TransferError>) {
        let mut runtime = lock_unpoisoned(&self.runtime);
        if runtime.promise.is_none() {
            return;
        }
        self.record_attempt(&runtime, error.as_ref());

        let status = runtime.handle.response_code();
        match runtime.retry.decide(error.as_ref(), status) {
            RetryVerdict::Finish => self.finalize(&mut runtime, error),
            RetryVerdict::Retry { delay } => {
                if self.cancelled.load(Ordering::SeqCst) {
                    self.finalize(&mut runtime, Some(TransferError::cancelled()));
                    return;
                }
                warn!(
                    target: "reqflow::request",
                    status,
                    error = ?error,
                    delay_ms = delay.as_millis() as u64,
                    attempt = runtime.retry.attempts_used(),
                    max_attempts = runtime.retry.settings().attempts(),
                    "retrying http request"
                );
                runtime.retry.note_retry_scheduled();

                let holder = Arc::clone(self);
                let guard = self
                    .timer
                    .singleshot(delay, move |result| holder.on_retry_timer(result));
                runtime.pending_timer = Some(guard);
            }
        }
    }

    /// Terminal completion for single-attempt requests.
    fn on_completed(self: &Arc<Self>, error: Option<TransferError>) {
        let mut runtime = lock_unpoisoned(&self.runtime);
        if runtime.promise.is_none() {
            return;
        }
        self.record_attempt(&runtime, error.as_ref());
        self.finalize(&mut runtime, error);
    }

    fn on_retry_timer(self: &Arc<Self>, result: Result<(), TimerError>) {
        match result {
            Ok(()) => self.perform_request(true),
            Err(TimerError::Cancelled) => {
                let mut runtime = lock_unpoisoned(&self.runtime);
                self.finalize(&mut runtime, Some(TransferError::cancelled()));
            }
            Err(TimerError::ReactorGone) => {
                let mut runtime = lock_unpoisoned(&self.runtime);
                self.finalize(
                    &mut runtime,
                    Some(TransferError::new(
                        crate::transfer::TransferErrorKind::Other,
                        "retry timer could not be scheduled",
                    )),
                );
            }
        }
    }

    fn record_attempt(&self, runtime: &RequestRuntime, error: Option<&TransferError>) {
        if let Some(time_to_start) = runtime.handle.timings().time_to_start {
            self.stats.store_time_to_start(time_to_start);
        }
        match error {
            Some(error) => self.stats.finish_ec(error),
            None => self.stats.finish_ok(runtime.handle.response_code()),
        }
    }

    /// Resolves the promise exactly once, tags and releases the span, and
    /// surfaces either the final attempt's response or the mapped error.
    fn finalize(&self, runtime: &mut RequestRuntime, error: Option<TransferError>) {
        let Some(promise) = runtime.promise.take() else {
            return;
        };
        runtime.pending_timer = None;
        let mut span = runtime.span.take();

        let outcome = match error {
            Some(error) => {
                if let Some(span) = span.as_mut() {
                    span.set_tag(TAG_ERROR, "true".to_owned());
                    span.set_tag(
                        TAG_HTTP_STATUS_CODE,
                        SYNTHETIC_TRANSPORT_STATUS.to_string(),
                    );
                }
                debug!(
                    target: "reqflow::request",
                    error = %error,
                    attempts = runtime.retry.attempts_used(),
                    "http request failed"
                );
                Err(Error::from(error))
            }
            None => {
                let response = lock_unpoisoned(&runtime.current_response)
                    .take()
                    .unwrap_or_default();
                response.set_status(runtime.handle.response_code());
                if let Some(span) = span.as_mut() {
                    span.set_tag(TAG_HTTP_STATUS_CODE, response.status_code().to_string());
                    if !response.is_ok() {
                        span.set_tag(TAG_ERROR, "true".to_owned());
                    }
                }
                debug!(
                    target: "reqflow::request",
                    status = response.status_code(),
                    attempts = runtime.retry.attempts_used(),
                    "http request completed"
                );
                Ok(response)
            }
        };

        let _ = promise.send(outcome);
        if let Some(span) = span.as_mut() {
            span.finish();
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut runtime = lock_unpoisoned(&self.runtime);
        if runtime.promise.is_none() {
            return;
        }
        debug!(target: "reqflow::request", "cancelling http request");
        if let Some(timer) = runtime.pending_timer.take() {
            // Waiting out a backoff: the timer callback observes the
            // cancellation and resolves the future without another attempt.
            timer.cancel();
            return;
        }
        runtime.handle.cancel();
    }
}
