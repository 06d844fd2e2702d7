pub(crate) mod engine;
pub(crate) mod reactor;

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use thiserror::Error;

use crate::response::ResponseSink;

pub use engine::HyperTransferFactory;

/// Invoked exactly once per submitted transfer, on the reactor thread, with
/// the transfer's outcome. Implementations of [`TransferHandle`] must never
/// invoke it synchronously from `async_perform`.
pub type CompletionHandler = Box<dyn FnOnce(Option<TransferError>) + Send + 'static>;

/// Invoked on the reactor thread once per raw header line. The buffer is
/// owned by the engine, valid for the duration of the call, and may be
/// mutated in place.
pub type HeaderCallback = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

/// Invoked on the reactor thread to pull upload body data: fills the output
/// buffer and returns the byte count, zero signalling end of body.
pub type ReadCallback = Box<dyn FnMut(&mut [u8]) -> usize + Send + 'static>;

/// Protocol version hint forwarded to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HttpVersion {
    #[default]
    Default,
    Http10,
    Http11,
    Http2,
}

/// Failure classes a transfer can report. `Timeout`, `Cancelled`, and
/// `Protocol` map to their own caller-visible errors; the rest surface as
/// transport errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    Protocol,
    Timeout,
    Cancelled,
    Other,
}

impl TransferErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Write => "write",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TransferErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(TransferErrorKind::Cancelled, "transfer was cancelled")
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            TransferErrorKind::Timeout,
            format!("transfer timed out after {}ms", limit.as_millis()),
        )
    }
}

/// Timings measured by the engine for the last completed attempt.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferTimings {
    /// Time from submission until the first response byte.
    pub time_to_start: Option<Duration>,
}

/// A pre-encoded multipart form body. Encoding is the caller's concern; the
/// engine only forwards the content type and payload.
#[derive(Clone, Debug)]
pub struct FormPayload {
    content_type: String,
    body: Bytes,
}

impl FormPayload {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// One native asynchronous transfer, exclusively owned by a single request
/// for its lifetime. Setters accumulate configuration; `async_perform`
/// submits the transfer and delivers the outcome through the handler on the
/// reactor thread. The handle must stay valid at least as long as any
/// outstanding callback.
pub trait TransferHandle: Send {
    fn set_url(&mut self, url: &str);
    fn set_method(&mut self, method: &Method);
    fn set_custom_verb(&mut self, verb: &str);
    fn set_follow_location(&mut self, follow: bool);
    fn set_max_redirects(&mut self, max_redirects: usize);
    fn set_post_redirect_replay(&mut self, replay: bool);
    /// Peer and host verification are only ever disabled together: the
    /// engine skips certificate validation when either flag is off.
    fn set_verify_peer(&mut self, verify: bool);
    fn set_verify_host(&mut self, verify: bool);
    fn set_ca_bundle(&mut self, path: &Path);
    fn set_ca_directory(&mut self, path: &Path);
    fn set_crl_file(&mut self, path: &Path);
    fn set_http_version(&mut self, version: HttpVersion);
    fn set_timeout(&mut self, timeout: Duration);
    fn set_connect_timeout(&mut self, timeout: Duration);
    fn set_post_body(&mut self, body: Bytes);
    fn set_form(&mut self, form: FormPayload);
    fn add_header(&mut self, name: &str, value: &str);
    fn set_accept_encoding(&mut self, encodings: &str);
    /// The engine must not install process-wide signal handlers. The default
    /// engine never does; a wrapper over a library that would (e.g. for DNS
    /// timeouts) must honor this flag.
    fn set_no_signal(&mut self, no_signal: bool);
    fn set_upload(&mut self, upload: bool);
    fn set_upload_size(&mut self, size: u64);
    fn set_no_body(&mut self, no_body: bool);
    fn set_read_function(&mut self, callback: ReadCallback);
    fn set_header_function(&mut self, callback: HeaderCallback);
    fn set_body_sink(&mut self, sink: ResponseSink);

    fn async_perform(&mut self, handler: CompletionHandler);
    /// Requests abort of the in-flight transfer; the eventual completion
    /// delivers a cancellation error through the registered handler.
    fn cancel(&self);

    fn timings(&self) -> TransferTimings;
    /// The configured URL before completion, the final URL (after any
    /// redirects) afterwards.
    fn effective_url(&self) -> String;
    /// Valid after a completed attempt; zero before.
    fn response_code(&self) -> u16;
}

pub trait TransferFactory: Send + Sync {
    fn create_handle(&self) -> Box<dyn TransferHandle>;
}

/// Guarantees the completion handler fires exactly once even if the
/// submitted transfer task is dropped without running (reactor shutdown).
/// The drop path defers to a detached thread so completion never runs
/// inline with submission.
pub(crate) struct CompletionGuard {
    handler: Option<CompletionHandler>,
}

impl CompletionGuard {
    pub(crate) fn new(handler: CompletionHandler) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    pub(crate) fn complete(mut self, error: Option<TransferError>) {
        if let Some(handler) = self.handler.take() {
            handler(error);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            std::thread::spawn(move || {
                handler(Some(TransferError::new(
                    TransferErrorKind::Other,
                    "transfer engine shut down before completion",
                )));
            });
        }
    }
}
