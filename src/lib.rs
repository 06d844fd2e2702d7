//! `reqflow` is an asynchronous HTTP request engine: fluent per-request
//! configuration, single-shot execution on a dedicated I/O reactor thread,
//! exponential-backoff retries, aggregate deadlines, per-attempt statistics,
//! and distributed-tracing propagation headers.
//!
//! # Quick Start
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use reqflow::Client;
//!
//! let client = Client::builder().client_name("billing").build()?;
//!
//! let response = client
//!     .get("https://api.example.com/v1/items")
//!     .timeout(Duration::from_secs(3))
//!     .retry(3, true)
//!     .async_perform()
//!     .await?;
//!
//! assert_eq!(response.status_code(), 200);
//! println!("{}", response.body_text_lossy());
//! # Ok(())
//! # }
//! ```
//!
//! A `4xx`/`5xx` response is returned as a [`Response`], never raised as an
//! error; only statuses of 500 and above make the retry policy try again.
//! Transport errors retry only when `retry(n, true)` opted in.

mod body;
mod client;
mod core;
mod http;
mod request;
mod transfer;

pub(crate) use crate::core::error;
pub(crate) use crate::core::retry;
pub(crate) use crate::core::span;
pub(crate) use crate::core::stats;
pub(crate) use crate::core::util;
pub(crate) use crate::http::headers;
pub(crate) use crate::http::response;

pub use crate::client::{Client, ClientBuilder};
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::{Response, ResponseFuture, ResponseSink};
pub use crate::retry::RetrySettings;
pub use crate::span::{
    HEADER_REQUEST_ID, HEADER_SPAN_ID, HEADER_TRACE_ID, LogSpanFactory, SpanFactory, TracingSpan,
};
pub use crate::stats::{ClientStats, StatsSink, StatsSnapshot};
pub use crate::transfer::{
    CompletionHandler, FormPayload, HeaderCallback, HttpVersion, HyperTransferFactory,
    ReadCallback, TransferError, TransferErrorKind, TransferFactory, TransferHandle,
    TransferTimings,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, Error, ErrorCode, FormPayload, HttpVersion, Request, RequestBuilder, Response,
        Result, RetrySettings,
    };
}
