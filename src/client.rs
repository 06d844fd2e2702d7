use std::sync::Arc;

use bytes::Bytes;
use http::Method;

use crate::error::Error;
use crate::request::RequestBuilder;
use crate::span::{LogSpanFactory, SpanFactory};
use crate::stats::{ClientStats, FanoutStats, StatsSink, StatsSnapshot};
use crate::transfer::reactor::{Reactor, TimerHandle};
use crate::transfer::{HyperTransferFactory, TransferFactory};

const DEFAULT_CLIENT_NAME: &str = "external";

/// Factory for request builders. Owns the reactor thread the transfer
/// engine and retry timers run on, the shared statistics sink, and the span
/// factory; all three can be swapped out at build time.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transfer_factory: Arc<dyn TransferFactory>,
    stats: ClientStats,
    stats_sink: Arc<dyn StatsSink>,
    span_factory: Arc<dyn SpanFactory>,
    timer: TimerHandle,
    client_name: Arc<str>,
    // Keeps the reactor thread alive for as long as the client exists;
    // in-flight requests hold their own references through the timer.
    _reactor: Arc<Reactor>,
}

pub struct ClientBuilder {
    client_name: String,
    transfer_factory: Option<Arc<dyn TransferFactory>>,
    span_factory: Option<Arc<dyn SpanFactory>>,
    stats_sink: Option<Arc<dyn StatsSink>>,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transfer_factory: None,
            span_factory: None,
            stats_sink: None,
        }
    }

    /// Name used for reactor thread naming and as the span's client tag.
    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Replaces the default hyper-backed transfer engine.
    pub fn transfer_factory(mut self, transfer_factory: Arc<dyn TransferFactory>) -> Self {
        self.transfer_factory = Some(transfer_factory);
        self
    }

    pub fn span_factory(mut self, span_factory: Arc<dyn SpanFactory>) -> Self {
        self.span_factory = Some(span_factory);
        self
    }

    /// Adds a statistics sink. Per-attempt calls fan out to both the custom
    /// sink and the client's default sink, so [`Client::stats_snapshot`]
    /// keeps reflecting traffic either way.
    pub fn stats_sink(mut self, stats_sink: Arc<dyn StatsSink>) -> Self {
        self.stats_sink = Some(stats_sink);
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let thread_name = format!("reqflow-{}", self.client_name);
        let reactor = Reactor::spawn(&thread_name).map_err(|error| Error::Init {
            message: format!("failed to start reactor thread: {error}"),
        })?;

        let transfer_factory = self
            .transfer_factory
            .unwrap_or_else(|| Arc::new(HyperTransferFactory::new(Arc::clone(&reactor))));
        let stats = ClientStats::new();
        let stats_sink: Arc<dyn StatsSink> = match self.stats_sink {
            Some(custom_sink) => Arc::new(FanoutStats::new(stats.clone(), custom_sink)),
            None => Arc::new(stats.clone()),
        };
        let span_factory = self
            .span_factory
            .unwrap_or_else(|| Arc::new(LogSpanFactory));

        Ok(Client {
            inner: Arc::new(ClientInner {
                transfer_factory,
                stats,
                stats_sink,
                span_factory,
                timer: TimerHandle::new(Arc::clone(&reactor)),
                client_name: Arc::from(self.client_name),
                _reactor: reactor,
            }),
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn new() -> crate::Result<Self> {
        Self::builder().build()
    }

    /// Creates an unconfigured request on a fresh transfer handle.
    pub fn request(&self) -> RequestBuilder {
        RequestBuilder::new(
            self.inner.transfer_factory.create_handle(),
            Arc::clone(&self.inner.stats_sink),
            Arc::clone(&self.inner.span_factory),
            self.inner.timer.clone(),
            Arc::clone(&self.inner.client_name),
        )
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request().get(url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request().head(url)
    }

    pub fn post(&self, url: &str, data: impl Into<Bytes>) -> RequestBuilder {
        self.request().post(url, data)
    }

    pub fn put(&self, url: &str, data: impl Into<Bytes>) -> RequestBuilder {
        self.request().put(url, data)
    }

    pub fn patch(&self, url: &str, data: impl Into<Bytes>) -> RequestBuilder {
        self.request().patch(url, data)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request().delete(url)
    }

    pub fn method(&self, method: Method) -> RequestBuilder {
        self.request().method(method)
    }

    /// Point-in-time view of the default statistics sink.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}
