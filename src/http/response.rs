use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::error::Error;
use crate::request::Request;
use crate::util::lock_unpoisoned;

/// The response of a single attempt. A fresh one is installed at the start
/// of every attempt; only the final attempt's response reaches the caller.
///
/// Header keys are stored case-preserved exactly as the engine delivered
/// them; inserting a duplicate key replaces the prior value.
#[derive(Clone, Debug, Default)]
pub struct Response {
    shared: Arc<ResponseShared>,
}

#[derive(Debug, Default)]
struct ResponseShared {
    status: AtomicU16,
    headers: Mutex<BTreeMap<String, String>>,
    body: Mutex<BytesMut>,
}

impl Response {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn status_code(&self) -> u16 {
        self.shared.status.load(Ordering::Acquire)
    }

    /// 2xx/3xx terminal statuses count as ok; everything else flips the
    /// span's error tag.
    pub fn is_ok(&self) -> bool {
        (200..400).contains(&self.status_code())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        lock_unpoisoned(&self.shared.headers).get(name).cloned()
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        lock_unpoisoned(&self.shared.headers).clone()
    }

    pub fn body(&self) -> Bytes {
        lock_unpoisoned(&self.shared.body).clone().freeze()
    }

    pub fn body_text_lossy(&self) -> String {
        String::from_utf8_lossy(&lock_unpoisoned(&self.shared.body)).into_owned()
    }

    pub(crate) fn set_status(&self, status: u16) {
        self.shared.status.store(status, Ordering::Release);
    }

    pub(crate) fn insert_header(&self, key: String, value: String) {
        lock_unpoisoned(&self.shared.headers).insert(key, value);
    }

    /// The writable byte stream the transfer engine targets with body data.
    pub(crate) fn sink(&self) -> ResponseSink {
        ResponseSink {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Write half of a [`Response`]: the transfer engine appends body bytes
/// through it while the response accumulates on the request side.
#[derive(Clone, Debug)]
pub struct ResponseSink {
    shared: Arc<ResponseShared>,
}

impl io::Write for ResponseSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        lock_unpoisoned(&self.shared.body).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The caller-visible future of a submitted request. Wraps the request's
/// promise with the aggregate deadline that budgets for every attempt plus
/// worst-case backoff; if the deadline fires first the underlying transfer
/// is cancelled and its eventual result discarded.
pub struct ResponseFuture {
    receiver: oneshot::Receiver<crate::Result<Response>>,
    deadline: Option<Duration>,
    request: Request,
}

impl ResponseFuture {
    pub(crate) fn new(
        receiver: oneshot::Receiver<crate::Result<Response>>,
        deadline: Option<Duration>,
        request: Request,
    ) -> Self {
        Self {
            receiver,
            deadline,
            request,
        }
    }

    /// Handle to the in-flight request, usable to cancel it while awaiting.
    pub fn request(&self) -> Request {
        self.request.clone()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub async fn get(self) -> crate::Result<Response> {
        let Self {
            receiver,
            deadline,
            request,
        } = self;

        match deadline {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(Error::Cancelled),
                Err(_) => {
                    request.cancel();
                    Err(Error::deadline_exceeded(limit.as_millis()))
                }
            },
            None => receiver.await.unwrap_or(Err(Error::Cancelled)),
        }
    }
}

impl IntoFuture for ResponseFuture {
    type Output = crate::Result<Response>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.get())
    }
}
