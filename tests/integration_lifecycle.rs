use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::write::GzEncoder;
use reqflow::{
    Client, Error, ErrorCode, SpanFactory, TracingSpan, TransportErrorKind,
};

#[derive(Clone)]
struct ScriptedReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    drop_connection: bool,
}

impl ScriptedReply {
    fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
            drop_connection: false,
        }
    }

    fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn drop_connection() -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
            drop_connection: true,
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(raw_headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(raw_headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
            && let Ok(parsed) = value.trim().parse::<usize>()
        {
            return parsed;
        }
    }
    0
}

fn read_http_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let content_length = parse_content_length(&raw[..header_end]);
            let expected_total = header_end + 4 + content_length;
            if raw.len() >= expected_total {
                break;
            }
        }
    }

    Ok(raw)
}

fn write_http_response(stream: &mut TcpStream, reply: &ScriptedReply) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        status_text(reply.status),
        reply.body.len()
    )
    .into_bytes();

    for (name, value) in &reply.headers {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&reply.body);

    stream.write_all(&raw)?;
    stream.flush()
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Serves one scripted reply per accepted connection, in order, and records
/// every received request.
struct ScriptedServer {
    url: String,
    served: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    join: Option<JoinHandle<()>>,
}

impl ScriptedServer {
    fn start(replies: Vec<ScriptedReply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted server");
        let authority = listener
            .local_addr()
            .expect("read local address")
            .to_string();
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let requests_clone = Arc::clone(&requests);
        let expected = replies.len();

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut next_reply = 0_usize;

            while Instant::now() < deadline && next_reply < expected {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let reply = replies[next_reply].clone();
                        next_reply += 1;

                        if reply.drop_connection {
                            let _ = stream.set_read_timeout(Some(Duration::from_millis(100)));
                            let mut chunk = [0_u8; 1024];
                            let _ = stream.read(&mut chunk);
                            drop(stream);
                            served_clone.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }

                        if let Ok(request) = read_http_message(&mut stream) {
                            lock_unpoisoned(&requests_clone).push(request);
                        }
                        if !reply.delay.is_zero() {
                            thread::sleep(reply.delay);
                        }
                        let _ = write_http_response(&mut stream, &reply);
                        served_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            url: format!("http://{authority}"),
            served,
            requests,
            join: Some(join),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn wait_for_served_count(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = self.served_count();
            if observed >= expected || Instant::now() >= deadline {
                return observed;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn requests(&self) -> Vec<Vec<u8>> {
        lock_unpoisoned(&self.requests).clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[derive(Default)]
struct SpanRecord {
    tags: BTreeMap<&'static str, String>,
    finished: usize,
}

struct RecordingSpan {
    trace_id: String,
    span_id: String,
    link_id: String,
    record: Arc<Mutex<SpanRecord>>,
}

impl TracingSpan for RecordingSpan {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn span_id(&self) -> &str {
        &self.span_id
    }

    fn link_id(&self) -> &str {
        &self.link_id
    }

    fn set_tag(&mut self, key: &'static str, value: String) {
        lock_unpoisoned(&self.record).tags.insert(key, value);
    }

    fn finish(&mut self) {
        lock_unpoisoned(&self.record).finished += 1;
    }
}

#[derive(Clone, Default)]
struct RecordingSpanFactory {
    records: Arc<Mutex<Vec<Arc<Mutex<SpanRecord>>>>>,
}

impl RecordingSpanFactory {
    fn records(&self) -> Vec<Arc<Mutex<SpanRecord>>> {
        lock_unpoisoned(&self.records).clone()
    }
}

impl SpanFactory for RecordingSpanFactory {
    fn start_span(&self, _client_name: &str) -> Box<dyn TracingSpan> {
        let record = Arc::new(Mutex::new(SpanRecord::default()));
        lock_unpoisoned(&self.records).push(Arc::clone(&record));
        Box::new(RecordingSpan {
            trace_id: "0123456789abcdef0123456789abcdef".to_owned(),
            span_id: "0123456789abcdef".to_owned(),
            link_id: "fedcba9876543210".to_owned(),
            record,
        })
    }
}

fn client_with_spans(spans: &RecordingSpanFactory) -> Client {
    Client::builder()
        .client_name("lifecycle-test")
        .span_factory(Arc::new(spans.clone()))
        .build()
        .expect("client should build")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn success_without_retries_returns_body_and_records_one_attempt() {
    let server = ScriptedServer::start(vec![ScriptedReply::new(200, b"hello".to_vec())]);
    let spans = RecordingSpanFactory::default();
    let client = client_with_spans(&spans);

    let response = client
        .get(&server.url("/item"))
        .timeout(Duration::from_secs(2))
        .retry(1, false)
        .async_perform()
        .await
        .expect("request should succeed");

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.body_text_lossy(), "hello");
    assert_eq!(server.served_count(), 1);

    let stats = client.stats_snapshot();
    assert_eq!(stats.requests_started, 1);
    assert_eq!(stats.attempts_ok, 1);
    assert_eq!(stats.attempts_failed, 0);
    assert_eq!(stats.status_counts.get(&200), Some(&1));

    let records = spans.records();
    assert_eq!(records.len(), 1);
    let record = lock_unpoisoned(&records[0]);
    assert_eq!(record.finished, 1);
    assert_eq!(record.tags.get("http.status_code").map(String::as_str), Some("200"));
    assert!(record.tags.get("http.url").is_some());
    assert_eq!(record.tags.get("error"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_errors_are_retried_with_backoff_until_success() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(503, b"busy".to_vec()),
        ScriptedReply::new(503, b"busy".to_vec()),
        ScriptedReply::new(200, b"recovered".to_vec()),
    ]);
    let spans = RecordingSpanFactory::default();
    let client = client_with_spans(&spans);

    let started = Instant::now();
    let response = client
        .get(&server.url("/flaky"))
        .timeout(Duration::from_secs(2))
        .retry(3, false)
        .async_perform()
        .await
        .expect("final attempt should succeed");
    let elapsed = started.elapsed();

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.body_text_lossy(), "recovered");
    assert_eq!(server.served_count(), 3);
    // Two backoff delays, each drawn from a window starting at 25ms.
    assert!(elapsed >= Duration::from_millis(50), "elapsed {elapsed:?}");

    let stats = client.stats_snapshot();
    assert_eq!(stats.attempts_ok, 3);
    assert_eq!(stats.status_counts.get(&503), Some(&2));
    assert_eq!(stats.status_counts.get(&200), Some(&1));

    let records = spans.records();
    let record = lock_unpoisoned(&records[0]);
    assert_eq!(record.tags.get("http.status_code").map(String::as_str), Some("200"));
    assert_eq!(record.tags.get("error"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_surface_the_last_response_not_an_error() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(500, b"broken".to_vec()),
        ScriptedReply::new(500, b"still broken".to_vec()),
    ]);
    let spans = RecordingSpanFactory::default();
    let client = client_with_spans(&spans);

    let response = client
        .get(&server.url("/broken"))
        .timeout(Duration::from_secs(2))
        .retry(2, true)
        .async_perform()
        .await
        .expect("http errors are soft errors");

    assert_eq!(response.status_code(), 500);
    assert_eq!(response.body_text_lossy(), "still broken");
    assert_eq!(server.served_count(), 2);

    let stats = client.stats_snapshot();
    assert_eq!(stats.attempts_ok, 2);
    assert_eq!(stats.status_counts.get(&500), Some(&2));

    let records = spans.records();
    let record = lock_unpoisoned(&records[0]);
    assert_eq!(record.tags.get("error").map(String::as_str), Some("true"));
    assert_eq!(record.tags.get("http.status_code").map(String::as_str), Some("500"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_failure_without_opt_in_fails_after_one_attempt() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let url = format!("http://{}/gone", listener.local_addr().expect("local addr"));
    drop(listener);

    let spans = RecordingSpanFactory::default();
    let client = client_with_spans(&spans);

    let error = client
        .get(&url)
        .timeout(Duration::from_secs(1))
        .retry(3, false)
        .async_perform()
        .await
        .expect_err("refused connection should fail");
    match &error {
        Error::Transport { kind, .. } => assert_eq!(*kind, TransportErrorKind::Connect),
        other => panic!("unexpected error variant: {other}"),
    }

    let stats = client.stats_snapshot();
    assert_eq!(stats.attempts_failed, 1);
    assert_eq!(stats.attempts_ok, 0);

    let records = spans.records();
    let record = lock_unpoisoned(&records[0]);
    assert_eq!(record.finished, 1);
    assert_eq!(record.tags.get("error").map(String::as_str), Some("true"));
    assert_eq!(record.tags.get("http.status_code").map(String::as_str), Some("599"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transport_failure_with_opt_in_retries_and_recovers() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::drop_connection(),
        ScriptedReply::new(200, b"second time lucky".to_vec()),
    ]);
    let client = Client::builder().build().expect("client should build");

    let started = Instant::now();
    let response = client
        .get(&server.url("/unstable"))
        .timeout(Duration::from_secs(2))
        .retry(2, true)
        .async_perform()
        .await
        .expect("second attempt should succeed");
    let elapsed = started.elapsed();

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.body_text_lossy(), "second time lucky");
    assert_eq!(server.served_count(), 2);
    assert!(elapsed >= Duration::from_millis(25), "elapsed {elapsed:?}");

    let stats = client.stats_snapshot();
    assert_eq!(stats.attempts_failed, 1);
    assert_eq!(stats.attempts_ok, 1);
    assert_eq!(stats.status_counts.get(&200), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_during_backoff_resolves_promptly() {
    let server = ScriptedServer::start(vec![ScriptedReply::new(500, b"broken".to_vec())]);
    let client = Client::builder().build().expect("client should build");

    let future = client
        .get(&server.url("/cancel-me"))
        .timeout(Duration::from_secs(2))
        .retry(5, true)
        .async_perform();
    let request = future.request();
    let awaiter = tokio::spawn(future.get());

    assert_eq!(server.wait_for_served_count(1, Duration::from_secs(2)), 1);
    request.cancel();

    let outcome = awaiter.await.expect("awaiter should not panic");
    match outcome {
        Err(Error::Cancelled) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(server.served_count(), 1, "no further attempt may be submitted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_response_headers_keep_the_last_value() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(200, b"ok".to_vec())
            .header("x-tag", "one")
            .header("x-tag", "two"),
    ]);
    let client = Client::builder().build().expect("client should build");

    let response = client
        .get(&server.url("/tags"))
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("request should succeed");

    assert_eq!(response.header("x-tag").as_deref(), Some("two"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gzip_encoded_bodies_are_decoded_into_the_response() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(b"compressed greetings")
        .expect("gzip write should succeed");
    let compressed = encoder.finish().expect("gzip finish should succeed");

    let server = ScriptedServer::start(vec![
        ScriptedReply::new(200, compressed).header("Content-Encoding", "gzip"),
    ]);
    let client = Client::builder().build().expect("client should build");

    let response = client
        .get(&server.url("/compressed"))
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("request should succeed");

    assert_eq!(response.body_text_lossy(), "compressed greetings");
    assert_eq!(response.header("content-encoding").as_deref(), Some("gzip"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redirects_are_followed_to_the_target() {
    // The first reply redirects within the same server; the second serves it.
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(302, Vec::new()).header("Location", "/target"),
        ScriptedReply::new(200, b"followed".to_vec()),
    ]);
    let client = Client::builder().build().expect("client should build");

    let response = client
        .get(&server.url("/start"))
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("redirect should be followed");

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.body_text_lossy(), "followed");
    assert_eq!(server.served_count(), 2);

    let requests = server.requests();
    let second = String::from_utf8_lossy(&requests[1]).into_owned();
    assert!(second.starts_with("GET /target"), "unexpected request: {second}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redirects_are_not_followed_when_disabled() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(302, Vec::new()).header("Location", "/elsewhere"),
    ]);
    let client = Client::builder().build().expect("client should build");

    let response = client
        .get(&server.url("/start"))
        .follow_redirects(false)
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("redirect status is a soft outcome");

    assert_eq!(response.status_code(), 302);
    assert_eq!(response.header("location").as_deref(), Some("/elsewhere"));
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn put_uploads_stream_the_full_payload() {
    let payload = "streamed payload data".repeat(100);
    let server = ScriptedServer::start(vec![ScriptedReply::new(200, b"stored".to_vec())]);
    let client = Client::builder().build().expect("client should build");

    let response = client
        .put(&server.url("/upload"), payload.clone())
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("upload should succeed");

    assert_eq!(response.status_code(), 200);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let raw = &requests[0];
    let header_end = find_header_end(raw).expect("request should have headers");
    assert_eq!(&raw[header_end + 4..], payload.as_bytes());

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    assert!(head.starts_with("PUT /upload"), "unexpected request: {head}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn post_sends_the_configured_body() {
    let server = ScriptedServer::start(vec![ScriptedReply::new(200, b"created".to_vec())]);
    let client = Client::builder().build().expect("client should build");

    let response = client
        .post(&server.url("/items"), "name=demo")
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("post should succeed");

    assert_eq!(response.status_code(), 200);
    let requests = server.requests();
    let raw = &requests[0];
    let header_end = find_header_end(raw).expect("request should have headers");
    assert_eq!(&raw[header_end + 4..], b"name=demo");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tracing_headers_are_injected_into_the_request() {
    let server = ScriptedServer::start(vec![ScriptedReply::new(200, b"ok".to_vec())]);
    let spans = RecordingSpanFactory::default();
    let client = client_with_spans(&spans);

    client
        .get(&server.url("/traced"))
        .timeout(Duration::from_secs(2))
        .async_perform()
        .await
        .expect("request should succeed");

    let requests = server.requests();
    let head = String::from_utf8_lossy(&requests[0]).to_ascii_lowercase();
    assert!(head.contains("x-yaspanid: 0123456789abcdef"));
    assert!(head.contains("x-yatraceid: 0123456789abcdef0123456789abcdef"));
    assert!(head.contains("x-yarequestid: fedcba9876543210"));
    assert!(head.contains("accept-encoding: gzip,deflate"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_responses_hit_the_attempt_timeout() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(200, b"too late".to_vec()).delay(Duration::from_millis(500)),
    ]);
    let client = Client::builder().build().expect("client should build");

    let started = Instant::now();
    let error = client
        .get(&server.url("/slow"))
        .timeout(Duration::from_millis(100))
        .async_perform()
        .await
        .expect_err("attempt should time out");
    let elapsed = started.elapsed();

    assert_eq!(error.code(), ErrorCode::Timeout);
    assert!(elapsed < Duration::from_millis(450), "elapsed {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wall_clock_stays_under_the_aggregate_deadline() {
    let server = ScriptedServer::start(vec![
        ScriptedReply::new(200, b"late".to_vec()).delay(Duration::from_secs(1)),
        ScriptedReply::new(200, b"late".to_vec()).delay(Duration::from_secs(1)),
    ]);
    let client = Client::builder().build().expect("client should build");

    let started = Instant::now();
    let outcome = client
        .get(&server.url("/always-slow"))
        .timeout(Duration::from_millis(150))
        .retry(2, true)
        .async_perform()
        .await;
    let elapsed = started.elapsed();

    assert!(outcome.is_err(), "slow server should exhaust every attempt");
    // ceil(150 * 1.1 * 2) + 50ms worst-case backoff, plus scheduler slack.
    assert!(elapsed < Duration::from_millis(700), "elapsed {elapsed:?}");
}
