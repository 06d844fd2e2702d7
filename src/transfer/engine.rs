use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, LOCATION};
use http::{Method, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;

use crate::response::ResponseSink;
use crate::transfer::reactor::Reactor;
use crate::transfer::{
    CompletionGuard, CompletionHandler, FormPayload, HeaderCallback, HttpVersion, ReadCallback,
    TransferError, TransferErrorKind, TransferFactory, TransferHandle, TransferTimings,
};
use crate::util::{
    classify_transport_error_text, is_redirect_status, lock_unpoisoned, redirect_method,
    resolve_redirect_uri,
};

type HyperClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<HttpConnector>,
    Full<Bytes>,
>;

/// Creates hyper-backed transfer handles bound to the client's reactor.
pub struct HyperTransferFactory {
    reactor: Arc<Reactor>,
}

impl HyperTransferFactory {
    pub(crate) fn new(reactor: Arc<Reactor>) -> Self {
        Self { reactor }
    }
}

impl TransferFactory for HyperTransferFactory {
    fn create_handle(&self) -> Box<dyn TransferHandle> {
        Box::new(HyperTransfer::new(Arc::clone(&self.reactor)))
    }
}

#[derive(Clone, Debug, Default)]
struct TransferOptions {
    url: Option<String>,
    method: Method,
    custom_verb: Option<String>,
    follow_location: bool,
    max_redirects: usize,
    post_redirect_replay: bool,
    verify_peer: bool,
    verify_host: bool,
    ca_bundle: Option<PathBuf>,
    ca_directory: Option<PathBuf>,
    crl_file: Option<PathBuf>,
    http_version: HttpVersion,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    post_body: Option<Bytes>,
    form: Option<FormPayload>,
    headers: Vec<(String, String)>,
    accept_encoding: Option<String>,
    upload: bool,
    upload_size: Option<u64>,
    no_body: bool,
}

#[derive(Default)]
struct TransferCallbacks {
    header_function: Option<HeaderCallback>,
    read_function: Option<ReadCallback>,
    body_sink: Option<ResponseSink>,
}

#[derive(Debug, Default)]
struct TransferOutcome {
    effective_url: String,
    response_code: u16,
    time_to_start: Option<Duration>,
}

/// The default transfer engine: one hyper client per transfer, driven on the
/// reactor thread. Never installs signal handlers, so no-signal mode holds
/// by construction.
pub struct HyperTransfer {
    reactor: Arc<Reactor>,
    options: TransferOptions,
    callbacks: Arc<Mutex<TransferCallbacks>>,
    outcome: Arc<Mutex<TransferOutcome>>,
    cancel: tokio_util::sync::CancellationToken,
}

impl HyperTransfer {
    fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            reactor,
            options: TransferOptions {
                verify_peer: true,
                verify_host: true,
                ..TransferOptions::default()
            },
            callbacks: Arc::new(Mutex::new(TransferCallbacks::default())),
            outcome: Arc::new(Mutex::new(TransferOutcome::default())),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

impl TransferHandle for HyperTransfer {
    fn set_url(&mut self, url: &str) {
        self.options.url = Some(url.to_owned());
    }

    fn set_method(&mut self, method: &Method) {
        self.options.method = method.clone();
    }

    fn set_custom_verb(&mut self, verb: &str) {
        self.options.custom_verb = Some(verb.to_owned());
    }

    fn set_follow_location(&mut self, follow: bool) {
        self.options.follow_location = follow;
    }

    fn set_max_redirects(&mut self, max_redirects: usize) {
        self.options.max_redirects = max_redirects;
    }

    fn set_post_redirect_replay(&mut self, replay: bool) {
        self.options.post_redirect_replay = replay;
    }

    fn set_verify_peer(&mut self, verify: bool) {
        self.options.verify_peer = verify;
    }

    fn set_verify_host(&mut self, verify: bool) {
        self.options.verify_host = verify;
    }

    fn set_ca_bundle(&mut self, path: &Path) {
        self.options.ca_bundle = Some(path.to_owned());
    }

    fn set_ca_directory(&mut self, path: &Path) {
        self.options.ca_directory = Some(path.to_owned());
    }

    fn set_crl_file(&mut self, path: &Path) {
        self.options.crl_file = Some(path.to_owned());
    }

    fn set_http_version(&mut self, version: HttpVersion) {
        self.options.http_version = version;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.options.timeout = (!timeout.is_zero()).then_some(timeout);
    }

    fn set_connect_timeout(&mut self, timeout: Duration) {
        self.options.connect_timeout = (!timeout.is_zero()).then_some(timeout);
    }

    fn set_post_body(&mut self, body: Bytes) {
        self.options.post_body = Some(body);
    }

    fn set_form(&mut self, form: FormPayload) {
        self.options.form = Some(form);
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.options.headers.push((name.to_owned(), value.to_owned()));
    }

    fn set_accept_encoding(&mut self, encodings: &str) {
        self.options.accept_encoding = Some(encodings.to_owned());
    }

    fn set_no_signal(&mut self, _no_signal: bool) {}

    fn set_upload(&mut self, upload: bool) {
        self.options.upload = upload;
    }

    fn set_upload_size(&mut self, size: u64) {
        self.options.upload_size = Some(size);
    }

    fn set_no_body(&mut self, no_body: bool) {
        self.options.no_body = no_body;
    }

    fn set_read_function(&mut self, callback: ReadCallback) {
        lock_unpoisoned(&self.callbacks).read_function = Some(callback);
    }

    fn set_header_function(&mut self, callback: HeaderCallback) {
        lock_unpoisoned(&self.callbacks).header_function = Some(callback);
    }

    fn set_body_sink(&mut self, sink: ResponseSink) {
        lock_unpoisoned(&self.callbacks).body_sink = Some(sink);
    }

    fn async_perform(&mut self, handler: CompletionHandler) {
        let guard = CompletionGuard::new(handler);
        lock_unpoisoned(&self.outcome).time_to_start = None;
        let options = self.options.clone();
        let callbacks = Arc::clone(&self.callbacks);
        let outcome = Arc::clone(&self.outcome);
        let cancel = self.cancel.clone();

        self.reactor.spawn_task(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransferError::cancelled()),
                result = run_transfer(options, callbacks, outcome) => result,
            };
            guard.complete(result.err());
        });
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn timings(&self) -> TransferTimings {
        TransferTimings {
            time_to_start: lock_unpoisoned(&self.outcome).time_to_start,
        }
    }

    fn effective_url(&self) -> String {
        let effective = lock_unpoisoned(&self.outcome).effective_url.clone();
        if effective.is_empty() {
            self.options.url.clone().unwrap_or_default()
        } else {
            effective
        }
    }

    fn response_code(&self) -> u16 {
        lock_unpoisoned(&self.outcome).response_code
    }
}

async fn run_transfer(
    options: TransferOptions,
    callbacks: Arc<Mutex<TransferCallbacks>>,
    outcome: Arc<Mutex<TransferOutcome>>,
) -> Result<(), TransferError> {
    let timeout = options.timeout;
    let transfer = perform_hops(options, callbacks, outcome);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, transfer)
            .await
            .unwrap_or_else(|_| Err(TransferError::timeout(limit))),
        None => transfer.await,
    }
}

async fn perform_hops(
    options: TransferOptions,
    callbacks: Arc<Mutex<TransferCallbacks>>,
    outcome: Arc<Mutex<TransferOutcome>>,
) -> Result<(), TransferError> {
    let url = options
        .url
        .clone()
        .ok_or_else(|| TransferError::new(TransferErrorKind::Other, "no url configured"))?;
    let mut current_uri: Uri = url
        .parse()
        .map_err(|error| TransferError::new(TransferErrorKind::Other, format!("invalid url {url}: {error}")))?;

    let mut current_method = effective_method(&options)?;
    let mut body = request_body(&options, &callbacks);
    let client = build_client(&options)?;
    let started = Instant::now();
    let mut hops = 0_usize;

    loop {
        let request = build_request(&options, &current_method, &current_uri, body.clone())?;
        debug!(
            target: "reqflow::engine",
            method = %current_method,
            uri = %current_uri,
            hop = hops,
            "dispatching transfer"
        );

        let response = client
            .request(request)
            .await
            .map_err(|error| classify_dispatch_error(&error))?;
        let (parts, incoming) = response.into_parts();

        {
            let mut outcome = lock_unpoisoned(&outcome);
            if outcome.time_to_start.is_none() {
                outcome.time_to_start = Some(started.elapsed());
            }
            outcome.effective_url = current_uri.to_string();
            outcome.response_code = parts.status.as_u16();
        }
        dispatch_headers(&callbacks, parts.version, parts.status, &parts.headers);

        // A redirect status without a location header is surfaced as the
        // final response rather than an error.
        if options.follow_location
            && is_redirect_status(parts.status)
            && let Some(location) = parts
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
        {
            if hops >= options.max_redirects {
                return Err(TransferError::new(
                    TransferErrorKind::Other,
                    format!("maximum redirect count ({}) exceeded", options.max_redirects),
                ));
            }
            let next_uri = resolve_redirect_uri(&current_uri, location).ok_or_else(|| {
                TransferError::new(
                    TransferErrorKind::Protocol,
                    format!("invalid redirect location {location}"),
                )
            })?;
            let next_method =
                redirect_method(&current_method, parts.status, options.post_redirect_replay);
            if next_method != current_method {
                body = Bytes::new();
            }
            // The redirect hop's body is discarded along with the stream.
            drop(incoming);
            current_uri = next_uri;
            current_method = next_method;
            hops += 1;
            continue;
        }

        if options.no_body {
            drop(incoming);
            return Ok(());
        }
        return read_body_into_sink(incoming, &parts.headers, &callbacks).await;
    }
}

fn effective_method(options: &TransferOptions) -> Result<Method, TransferError> {
    match &options.custom_verb {
        Some(verb) => Method::from_bytes(verb.as_bytes()).map_err(|error| {
            TransferError::new(
                TransferErrorKind::Other,
                format!("invalid method verb {verb}: {error}"),
            )
        }),
        None => Ok(options.method.clone()),
    }
}

/// Upload data takes precedence, then the multipart form, then a plain post
/// body. Upload data is pulled through the read callback in engine-sized
/// chunks and buffered so redirects can replay it.
fn request_body(options: &TransferOptions, callbacks: &Mutex<TransferCallbacks>) -> Bytes {
    if options.upload
        && let Some(drained) = drain_upload(callbacks, options.upload_size)
    {
        return drained;
    }
    if let Some(form) = &options.form {
        return form.body().clone();
    }
    options.post_body.clone().unwrap_or_default()
}

fn drain_upload(callbacks: &Mutex<TransferCallbacks>, size_hint: Option<u64>) -> Option<Bytes> {
    let mut callbacks = lock_unpoisoned(callbacks);
    let read_function = callbacks.read_function.as_mut()?;
    let mut collected = BytesMut::with_capacity(size_hint.unwrap_or(0).min(1 << 20) as usize);
    let mut chunk = [0_u8; 16 * 1024];
    loop {
        let count = read_function(&mut chunk);
        if count == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..count]);
    }
    Some(collected.freeze())
}

fn build_request(
    options: &TransferOptions,
    method: &Method,
    uri: &Uri,
    body: Bytes,
) -> Result<http::Request<Full<Bytes>>, TransferError> {
    let mut builder = http::Request::builder().method(method.clone()).uri(uri.clone());
    match options.http_version {
        HttpVersion::Http10 => builder = builder.version(Version::HTTP_10),
        HttpVersion::Http11 => builder = builder.version(Version::HTTP_11),
        HttpVersion::Default | HttpVersion::Http2 => {}
    }
    for (name, value) in &options.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(encodings) = &options.accept_encoding {
        builder = builder.header(ACCEPT_ENCODING, encodings.as_str());
    }
    if let Some(form) = &options.form {
        builder = builder.header(CONTENT_TYPE, form.content_type());
    }
    builder
        .body(Full::new(body))
        .map_err(|error| TransferError::new(TransferErrorKind::Other, format!("failed to build request: {error}")))
}

async fn read_body_into_sink(
    mut incoming: hyper::body::Incoming,
    headers: &http::HeaderMap,
    callbacks: &Mutex<TransferCallbacks>,
) -> Result<(), TransferError> {
    let sink = lock_unpoisoned(callbacks).body_sink.clone();
    let mut writer = sink.map(|sink| BodyWriter::for_headers(headers, sink));

    while let Some(frame) = incoming.frame().await {
        let frame = frame.map_err(|error| classify_body_error(&error))?;
        if let Some(data) = frame.data_ref()
            && let Some(writer) = writer.as_mut()
        {
            writer.write_all(data)?;
        }
    }
    if let Some(writer) = writer {
        writer.finish()?;
    }
    Ok(())
}

/// Streams body bytes into the response sink, transparently decoding the
/// content encodings the engine advertises.
enum BodyWriter {
    Plain(ResponseSink),
    Gzip(flate2::write::GzDecoder<ResponseSink>),
    Deflate(flate2::write::ZlibDecoder<ResponseSink>),
}

impl BodyWriter {
    fn for_headers(headers: &http::HeaderMap, sink: ResponseSink) -> Self {
        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_ascii_lowercase());
        match encoding.as_deref() {
            Some("gzip") | Some("x-gzip") => Self::Gzip(flate2::write::GzDecoder::new(sink)),
            Some("deflate") => Self::Deflate(flate2::write::ZlibDecoder::new(sink)),
            _ => Self::Plain(sink),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let written = match self {
            Self::Plain(sink) => sink.write_all(data),
            Self::Gzip(decoder) => decoder.write_all(data),
            Self::Deflate(decoder) => decoder.write_all(data),
        };
        written.map_err(decode_error)
    }

    fn finish(self) -> Result<(), TransferError> {
        match self {
            Self::Plain(_) => Ok(()),
            Self::Gzip(decoder) => decoder.finish().map(drop).map_err(decode_error),
            Self::Deflate(decoder) => decoder.finish().map(drop).map_err(decode_error),
        }
    }
}

fn decode_error(error: io::Error) -> TransferError {
    TransferError::new(
        TransferErrorKind::Protocol,
        format!("failed to decode response body: {error}"),
    )
}

fn dispatch_headers(
    callbacks: &Mutex<TransferCallbacks>,
    version: Version,
    status: StatusCode,
    headers: &http::HeaderMap,
) {
    let mut callbacks = lock_unpoisoned(callbacks);
    let Some(header_function) = callbacks.header_function.as_mut() else {
        return;
    };

    let mut status_line = format!("{version:?} {status}\r\n").into_bytes();
    header_function(&mut status_line);

    for (name, value) in headers {
        let mut line = Vec::with_capacity(name.as_str().len() + value.len() + 4);
        line.extend_from_slice(name.as_str().as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        line.extend_from_slice(b"\r\n");
        header_function(&mut line);
    }

    let mut terminator = b"\r\n".to_vec();
    header_function(&mut terminator);
}

fn classify_dispatch_error(error: &hyper_util::client::legacy::Error) -> TransferError {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut parse_error = false;
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>()
            && hyper_error.is_parse()
        {
            parse_error = true;
        }
        text.push(' ');
        text.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }

    let kind = if parse_error {
        TransferErrorKind::Protocol
    } else {
        classify_transport_error_text(&text, error.is_connect())
    };
    TransferError::new(kind, error.to_string())
}

fn classify_body_error(error: &hyper::Error) -> TransferError {
    let kind = if error.is_parse() {
        TransferErrorKind::Protocol
    } else {
        TransferErrorKind::Read
    };
    TransferError::new(kind, error.to_string())
}

fn build_client(options: &TransferOptions) -> Result<HyperClient, TransferError> {
    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);
    http_connector.set_connect_timeout(options.connect_timeout);

    let tls_config = build_tls_config(options)?;
    let https_builder = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http();
    let connector = match options.http_version {
        HttpVersion::Http2 => https_builder.enable_http2().wrap_connector(http_connector),
        _ => https_builder.enable_http1().wrap_connector(http_connector),
    };

    let mut builder = hyper_util::client::legacy::Client::builder(TokioExecutor::new());
    if options.http_version == HttpVersion::Http2 {
        builder.http2_only(true);
    }
    Ok(builder.build(connector))
}

fn build_tls_config(options: &TransferOptions) -> Result<rustls::ClientConfig, TransferError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|error| tls_error(format!("unsupported protocol versions: {error}")))?;

    if !(options.verify_peer && options.verify_host) {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
            .with_no_client_auth());
    }

    let roots = build_root_store(options)?;
    let config = match &options.crl_file {
        Some(crl_path) => {
            let crls = load_crls(crl_path)?;
            let verifier = rustls::client::WebPkiServerVerifier::builder_with_provider(
                Arc::new(roots),
                provider,
            )
            .with_crls(crls)
            .build()
            .map_err(|error| tls_error(format!("failed to build certificate verifier: {error}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth()
        }
        None => builder.with_root_certificates(roots).with_no_client_auth(),
    };
    Ok(config)
}

fn build_root_store(options: &TransferOptions) -> Result<rustls::RootCertStore, TransferError> {
    let mut roots = rustls::RootCertStore::empty();
    let mut custom_material = false;

    if let Some(path) = &options.ca_bundle {
        let certificates = load_certificates(path)?;
        roots.add_parsable_certificates(certificates);
        custom_material = true;
    }
    if let Some(directory) = &options.ca_directory {
        for path in certificate_paths(directory)? {
            let certificates = load_certificates(&path)?;
            roots.add_parsable_certificates(certificates);
        }
        custom_material = true;
    }
    if custom_material && roots.is_empty() {
        return Err(tls_error("configured trust material contains no usable certificates"));
    }
    if !custom_material {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(roots)
}

fn certificate_paths(directory: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let entries = std::fs::read_dir(directory).map_err(|error| {
        tls_error(format!(
            "failed to read ca directory {}: {error}",
            directory.display()
        ))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|error| tls_error(format!("failed to read ca directory entry: {error}")))?;
        let path = entry.path();
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(str::to_ascii_lowercase);
        if matches!(extension.as_deref(), Some("pem") | Some("crt") | Some("cer")) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransferError> {
    let file = File::open(path)
        .map_err(|error| tls_error(format!("failed to open {}: {error}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| tls_error(format!("failed to parse {}: {error}", path.display())))
}

fn load_crls(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateRevocationListDer<'static>>, TransferError> {
    let file = File::open(path)
        .map_err(|error| tls_error(format!("failed to open {}: {error}", path.display())))?;
    rustls_pemfile::crls(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| tls_error(format!("failed to parse {}: {error}", path.display())))
}

fn tls_error(message: impl Into<String>) -> TransferError {
    TransferError::new(TransferErrorKind::Tls, message)
}

/// Accepts any server certificate. Installed only when the request opted out
/// of peer and hostname verification.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
