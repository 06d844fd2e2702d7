use std::sync::Mutex;

use http::{Method, StatusCode, Uri};

use crate::transfer::TransferErrorKind;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Method to use after a redirect. 303 always downgrades to GET; 301/302
/// downgrade POST to GET unless post-redirect replay is enabled.
pub(crate) fn redirect_method(method: &Method, status: StatusCode, post_replay: bool) -> Method {
    match status {
        StatusCode::SEE_OTHER if *method != Method::HEAD => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
            if *method == Method::POST && !post_replay =>
        {
            Method::GET
        }
        _ => method.clone(),
    }
}

pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    if !joined.username().is_empty() || joined.password().is_some() {
        return None;
    }
    joined.as_str().parse().ok()
}

/// Classifies a transport failure by its error-chain text. The transfer
/// library does not expose typed causes past the top level, so the markers
/// below cover the connector, resolver, and TLS layers it composes.
pub(crate) fn classify_transport_error_text(
    text: &str,
    is_connect_path: bool,
) -> TransferErrorKind {
    const DNS_MARKERS: &[&str] = &[
        "name or service not known",
        "failed to lookup address",
        "no such host",
        "temporary failure in name resolution",
        "nodename nor servname provided",
        "dns lookup failed",
    ];
    const TLS_MARKERS: &[&str] = &[
        "tls handshake",
        "certificate verify",
        "certificate unknown",
        "invalid certificate",
        "self signed certificate",
        "x509",
        "pkix",
        "peer certificate",
    ];
    const CONNECT_MARKERS: &[&str] = &[
        "connection refused",
        "connection aborted",
        "not connected",
        "network unreachable",
        "host unreachable",
        "connect error",
        "timed out while connecting",
        "connect timeout",
    ];
    const READ_MARKERS: &[&str] = &[
        "connection reset",
        "unexpected eof",
        "incomplete message",
        "connection closed before message completed",
    ];
    const WRITE_MARKERS: &[&str] = &["broken pipe", "body write aborted"];

    if contains_marker(text, DNS_MARKERS) || contains_word(text, "dns") {
        return TransferErrorKind::Dns;
    }
    if contains_marker(text, TLS_MARKERS)
        || contains_word(text, "tls")
        || contains_word(text, "ssl")
        || contains_word(text, "certificate")
    {
        return TransferErrorKind::Tls;
    }
    if contains_marker(text, CONNECT_MARKERS) {
        return TransferErrorKind::Connect;
    }
    if contains_marker(text, WRITE_MARKERS) {
        return TransferErrorKind::Write;
    }
    if contains_marker(text, READ_MARKERS) {
        return TransferErrorKind::Read;
    }
    if is_connect_path {
        return TransferErrorKind::Connect;
    }
    TransferErrorKind::Other
}

fn contains_marker(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| text.contains(marker))
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|character: char| !character.is_ascii_alphanumeric())
        .any(|token| token == word)
}
