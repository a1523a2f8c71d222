//! Classification of captured plaintext
//!
//! A capture is one call's buffer, so an HTTP message shows up as its start
//! line and headers in one capture and possibly its body in later ones.
//! Classification only looks at the bytes it is given.

use serde::de::IgnoredAny;
use serde::Serialize;
use std::fmt;

const HTTP_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

const MAX_HEADERS: usize = 64;

/// What a captured buffer looks like
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Starts with an HTTP/1.x request line
    HttpRequest,
    /// Starts with an HTTP/1.x status line
    HttpResponse,
    /// A complete JSON object or array
    Json,
    /// Other UTF-8 text
    Text,
    Binary,
}

impl ContentKind {
    pub fn classify(data: &[u8]) -> Self {
        if let Some((kind, _)) = parse_http(data) {
            kind
        } else if is_json_document(data) {
            ContentKind::Json
        } else if looks_like_text(data) {
            ContentKind::Text
        } else {
            ContentKind::Binary
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ContentKind::HttpRequest | ContentKind::HttpResponse)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::HttpRequest => "http_request",
            ContentKind::HttpResponse => "http_response",
            ContentKind::Json => "json",
            ContentKind::Text => "text",
            ContentKind::Binary => "binary",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `data` carries JSON.
///
/// For an HTTP message with a complete header block: a JSON media type in
/// `Content-Type` (`application/json` or any `+json` suffix), or a body that
/// parses as JSON. Otherwise the whole buffer must be a JSON object or array.
pub fn carries_json(data: &[u8]) -> bool {
    match parse_http(data) {
        Some((_, Some(message))) => {
            message.content_type.is_some_and(is_json_media_type)
                || (!message.body.is_empty()
                    && serde_json::from_slice::<IgnoredAny>(message.body).is_ok())
        }
        Some((_, None)) => false,
        None => is_json_document(data),
    }
}

/// Parts of an HTTP message whose header block was captured whole
struct HttpMessage<'a> {
    content_type: Option<&'a [u8]>,
    body: &'a [u8],
}

/// Kind of HTTP message `data` starts with. The start line is enough; the
/// headers and body come along only when the header block is complete.
fn parse_http(data: &[u8]) -> Option<(ContentKind, Option<HttpMessage<'_>>)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    if let Ok(status) = request.parse(data) {
        let known_method = request
            .method
            .is_some_and(|method| HTTP_METHODS.iter().any(|known| *known == method));
        if known_method && request.version.is_some() {
            return Some((
                ContentKind::HttpRequest,
                complete_message(status, request.headers, data),
            ));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    if let Ok(status) = response.parse(data) {
        if response.code.is_some() {
            return Some((
                ContentKind::HttpResponse,
                complete_message(status, response.headers, data),
            ));
        }
    }

    None
}

fn complete_message<'a>(
    status: httparse::Status<usize>,
    headers: &[httparse::Header<'a>],
    data: &'a [u8],
) -> Option<HttpMessage<'a>> {
    let httparse::Status::Complete(header_len) = status else {
        return None;
    };
    let content_type = headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("content-type"))
        .map(|header| header.value);
    Some(HttpMessage {
        content_type,
        body: &data[header_len..],
    })
}

fn is_json_media_type(content_type: &[u8]) -> bool {
    let content_type = String::from_utf8_lossy(content_type);
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type == "application/json" || media_type.ends_with("+json")
}

fn is_json_document(data: &[u8]) -> bool {
    matches!(data.trim_ascii_start().first(), Some(b'{' | b'['))
        && serde_json::from_slice::<IgnoredAny>(data).is_ok()
}

/// Valid UTF-8 (a character cut off by the capture limit is allowed) with at
/// most one control character in ten, whitespace aside
fn looks_like_text(data: &[u8]) -> bool {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&data[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return false,
    };

    let (chars, controls) = text.chars().fold((0usize, 0usize), |(chars, controls), c| {
        let control = c.is_control() && !matches!(c, '\t' | '\n' | '\r');
        (chars + 1, controls + usize::from(control))
    });
    chars > 0 && controls * 10 <= chars
}
