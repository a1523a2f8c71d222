//! Owned, decoded form of a captured plaintext record
//!
//! Records arrive from the channel as raw bytes laid out as
//! [`CapturedEvent`]. Decoding checks the length, copies the record out with
//! an unaligned read and keeps only the captured part of the payload.

use crate::content::{carries_json, ContentKind};
use crate::error::DecodeError;
use serde::{Serialize, Serializer};
use std::fmt;
use tlstap_common::{CallKind, CapturedEvent, COMM_LEN, MAX_CAPTURE};

/// Direction of the plaintext relative to the traced process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// SSL_read: plaintext received
    Read,
    /// SSL_write: plaintext sent
    Write,
}

impl From<CallKind> for Direction {
    fn from(kind: CallKind) -> Self {
        match kind {
            CallKind::Read => Direction::Read,
            CallKind::Write => Direction::Write,
        }
    }
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "READ",
            Direction::Write => "WRITE",
        }
    }
}

/// One plaintext capture, detached from the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SslCapture {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u64,
    pub uid: u32,
    pub comm: String,
    pub direction: Direction,
    /// Bytes the call reported
    pub byte_len: i32,
    /// Bytes the caller asked for
    pub requested_len: i32,
    /// What the captured bytes look like
    pub content: ContentKind,
    /// JSON media type or body, see [`carries_json`]
    pub json: bool,
    /// Captured bytes (at most `MAX_CAPTURE`)
    #[serde(serialize_with = "serialize_hex")]
    pub data: Vec<u8>,
}

impl SslCapture {
    /// Decode a raw record drained from the event channel
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < CapturedEvent::SIZE {
            return Err(DecodeError::TooShort {
                got: bytes.len(),
                expected: CapturedEvent::SIZE,
            });
        }

        // SAFETY: length checked above, every field of CapturedEvent accepts
        // any bit pattern, and read_unaligned has no alignment requirement.
        let event: CapturedEvent =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const CapturedEvent) };
        Self::from_event(&event)
    }

    /// Copy a record out of its channel slot
    pub fn from_event(event: &CapturedEvent) -> Result<Self, DecodeError> {
        let kind = event
            .call_kind()
            .ok_or(DecodeError::UnknownKind(event.kind))?;

        if event.captured_len as usize > MAX_CAPTURE
            || event.byte_len <= 0
            || event.captured_len as i64 > event.byte_len as i64
        {
            return Err(DecodeError::BadLength {
                captured: event.captured_len,
                reported: event.byte_len,
            });
        }

        let data = event.captured().to_vec();
        Ok(Self {
            timestamp_ns: event.timestamp_ns,
            pid: event.pid,
            tid: event.tid,
            uid: event.uid,
            comm: comm_str(&event.comm),
            direction: kind.into(),
            byte_len: event.byte_len,
            requested_len: event.requested_len,
            content: ContentKind::classify(&data),
            json: carries_json(&data),
            data,
        })
    }

    /// Whether the call moved more bytes than were captured
    pub fn is_truncated(&self) -> bool {
        self.byte_len as usize > self.data.len()
    }

    /// Short printable rendering of the payload
    pub fn preview(&self) -> String {
        format_data_preview(&self.data)
    }
}

impl fmt::Display for SslCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[SSL_{}] pid={} tid={} comm={} len={}/{} {}{} {}",
            self.direction.as_str(),
            self.pid,
            self.tid,
            self.comm,
            self.data.len(),
            self.byte_len,
            self.content,
            if self.json && self.content != ContentKind::Json { "+json" } else { "" },
            self.preview(),
        )
    }
}

/// Format process comm name (null-terminated bytes to string)
pub fn comm_str(comm: &[u8; COMM_LEN]) -> String {
    let end = comm.iter().position(|&c| c == 0).unwrap_or(COMM_LEN);
    String::from_utf8_lossy(&comm[..end]).to_string()
}

/// Characters of text shown before the preview is cut
const PREVIEW_CHARS: usize = 96;
/// Bytes of binary payload shown as hex
const PREVIEW_BYTES: usize = 24;

/// Short printable rendering of a payload: an escaped, quoted excerpt for
/// text, `hex:` and the leading bytes otherwise
pub fn format_data_preview(data: &[u8]) -> String {
    if data.is_empty() {
        return String::from("(no data)");
    }

    if ContentKind::classify(data) == ContentKind::Binary {
        let shown = &data[..data.len().min(PREVIEW_BYTES)];
        let cut = if shown.len() < data.len() { "..." } else { "" };
        return format!("hex:{}{}", hex::encode(shown), cut);
    }

    let text = String::from_utf8_lossy(data);
    let mut chars = text.chars();
    let excerpt: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    let cut = if chars.next().is_some() { "..." } else { "" };
    format!("{:?}{}", excerpt, cut)
}

fn serialize_hex<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_event(kind: CallKind, payload: &[u8], byte_len: i32) -> CapturedEvent {
        let mut event = CapturedEvent::zeroed();
        event.timestamp_ns = 1_000;
        event.pid = 4242;
        event.tid = 4243;
        event.uid = 1000;
        event.kind = kind as u8;
        event.byte_len = byte_len;
        event.captured_len = payload.len() as u32;
        event.requested_len = 16384;
        event.comm[..4].copy_from_slice(b"curl");
        event.payload[..payload.len()].copy_from_slice(payload);
        event
    }

    fn as_bytes(event: &CapturedEvent) -> &[u8] {
        // SAFETY: CapturedEvent is repr(C) plain data
        unsafe {
            std::slice::from_raw_parts(
                event as *const CapturedEvent as *const u8,
                CapturedEvent::SIZE,
            )
        }
    }

    #[test]
    fn test_decode_from_ring_bytes() {
        let event = raw_event(CallKind::Write, b"GET / HTTP/1.1\r\n", 16);
        // Offset by one byte to exercise the unaligned read
        let mut buf = vec![0u8; CapturedEvent::SIZE + 1];
        buf[1..].copy_from_slice(as_bytes(&event));

        let capture = SslCapture::from_bytes(&buf[1..]).unwrap();
        assert_eq!(capture.pid, 4242);
        assert_eq!(capture.tid, 4243);
        assert_eq!(capture.comm, "curl");
        assert_eq!(capture.direction, Direction::Write);
        assert_eq!(capture.data, b"GET / HTTP/1.1\r\n");
        assert!(!capture.is_truncated());
    }

    #[test]
    fn test_decode_short_record() {
        let err = SslCapture::from_bytes(&[0u8; 16]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooShort {
                got: 16,
                expected: CapturedEvent::SIZE
            }
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut event = raw_event(CallKind::Read, b"x", 1);
        event.kind = 9;
        assert_eq!(
            SslCapture::from_event(&event).unwrap_err(),
            DecodeError::UnknownKind(9)
        );
    }

    #[test]
    fn test_decode_rejects_captured_beyond_reported() {
        let event = raw_event(CallKind::Read, b"abcd", 2);
        assert!(matches!(
            SslCapture::from_event(&event),
            Err(DecodeError::BadLength { .. })
        ));
    }

    #[test]
    fn test_truncated_capture_keeps_true_length() {
        let payload = vec![b'a'; MAX_CAPTURE];
        let event = raw_event(CallKind::Read, &payload, 10_000);
        let capture = SslCapture::from_event(&event).unwrap();
        assert_eq!(capture.byte_len, 10_000);
        assert_eq!(capture.data.len(), MAX_CAPTURE);
        assert!(capture.is_truncated());
    }

    #[test]
    fn test_display_text_preview() {
        let event = raw_event(CallKind::Read, b"HTTP/1.1 200 OK\r\n", 17);
        let line = SslCapture::from_event(&event).unwrap().to_string();
        assert_eq!(
            line,
            "[SSL_READ] pid=4242 tid=4243 comm=curl len=17/17 http_response \"HTTP/1.1 200 OK\\r\\n\""
        );
    }

    #[test]
    fn test_display_marks_json_http() {
        let body = b"POST /v1/messages HTTP/1.1\r\nContent-Type: application/json\r\n\r\n{}";
        let event = raw_event(CallKind::Write, body, body.len() as i32);
        let capture = SslCapture::from_event(&event).unwrap();

        assert_eq!(capture.content, ContentKind::HttpRequest);
        assert!(capture.json);
        assert!(capture.to_string().contains(" http_request+json \"POST /v1/messages"));
    }

    #[test]
    fn test_binary_preview_is_hex() {
        assert_eq!(format_data_preview(&[0x16, 0x03, 0x01]), "hex:160301");
        assert_eq!(format_data_preview(&[]), "(no data)");

        let long = [0x00u8; 40];
        assert_eq!(format_data_preview(&long), format!("hex:{}...", "00".repeat(24)));
    }

    #[test]
    fn test_text_preview_is_cut_and_escaped() {
        let text = "a\"b".repeat(50);
        let preview = format_data_preview(text.as_bytes());
        assert!(preview.starts_with("\"a\\\"ba\\\"b"));
        assert!(preview.ends_with("\"..."));
        assert_eq!(preview.matches('a').count(), 32);
    }

    #[test]
    fn test_json_encodes_payload_as_hex() {
        let event = raw_event(CallKind::Write, b"hi", 2);
        let json = serde_json::to_value(SslCapture::from_event(&event).unwrap()).unwrap();
        assert_eq!(json["direction"], "write");
        assert_eq!(json["content"], "text");
        assert_eq!(json["json"], false);
        assert_eq!(json["data"], "6869");
        assert_eq!(json["byte_len"], 2);
    }
}
