// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Request-head intake: just enough HTTP/1.x parsing to drive the body
//! pipeline.
//!
//! [`httparse`] handles the request line and headers; this module distills
//! the body-relevant metadata: `Content-Length`, `Transfer-Encoding`
//! (chunked wins when both are present), and `Expect: 100-continue`.
//! Response generation is out of scope - only bare status lines are ever
//! written back (the `100 Continue` interim response and finalization).

use std::time::Instant;

use crate::{core::buf::ReadBuf, http::body::RequestBody};

/// Max header count accepted before the request is rejected.
pub const MAX_HEADERS: usize = 64;

/// Per-request state. Owned by the connection slot.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub minor_version: u8,
    /// Declared `Content-Length`, or −1 when absent. For chunked bodies
    /// this becomes the received byte count once the body completes.
    pub content_length_n: i64,
    pub chunked: bool,
    pub has_expect_continue: bool,
    /// The `100 Continue` interim response was already attempted.
    pub expect_tested: bool,
    /// Holds the bytes read past the head (the pre-read body part).
    pub header_buf: ReadBuf,
    pub body: Option<RequestBody>,
    pub discard_body: bool,
    /// Close via the lingering-read phase instead of an immediate close.
    pub lingering_close: bool,
    /// Absolute bound on the lingering phase.
    pub lingering_deadline: Option<Instant>,
    /// Total bytes of this request consumed from the socket.
    pub request_length: u64,
}

impl Request {
    fn new(header_buf: ReadBuf) -> Self {
        Self {
            method: String::new(),
            path: String::new(),
            minor_version: 0,
            content_length_n: -1,
            chunked: false,
            has_expect_continue: false,
            expect_tested: false,
            header_buf,
            body: None,
            discard_body: false,
            lingering_close: false,
            lingering_deadline: None,
            request_length: 0,
        }
    }
}

/// Outcome of one head-parse attempt.
#[derive(Debug)]
pub enum HeadStatus {
    /// Head complete; `header_buf.pos` sits on the first body byte.
    Complete(Box<Request>),
    /// Need more bytes.
    Partial,
}

/// Malformed request head (maps to HTTP 400).
#[derive(Debug, thiserror::Error)]
#[error("client sent an invalid request head")]
pub struct InvalidHead;

/// Try to parse a complete request head out of `header_buf`.
///
/// On success the buffer is consumed up to the end of the head and moved
/// into the returned [`Request`], pre-read body bytes included.
///
/// # Errors
///
/// Returns [`InvalidHead`] on malformed input; the connection is finalized
/// with `400`.
pub fn parse_request_head(header_buf: &mut ReadBuf) -> Result<HeadStatus, InvalidHead> {
    let (consumed, mut request) = {
        let data = header_buf.data();
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&data) {
            Ok(httparse::Status::Complete(n)) => {
                let mut r = Request::new(ReadBuf::with_capacity(0));
                r.method = parsed.method.unwrap_or_default().to_string();
                r.path = parsed.path.unwrap_or_default().to_string();
                r.minor_version = parsed.version.unwrap_or(0);

                for h in parsed.headers.iter() {
                    if h.name.eq_ignore_ascii_case("content-length") {
                        let v = std::str::from_utf8(h.value).map_err(|_| InvalidHead)?;
                        r.content_length_n = v.trim().parse().map_err(|_| InvalidHead)?;
                    } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                        let v = std::str::from_utf8(h.value).map_err(|_| InvalidHead)?;
                        if v.trim().eq_ignore_ascii_case("chunked") {
                            r.chunked = true;
                        } else {
                            return Err(InvalidHead);
                        }
                    } else if h.name.eq_ignore_ascii_case("expect") {
                        let v = std::str::from_utf8(h.value).map_err(|_| InvalidHead)?;
                        if v.trim().eq_ignore_ascii_case("100-continue") {
                            r.has_expect_continue = true;
                        }
                    }
                }
                (n, r)
            }
            Ok(httparse::Status::Partial) => return Ok(HeadStatus::Partial),
            Err(_) => return Err(InvalidHead),
        }
    };

    header_buf.pos += consumed;
    request.request_length = consumed as u64;

    // The request takes the buffer with it; the pre-read tail (if any)
    // feeds the body pipeline.
    request.header_buf = std::mem::replace(header_buf, ReadBuf::with_capacity(0));

    Ok(HeadStatus::Complete(Box::new(request)))
}

/// Reason phrase for the status codes the core emits.
#[must_use]
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        400 => "Bad Request",
        408 => "Request Time-out",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// A bare status-line response (header section only).
#[must_use]
pub fn status_line(code: u16) -> String {
    format!(
        "HTTP/1.1 {code} {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        reason_phrase(code)
    )
}

/// The interim response for `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
