// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The discard path: drain and drop a request body nobody asked for.
//!
//! An independent walk that reads into a fixed stack buffer and advances
//! the length/chunk counters without storing anything. Incomplete reads
//! leave `discard_body` set; the worker re-arms the read event with the
//! lingering timeout and resumes via
//! [`crate::conn::HandlerKind::DiscardRequestBody`].

use std::io::{Read, Write};

use tracing::debug;

use crate::http::{body::{BodyError, BodyProgress, DISCARD_BUFFER_SIZE, RequestBody},
                  chunked::{self, ChunkStatus, ChunkedState},
                  request::Request};

/// Start (or short-circuit) discarding the request body.
///
/// On [`BodyProgress::Again`] the caller installs the discard handler,
/// marks `discard_body`, and keeps the connection readable until the walk
/// completes or the lingering clock expires.
///
/// # Errors
///
/// Propagates protocol violations ([`BodyError::InvalidChunked`]) so the
/// caller can finalize with `400`.
pub fn discard_request_body<IO: Read + Write>(
    r: &mut Request,
    io: &mut IO,
) -> Result<BodyProgress, BodyError> {
    if r.discard_body || r.body.is_some() {
        return Ok(BodyProgress::Complete);
    }

    test_expect_for_discard(r, io);

    debug!("http set discard body");

    if r.content_length_n <= 0 && !r.chunked {
        return Ok(BodyProgress::Complete);
    }

    if r.header_buf.len() > 0 || r.chunked {
        discard_preread(r)?;
        if r.content_length_n == 0 {
            return Ok(BodyProgress::Complete);
        }
    }

    match read_discarded_body(r, io)? {
        BodyProgress::Complete => {
            r.lingering_close = false;
            Ok(BodyProgress::Complete)
        }
        BodyProgress::Again => {
            r.discard_body = true;
            Ok(BodyProgress::Again)
        }
    }
}

/// The resumable drain: read into a stack buffer, feed the discarding
/// filter, until the counters hit zero or the socket runs dry.
///
/// # Errors
///
/// Propagates [`BodyError::InvalidChunked`]; socket errors and EOF count
/// as completion (the connection is already doomed).
pub fn read_discarded_body<R: Read>(
    r: &mut Request,
    io: &mut R,
) -> Result<BodyProgress, BodyError> {
    debug!("http read discarded body");

    let mut buffer = [0u8; DISCARD_BUFFER_SIZE];
    loop {
        if r.content_length_n == 0 {
            return Ok(BodyProgress::Complete);
        }

        let size = (r.content_length_n as u64).min(DISCARD_BUFFER_SIZE as u64) as usize;
        let n = match io.read(&mut buffer[..size]) {
            Ok(0) => return Ok(BodyProgress::Complete),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Ok(BodyProgress::Again);
            }
            Err(_) => return Ok(BodyProgress::Complete),
        };

        discard_window(r, &buffer[..n])?;
    }
}

/// Feed the pre-read tail left in the header buffer through the
/// discarding filter.
fn discard_preread(r: &mut Request) -> Result<(), BodyError> {
    if r.chunked {
        ensure_discard_state(r);
        let hb_len = r.header_buf.len();
        if hb_len == 0 {
            // Nothing pre-read; just prime the counter estimate.
            r.content_length_n = r.content_length_n.max(3);
            return Ok(());
        }
        let window: Vec<u8> = r.header_buf.data().to_vec();
        let mut pos = 0usize;
        let state = r
            .body
            .as_mut()
            .expect("discard state ensured")
            .chunked
            .as_mut()
            .expect("discard state ensured");
        let remaining = discard_chunked(state, &window, &mut pos)?;
        r.header_buf.pos += pos;
        r.content_length_n = remaining;
    } else {
        let take = (r.header_buf.len() as i64).min(r.content_length_n) as usize;
        r.header_buf.pos += take;
        r.content_length_n -= take as i64;
    }
    Ok(())
}

fn discard_window(r: &mut Request, window: &[u8]) -> Result<(), BodyError> {
    if r.chunked {
        ensure_discard_state(r);
        let mut pos = 0usize;
        let state = r
            .body
            .as_mut()
            .expect("discard state ensured")
            .chunked
            .as_mut()
            .expect("discard state ensured");
        let remaining = discard_chunked(state, window, &mut pos)?;
        r.content_length_n = remaining;
    } else {
        let size = window.len() as i64;
        r.content_length_n = (r.content_length_n - size).max(0);
    }
    Ok(())
}

/// Advance the chunked decoder over `data`, skipping payload in place.
/// Returns the updated "bytes still wanted" counter (0 when done).
fn discard_chunked(
    state: &mut ChunkedState,
    data: &[u8],
    pos: &mut usize,
) -> Result<i64, BodyError> {
    loop {
        let status =
            chunked::parse(state, data, pos).map_err(|_| BodyError::InvalidChunked)?;
        match status {
            ChunkStatus::Chunk => {
                let avail = (data.len() - *pos).min(state.size as usize);
                *pos += avail;
                state.size -= avail as u64;
                if *pos == data.len() {
                    return Ok(state.length.max(1) as i64);
                }
            }
            ChunkStatus::Done => return Ok(0),
            ChunkStatus::Again => return Ok(state.length.max(1) as i64),
        }
    }
}

/// The discard path still answers `Expect: 100-continue`, best-effort.
fn test_expect_for_discard<W: Write>(r: &mut Request, io: &mut W) {
    if r.expect_tested || !r.has_expect_continue || r.minor_version < 1 {
        return;
    }
    r.expect_tested = true;
    let _ = io.write(crate::http::request::CONTINUE_RESPONSE);
}

fn ensure_discard_state(r: &mut Request) {
    let rb = r.body.get_or_insert_with(|| RequestBody::new(None));
    if rb.chunked.is_none() {
        rb.chunked = Some(ChunkedState::default());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{core::buf::ReadBuf,
                http::request::{HeadStatus, parse_request_head}};

    #[derive(Debug, Default)]
    struct MockConn {
        data: Vec<u8>,
        pos: usize,
        eof: bool,
    }

    impl Read for MockConn {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.data.len() - self.pos);
            if n == 0 {
                if self.eof {
                    return Ok(0);
                }
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for MockConn {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn request_for(head_and_preread: &[u8]) -> Request {
        let mut hb = ReadBuf::from_bytes(head_and_preread, 4096);
        match parse_request_head(&mut hb).unwrap() {
            HeadStatus::Complete(r) => *r,
            HeadStatus::Partial => panic!("test head must be complete"),
        }
    }

    #[test]
    fn test_discard_length_body() {
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 8\r\n\r\nabc");
        let mut io = MockConn {
            data: b"defgh".to_vec(),
            ..MockConn::default()
        };

        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
        assert_eq!(r.content_length_n, 0);
        assert!(!r.discard_body);
    }

    #[test]
    fn test_discard_incomplete_body_returns_again() {
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 8\r\n\r\n");
        let mut io = MockConn {
            data: b"abc".to_vec(),
            ..MockConn::default()
        };

        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Again);
        assert!(r.discard_body);
        assert_eq!(r.content_length_n, 5);

        // More bytes arrive; the worker resumes the walk.
        io.data.extend_from_slice(b"defgh");
        let progress = read_discarded_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
        assert_eq!(r.content_length_n, 0);
    }

    #[test]
    fn test_discard_chunked_body() {
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut io = MockConn {
            data: b"5\r\nhello\r\n0\r\n\r\n".to_vec(),
            ..MockConn::default()
        };

        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
        assert_eq!(r.content_length_n, 0);
    }

    #[test]
    fn test_discard_chunked_preread() {
        let mut r = request_for(
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        );
        let mut io = MockConn::default();

        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
    }

    #[test]
    fn test_discard_invalid_chunked_rejects() {
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut io = MockConn {
            data: b"not-hex\r\n".to_vec(),
            ..MockConn::default()
        };

        let err = discard_request_body(&mut r, &mut io).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_discard_after_body_read_is_noop() {
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\n");
        r.body = Some(RequestBody::new(None));
        let mut io = MockConn::default();

        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
    }

    #[test]
    fn test_discard_no_body() {
        let mut r = request_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut io = MockConn::default();
        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
    }

    #[test]
    fn test_eof_during_discard_completes() {
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 50\r\n\r\n");
        let mut io = MockConn {
            data: b"short".to_vec(),
            eof: true,
            ..MockConn::default()
        };

        let progress = discard_request_body(&mut r, &mut io).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
    }
}
