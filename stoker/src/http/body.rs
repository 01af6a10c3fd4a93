// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The streaming request-body pipeline.
//!
//! `read_request_body` is the entry point: it feeds any pre-read bytes
//! left in the header buffer through the body filter, sizes a receive
//! buffer, and drives the drain loop until the body completes or the
//! socket runs dry (`Again` - the worker re-arms the read event with the
//! body timeout and resumes here on the next readiness).
//!
//! The filter chain is the original three-stage design:
//!
//! - the **length filter** shadows input windows and counts `rest` down
//!   from `Content-Length`;
//! - the **chunked filter** runs the incremental decoder, enforcing
//!   `client_max_body_size` per parsed chunk;
//! - the **save filter** appends descriptors to `bufs` by reference and,
//!   when the receive buffer fills while the body is incomplete, spills
//!   the accumulated chain to a temp file and rewinds the buffer.
//!
//! Descriptor recycling runs after every filter pass via
//! [`chain_update`]: drained links tagged [`BufTag::RequestBody`] return
//! to the body's `free` chain.

use std::{collections::VecDeque,
          io::{Read, Write},
          path::Path};

use tracing::{debug, info, trace};

use crate::{core::{buf::{Buf, BufData, BufRef, BufTag, ReadBuf, chain_get_free,
                         chain_update},
                   config::Config},
            http::{chunked::{self, ChunkStatus, ChunkedState},
                   request::{CONTINUE_RESPONSE, Request}}};

/// Stack buffer size for the discard path.
pub const DISCARD_BUFFER_SIZE: usize = 4096;

/// How far the pipeline got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyProgress {
    /// Body complete; the caller runs the post action exactly once.
    Complete,
    /// Socket dry; the caller re-arms the read event and the body timer.
    Again,
}

/// What to do once the body has been read. Stored in the body record so a
/// resumed drain loop can finish the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    /// Finalize the request with this status.
    Respond(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("client sent invalid chunked body")]
    InvalidChunked,
    #[error("client intended to send too large body: {declared} bytes")]
    TooLarge { declared: u64 },
    #[error("client prematurely closed connection")]
    PrematureClose,
    #[error("reading request body failed: {0}")]
    Recv(std::io::Error),
    #[error("request body I/O failed: {0}")]
    Io(std::io::Error),
    #[error("request body state error: {0}")]
    Internal(&'static str),
}

impl BodyError {
    /// The HTTP status this error finalizes the request with.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidChunked | Self::PrematureClose | Self::Recv(_) => 400,
            Self::TooLarge { .. } => 413,
            Self::Io(_) | Self::Internal(_) => 500,
        }
    }
}

/// The spill file: lazily created on first overflow, append-only.
#[derive(Debug)]
pub struct SpillFile {
    file: tempfile::NamedTempFile,
    pub offset: u64,
}

impl SpillFile {
    fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            file: tempfile::NamedTempFile::new_in(dir)?,
            offset: 0,
        })
    }

    /// Write every memory descriptor's pending range, mark it consumed,
    /// and drop the links.
    fn write_chain(&mut self, bufs: &mut Vec<BufRef>) -> std::io::Result<()> {
        for cl in bufs.iter() {
            let mut b = cl.borrow_mut();
            let len = {
                let Some(bytes) = b.bytes() else { continue };
                self.file.write_all(&bytes)?;
                bytes.len() as u64
            };
            self.offset += len;
            b.consume_all();
        }
        bufs.clear();
        Ok(())
    }

    /// Read the spilled body back (verification and handlers that need the
    /// full body).
    ///
    /// # Errors
    ///
    /// Propagates file I/O errors.
    pub fn read_back(&mut self) -> std::io::Result<Vec<u8>> {
        use std::io::Seek;
        let mut out = vec![];
        self.file.seek(std::io::SeekFrom::Start(0))?;
        self.file.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Per-request body state.
#[derive(Debug)]
pub struct RequestBody {
    /// The receive buffer (absent until sized, or while the pre-read part
    /// is being consumed).
    pub buf: Option<ReadBuf>,
    /// The accumulated body, by reference.
    pub bufs: Vec<BufRef>,
    /// Recycled descriptors.
    pub free: Vec<BufRef>,
    /// Descriptors in flight through the filter chain.
    pub busy: VecDeque<BufRef>,
    pub chunked: Option<ChunkedState>,
    pub spill: Option<SpillFile>,
    /// Body bytes still expected: −1 before the first filter pass, 0 when
    /// complete.
    pub rest: i64,
    /// Body bytes decoded so far.
    pub received: i64,
    /// Deferred continuation; `None` on the discard path.
    pub post: Option<PostAction>,
}

impl RequestBody {
    #[must_use]
    pub fn new(post: Option<PostAction>) -> Self {
        Self {
            buf: None,
            bufs: vec![],
            free: vec![],
            busy: VecDeque::new(),
            chunked: None,
            spill: None,
            rest: -1,
            received: 0,
            post,
        }
    }

    /// Copy of the in-memory body (memory descriptors only); used by
    /// handlers and tests. Spilled bodies live in [`Self::spill`].
    #[must_use]
    pub fn collect_memory(&self) -> Vec<u8> {
        let mut out = vec![];
        for cl in &self.bufs {
            if let Some(bytes) = cl.borrow().bytes() {
                out.extend_from_slice(&bytes);
            }
        }
        out
    }
}

/// Which buffer feeds the filter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    /// The receive buffer (`body.buf`).
    Recv,
    /// The header buffer's pre-read tail.
    Header,
    /// No input - initialize `rest` / update chains only.
    None,
}

/// Entry point: read the whole client request body, buffering to memory
/// chains and spilling to a temp file on overflow.
///
/// Idempotent re-entry: when a body record already exists (or the body is
/// being discarded) this returns [`BodyProgress::Complete`] immediately
/// and the caller runs its post action synchronously - body bytes are
/// never re-read.
///
/// # Errors
///
/// Returns a [`BodyError`]; the caller finalizes the request with
/// [`BodyError::status`].
pub fn read_request_body<IO: Read + Write>(
    r: &mut Request,
    io: &mut IO,
    cfg: &Config,
    post: PostAction,
) -> Result<BodyProgress, BodyError> {
    if r.body.is_some() || r.discard_body {
        return Ok(BodyProgress::Complete);
    }

    test_expect(r, io)?;

    r.body = Some(RequestBody::new(Some(post)));

    if r.content_length_n < 0 && !r.chunked {
        // No body at all.
        return Ok(BodyProgress::Complete);
    }

    let preread = r.header_buf.len();
    if preread > 0 {
        debug!(preread, "http client request body preread");
        body_filter(r, cfg, Input::Header)?;
        r.request_length += (preread - r.header_buf.len()) as u64;

        let rb = r.body.as_ref().expect("body record created above");
        if !r.chunked && rb.rest > 0 && rb.rest as usize <= r.header_buf.space() {
            // The whole remaining body fits in the header buffer's tail;
            // keep receiving into it instead of allocating.
            let hb = std::mem::replace(&mut r.header_buf, ReadBuf::with_capacity(0));
            r.body.as_mut().expect("body record exists").buf = Some(hb);
            return do_read_body(r, io, cfg);
        }
    } else {
        // Initializes `rest` from the headers.
        body_filter(r, cfg, Input::None)?;
    }

    let rb = r.body.as_ref().expect("body record exists");
    if rb.rest == 0 {
        // The whole body was pre-read.
        return Ok(BodyProgress::Complete);
    }
    if rb.rest < 0 {
        return Err(BodyError::Internal("negative request body rest"));
    }

    let generous = cfg.client_body_buffer_size + cfg.client_body_buffer_size / 4;
    let size = if !r.chunked && (rb.rest as u64) < generous as u64 {
        rb.rest as usize
    } else {
        cfg.client_body_buffer_size
    };
    r.body.as_mut().expect("body record exists").buf = Some(ReadBuf::with_capacity(size));

    do_read_body(r, io, cfg)
}

/// The read-drain loop. Also the resume point when the read event fires
/// again ([`crate::conn::HandlerKind::ReadRequestBody`]).
///
/// # Errors
///
/// See [`read_request_body`].
pub fn do_read_body<IO: Read>(
    r: &mut Request,
    io: &mut IO,
    cfg: &Config,
) -> Result<BodyProgress, BodyError> {
    debug!("http read client request body");

    loop {
        // Flush a full receive buffer through the filter chain (the save
        // filter spills it), then reuse the storage.
        {
            let rb = r.body.as_ref().expect("body record exists");
            let buf = rb.buf.as_ref().expect("receive buffer installed");
            if buf.is_full() {
                let input = if buf.is_empty() { Input::None } else { Input::Recv };
                body_filter(r, cfg, input)?;

                let rb = r.body.as_mut().expect("body record exists");
                if !rb.busy.is_empty() {
                    return Err(BodyError::Internal("body buffers were not drained"));
                }
                rb.buf.as_mut().expect("receive buffer installed").rewind();
            }
        }

        let rb = r.body.as_mut().expect("body record exists");
        let buf = rb.buf.as_mut().expect("receive buffer installed");
        let buffered = buf.len() as i64;
        let expected = rb.rest - buffered;
        let size = (buf.space() as i64).min(expected);

        if size > 0 {
            let n = match buf.fill_from(io, size as usize) {
                Ok(0) => {
                    info!("client prematurely closed connection");
                    return Err(BodyError::PrematureClose);
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    trace!(rest = rb.rest, "http client request body rest");
                    return Ok(BodyProgress::Again);
                }
                Err(e) => return Err(BodyError::Recv(e)),
            };
            trace!(n, "http client request body recv");
            r.request_length += n as u64;

            if n as i64 == expected {
                // Everything expected so far is buffered; run the filter.
                body_filter(r, cfg, Input::Recv)?;
            }
        } else {
            // The buffer already holds everything expected; filter it.
            body_filter(r, cfg, Input::Recv)?;
            let rb = r.body.as_ref().expect("body record exists");
            if rb.rest > 0 && rb.buf.as_ref().is_some_and(|b| b.len() as i64 == buffered) {
                return Err(BodyError::Internal("body filter made no progress"));
            }
        }

        if r.body.as_ref().expect("body record exists").rest == 0 {
            break;
        }
    }

    Ok(BodyProgress::Complete)
}

/// Best-effort `100 Continue`, at most once per request.
fn test_expect<W: Write>(r: &mut Request, io: &mut W) -> Result<(), BodyError> {
    if r.expect_tested || !r.has_expect_continue || r.minor_version < 1 {
        return Ok(());
    }
    r.expect_tested = true;

    debug!("send 100 Continue");
    match io.write(CONTINUE_RESPONSE) {
        Ok(n) if n == CONTINUE_RESPONSE.len() => Ok(()),
        // We assume that such a small packet should be sent successfully.
        Ok(_) => Err(BodyError::Io(std::io::Error::other(
            "short write on 100 Continue",
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(BodyError::Io(e)),
    }
}

/// One pass of the filter chain: length/chunked decode, save, recycle.
fn body_filter(r: &mut Request, cfg: &Config, input: Input) -> Result<(), BodyError> {
    // Detach the input buffer so the filters can borrow it alongside the
    // body record.
    let mut taken = match input {
        Input::Recv => r.body.as_mut().expect("body record exists").buf.take(),
        Input::Header => Some(std::mem::replace(
            &mut r.header_buf,
            ReadBuf::with_capacity(0),
        )),
        Input::None => None,
    };
    let recv_buf_full =
        input == Input::Recv && taken.as_ref().is_some_and(ReadBuf::is_full);

    let result = body_filter_pass(r, cfg, taken.as_mut(), recv_buf_full);

    match input {
        Input::Recv => r.body.as_mut().expect("body record exists").buf = taken,
        Input::Header => r.header_buf = taken.expect("taken above"),
        Input::None => {}
    }
    result
}

fn body_filter_pass(
    r: &mut Request,
    cfg: &Config,
    input: Option<&mut ReadBuf>,
    recv_buf_full: bool,
) -> Result<(), BodyError> {
    let chunked_mode = r.chunked;
    let content_length_n = r.content_length_n;
    let rb = r.body.as_mut().expect("body record exists");

    let mut out = if chunked_mode {
        chunked_filter(rb, input, cfg.client_max_body_size)?
    } else {
        length_filter(rb, input, content_length_n)
    };

    if chunked_mode && rb.rest == 0 {
        // The decoded length is now known.
        r.content_length_n = rb.received;
    }

    let temp_dir = cfg.resolve(&cfg.client_body_temp_path);
    save_filter(rb, &mut out, recv_buf_full, &temp_dir, cfg.client_body_in_file_only)?;
    chain_update(&mut rb.free, &mut rb.busy, &mut out, BufTag::RequestBody);
    Ok(())
}

/// Shadow the input window and count `rest` down from `Content-Length`.
fn length_filter(
    rb: &mut RequestBody,
    input: Option<&mut ReadBuf>,
    content_length_n: i64,
) -> Vec<BufRef> {
    if rb.rest == -1 {
        debug!("http request body content length filter");
        rb.rest = content_length_n;
    }

    let mut out = vec![];
    let Some(buf) = input else { return out };

    if rb.rest == 0 || buf.is_empty() {
        return out;
    }

    let take = (buf.len() as i64).min(rb.rest) as usize;
    let cl = chain_get_free(&mut rb.free);
    {
        let mut b = cl.borrow_mut();
        b.shadow(&buf.region(), buf.pos, buf.pos + take);
        b.tag = BufTag::RequestBody;
        if take as i64 == rb.rest {
            b.last_buf = true;
        }
    }
    buf.pos += take;
    rb.rest -= take as i64;
    rb.received += take as i64;
    out.push(cl);
    out
}

/// Run the chunked decoder over the input window, splicing payload ranges
/// into descriptors and enforcing `client_max_body_size` per chunk.
fn chunked_filter(
    rb: &mut RequestBody,
    input: Option<&mut ReadBuf>,
    max_body: u64,
) -> Result<Vec<BufRef>, BodyError> {
    if rb.rest == -1 {
        debug!("http request body chunked filter");
        rb.chunked = Some(ChunkedState::default());
        // Minimum still expected: "0" CRLF.
        rb.rest = 3;
    }

    let mut out = vec![];
    let Some(buf) = input else { return Ok(out) };
    let state = rb.chunked.as_mut().expect("chunked state initialized");

    loop {
        let mut cursor = 0usize;
        let status = {
            let data = buf.data();
            chunked::parse(state, &data, &mut cursor)
        };
        buf.pos += cursor;

        match status {
            Ok(ChunkStatus::Chunk) => {
                if max_body > 0 && max_body.saturating_sub(rb.received as u64) < state.size {
                    tracing::error!(
                        received = rb.received,
                        chunk = state.size,
                        "client intended to send too large chunked body"
                    );
                    return Err(BodyError::TooLarge {
                        declared: rb.received as u64 + state.size,
                    });
                }

                let avail = buf.len().min(state.size as usize);
                if avail > 0 {
                    let cl = chain_get_free(&mut rb.free);
                    {
                        let mut b = cl.borrow_mut();
                        b.shadow(&buf.region(), buf.pos, buf.pos + avail);
                        b.tag = BufTag::RequestBody;
                    }
                    buf.pos += avail;
                    state.size -= avail as u64;
                    rb.received += avail as i64;
                    out.push(cl);
                }

                if buf.is_empty() {
                    rb.rest = state.length.max(1) as i64;
                    break;
                }
            }
            Ok(ChunkStatus::Done) => {
                rb.rest = 0;
                let cl = chain_get_free(&mut rb.free);
                {
                    let mut b = cl.borrow_mut();
                    *b = Buf::special();
                    b.last_buf = true;
                }
                out.push(cl);
                break;
            }
            Ok(ChunkStatus::Again) => {
                rb.rest = state.length.max(1) as i64;
                break;
            }
            Err(_) => {
                tracing::error!("client sent invalid chunked body");
                return Err(BodyError::InvalidChunked);
            }
        }
    }

    Ok(out)
}

/// Append decoded descriptors to `bufs` by reference; spill on overflow;
/// on completion convert a spilled body into a single in-file descriptor.
fn save_filter(
    rb: &mut RequestBody,
    out: &mut Vec<BufRef>,
    recv_buf_full: bool,
    temp_dir: &Path,
    in_file_only: bool,
) -> Result<(), BodyError> {
    for cl in out.iter() {
        rb.bufs.push(cl.clone());
    }

    if rb.rest > 0 {
        if recv_buf_full {
            write_body_to_spill(rb, temp_dir)?;
        }
        return Ok(());
    }

    // rest == 0: the body is complete.
    if rb.spill.is_some() || in_file_only {
        write_body_to_spill(rb, temp_dir)?;

        let offset = rb.spill.as_ref().expect("spill created above").offset;
        if offset != 0 {
            let cl = chain_get_free(&mut rb.free);
            {
                let mut b = cl.borrow_mut();
                *b = Buf::default();
                b.data = BufData::File {
                    file_pos: 0,
                    file_last: offset,
                };
            }
            rb.bufs = vec![cl];
        }
    }

    Ok(())
}

fn write_body_to_spill(rb: &mut RequestBody, temp_dir: &Path) -> Result<(), BodyError> {
    if rb.spill.is_none() {
        info!("a client request body is buffered to a temporary file");
        rb.spill = Some(SpillFile::create(temp_dir).map_err(BodyError::Io)?);
    }
    if rb.bufs.is_empty() {
        return Ok(());
    }
    rb.spill
        .as_mut()
        .expect("spill created above")
        .write_chain(&mut rb.bufs)
        .map_err(BodyError::Io)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::http::request::{HeadStatus, parse_request_head};

    /// A scripted connection: reads serve from `chunks` (with `None`
    /// simulating `EWOULDBLOCK`), writes are collected.
    #[derive(Debug, Default)]
    struct MockConn {
        chunks: std::collections::VecDeque<Option<Vec<u8>>>,
        written: Vec<u8>,
        reads: usize,
    }

    impl MockConn {
        fn scripted(chunks: Vec<Option<&[u8]>>) -> Self {
            Self {
                chunks: chunks
                    .into_iter()
                    .map(|c| c.map(<[u8]>::to_vec))
                    .collect(),
                written: vec![],
                reads: 0,
            }
        }
    }

    impl Read for MockConn {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads += 1;
            match self.chunks.front_mut() {
                Some(Some(chunk)) => {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(n)
                }
                Some(None) => {
                    self.chunks.pop_front();
                    Err(std::io::ErrorKind::WouldBlock.into())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for MockConn {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
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

    fn test_config(dir: &Path) -> Config {
        Config {
            prefix: dir.to_path_buf(),
            client_body_buffer_size: 32,
            ..Config::default()
        }
    }

    #[test]
    fn test_simple_post_fully_preread() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
        let mut io = MockConn::default();

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();

        assert_eq!(progress, BodyProgress::Complete);
        let rb = r.body.as_ref().unwrap();
        assert_eq!(rb.rest, 0);
        assert_eq!(rb.collect_memory(), b"hello");
        // Nothing was read from the socket.
        assert_eq!(io.reads, 0);
    }

    #[test]
    fn test_body_read_from_socket_across_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n");
        let mut io = MockConn::scripted(vec![Some(b"hell"), Some(b"o worl"), Some(b"d!")]);

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();

        assert_eq!(progress, BodyProgress::Complete);
        let rb = r.body.as_ref().unwrap();
        assert_eq!(rb.collect_memory(), b"hello worl");
        assert_eq!(rb.rest, 0);
    }

    #[test]
    fn test_again_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 8\r\n\r\n");
        let mut io = MockConn::scripted(vec![Some(b"four"), None, Some(b"more")]);

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(progress, BodyProgress::Again);

        // The worker re-enters the drain loop on the next readiness.
        let progress = do_read_body(&mut r, &mut io, &cfg).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
        assert_eq!(r.body.as_ref().unwrap().collect_memory(), b"fourmore");
    }

    #[test]
    fn test_idempotent_reentry_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
        let mut io = MockConn::scripted(vec![Some(b"XXXXX")]);

        let first =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(first, BodyProgress::Complete);
        let body_before = r.body.as_ref().unwrap().collect_memory();

        let second =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(second, BodyProgress::Complete);

        // Second entry is synchronous and does not touch body bytes.
        assert_eq!(r.body.as_ref().unwrap().collect_memory(), body_before);
        assert_eq!(io.reads, 0);
    }

    #[test]
    fn test_no_body_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r = request_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut io = MockConn::default();

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
    }

    #[test]
    fn test_expect_100_continue_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r = request_for(
            b"POST / HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n",
        );
        let mut io = MockConn::scripted(vec![Some(b"ok")]);

        read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(io.written, CONTINUE_RESPONSE);
    }

    #[test]
    fn test_chunked_body_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut io =
            MockConn::scripted(vec![Some(b"5\r\nhello\r\n"), Some(b"0\r\n\r\n")]);

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();

        assert_eq!(progress, BodyProgress::Complete);
        let rb = r.body.as_ref().unwrap();
        assert_eq!(rb.collect_memory(), b"hello");
        // The final descriptor is the zero-length last-buf marker.
        assert!(rb.bufs.last().unwrap().borrow().last_buf);
        // The decoded length replaces the (absent) Content-Length.
        assert_eq!(r.content_length_n, 5);
    }

    #[test]
    fn test_chunked_preread_in_header_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r = request_for(
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
        );
        let mut io = MockConn::default();

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(progress, BodyProgress::Complete);
        assert_eq!(r.body.as_ref().unwrap().collect_memory(), b"abc");
        assert_eq!(io.reads, 0);
    }

    #[test]
    fn test_oversize_chunk_is_rejected_with_413() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            client_max_body_size: 10,
            ..test_config(dir.path())
        };
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut io = MockConn::scripted(vec![Some(b"14\r\naaaaaaaaaaaaaaaaaaaa\r\n0\r\n\r\n")]);

        let err =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap_err();
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn test_invalid_chunked_is_rejected_with_400() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n");
        let mut io = MockConn::scripted(vec![Some(b"zz\r\n")]);

        let err =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_premature_close_is_rejected_with_400() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut r = request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\n");
        let mut io = MockConn::scripted(vec![Some(b"tiny")]);

        let err =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_large_body_spills_to_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // 32-byte receive buffer forces spilling for a 100-byte body.
        let cfg = test_config(dir.path());
        let body: Vec<u8> = (0u8..100).collect();
        let mut r = request_for(
            format!("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n", body.len())
                .as_bytes(),
        );
        let mut io = MockConn::scripted(vec![Some(body.as_slice())]);

        let progress =
            read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
        assert_eq!(progress, BodyProgress::Complete);

        let rb = r.body.as_mut().unwrap();
        let spill = rb.spill.as_mut().expect("body should have spilled");
        assert_eq!(spill.offset, body.len() as u64);
        assert_eq!(spill.read_back().unwrap(), body);

        // The chain was replaced by a single in-file descriptor.
        assert_eq!(rb.bufs.len(), 1);
        assert!(matches!(
            rb.bufs[0].borrow().data,
            BufData::File { file_pos: 0, file_last } if file_last == body.len() as u64
        ));
    }

    #[test]
    fn test_in_file_only_spills_small_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            client_body_in_file_only: true,
            ..test_config(dir.path())
        };
        let mut r =
            request_for(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
        let mut io = MockConn::default();

        read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();

        let rb = r.body.as_mut().unwrap();
        let spill = rb.spill.as_mut().expect("in-file-only forces a spill");
        assert_eq!(spill.read_back().unwrap(), b"hello");
    }

    #[test]
    fn test_body_length_invariant_across_buffer_boundaries() {
        // Cumulative bytes delivered to the save filter equal exactly
        // Content-Length, for several receive-buffer placements.
        for chunk_len in [1usize, 3, 7, 16, 31, 32, 33, 64] {
            let dir = tempfile::tempdir().unwrap();
            let cfg = test_config(dir.path());
            let body: Vec<u8> = (0u16..96).map(|i| (i % 251) as u8).collect();
            let mut r = request_for(
                format!("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n", body.len())
                    .as_bytes(),
            );
            let chunks: Vec<Option<&[u8]>> = body.chunks(chunk_len).map(Some).collect();
            let mut io = MockConn::scripted(chunks);

            let progress =
                read_request_body(&mut r, &mut io, &cfg, PostAction::Respond(200)).unwrap();
            assert_eq!(progress, BodyProgress::Complete, "chunk_len {chunk_len}");

            let rb = r.body.as_mut().unwrap();
            let got = match rb.spill.as_mut() {
                Some(spill) => spill.read_back().unwrap(),
                None => rb.collect_memory(),
            };
            assert_eq!(got, body, "chunk_len {chunk_len}");
            assert_eq!(rb.received, body.len() as i64);
        }
    }
}
