// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Incremental decoder for `Transfer-Encoding: chunked`.
//!
//! The parser is resumable at any byte boundary: it consumes from a
//! `(data, pos)` cursor and keeps its cross-call state in
//! [`ChunkedState`]. One call advances until it either needs more bytes
//! ([`ChunkStatus::Again`]), has positioned the cursor at the start of
//! chunk payload ([`ChunkStatus::Chunk`] with `state.size` bytes pending),
//! or has consumed the terminating zero chunk and trailers
//! ([`ChunkStatus::Done`]).
//!
//! Grammar walked: size line (hex, optional extension) → CRLF → data →
//! CRLF → … → `0` → optional trailers → CRLF.

/// Parser position in the chunked grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    SizeStart,
    Size,
    Ext,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    LastExt,
    LastSizeLf,
    Trailer,
    TrailerCr,
    TrailerHeader,
    TrailerHeaderCr,
    Done,
}

/// Cross-call scratch for the decoder.
#[derive(Debug, Clone, Default)]
pub struct ChunkedState {
    pub state: State,
    /// Payload bytes of the current chunk not yet handed to the caller.
    pub size: u64,
    /// Estimate of the bytes needed to make further progress; the body
    /// pipeline mirrors this into `rest` on `Again`.
    pub length: u64,
}

/// What [`parse`] achieved before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The cursor sits at chunk payload; `state.size` bytes belong to the
    /// body. The caller consumes up to that many bytes, decrements
    /// `state.size`, and calls again.
    Chunk,
    /// The zero chunk and trailers are consumed; the body is complete.
    Done,
    /// More input is needed.
    Again,
}

/// Invalid chunked framing (maps to HTTP 400).
#[derive(Debug, thiserror::Error)]
#[error("invalid chunked encoding at byte {offset}")]
pub struct InvalidChunked {
    pub offset: usize,
}

/// Guard against `size` overflowing when accumulating hex digits.
const MAX_SIZE_BITS: u32 = 60;

/// Advance the decoder over `data[*pos..]`.
///
/// On [`ChunkStatus::Chunk`] the caller is expected to consume payload
/// bytes itself (they never pass through the parser) and decrement
/// `state.size`; parsing resumes in the `Data` state.
///
/// # Errors
///
/// Returns [`InvalidChunked`] when the input violates the grammar; the
/// request is finalized with `400`.
pub fn parse(
    state: &mut ChunkedState,
    data: &[u8],
    pos: &mut usize,
) -> Result<ChunkStatus, InvalidChunked> {
    while *pos < data.len() {
        let ch = data[*pos];
        let bad = || InvalidChunked { offset: *pos };

        match state.state {
            State::SizeStart => {
                state.size = 0;
                match hex_value(ch) {
                    Some(v) => {
                        state.size = u64::from(v);
                        state.state = State::Size;
                    }
                    None => return Err(bad()),
                }
            }
            State::Size => {
                if state.size > (1 << MAX_SIZE_BITS) {
                    return Err(bad());
                }
                match (hex_value(ch), ch) {
                    (Some(v), _) => {
                        state.size = (state.size << 4) + u64::from(v);
                    }
                    (None, b'\r') => {
                        state.state = if state.size == 0 {
                            State::LastSizeLf
                        } else {
                            State::SizeLf
                        };
                    }
                    (None, b';' | b' ' | b'\t') => {
                        state.state = if state.size == 0 {
                            State::LastExt
                        } else {
                            State::Ext
                        };
                    }
                    _ => return Err(bad()),
                }
            }
            State::Ext => {
                if ch == b'\r' {
                    state.state = State::SizeLf;
                }
            }
            State::SizeLf => {
                if ch != b'\n' {
                    return Err(bad());
                }
                *pos += 1;
                state.state = State::Data;
                state.length = state.size + 2 /* trailing CRLF */;
                return Ok(ChunkStatus::Chunk);
            }
            State::Data => {
                if state.size > 0 {
                    // Payload continues (resumed after a buffer boundary);
                    // hand the cursor back so the caller consumes it.
                    state.length = state.size + 2;
                    return Ok(ChunkStatus::Chunk);
                }
                // The caller consumed the payload; whatever follows is the
                // chunk's trailing CRLF.
                if ch != b'\r' {
                    return Err(bad());
                }
                state.state = State::DataCr;
            }
            State::DataCr => {
                if ch != b'\n' {
                    return Err(bad());
                }
                state.state = State::DataLf;
            }
            State::DataLf => {
                // Next size line begins right here; reprocess the byte.
                state.state = State::SizeStart;
                continue;
            }
            State::LastExt => {
                if ch == b'\r' {
                    state.state = State::LastSizeLf;
                }
            }
            State::LastSizeLf => {
                if ch != b'\n' {
                    return Err(bad());
                }
                state.state = State::Trailer;
            }
            State::Trailer => {
                if ch == b'\r' {
                    state.state = State::TrailerCr;
                } else {
                    state.state = State::TrailerHeader;
                }
            }
            State::TrailerCr => {
                if ch != b'\n' {
                    return Err(bad());
                }
                state.state = State::Done;
                *pos += 1;
                return Ok(ChunkStatus::Done);
            }
            State::TrailerHeader => {
                if ch == b'\r' {
                    state.state = State::TrailerHeaderCr;
                }
            }
            State::TrailerHeaderCr => {
                if ch != b'\n' {
                    return Err(bad());
                }
                state.state = State::Trailer;
            }
            State::Done => return Ok(ChunkStatus::Done),
        }

        *pos += 1;
    }

    if state.state == State::Done {
        return Ok(ChunkStatus::Done);
    }
    state.length = pending_estimate(state);
    Ok(ChunkStatus::Again)
}

fn pending_estimate(state: &ChunkedState) -> u64 {
    match state.state {
        // "0" CRLF CRLF at minimum.
        State::SizeStart => 5,
        State::Size | State::Ext | State::SizeLf => 4,
        State::Data | State::DataCr | State::DataLf => state.size + 2,
        State::LastExt
        | State::LastSizeLf
        | State::Trailer
        | State::TrailerCr
        | State::TrailerHeader
        | State::TrailerHeaderCr => 2,
        State::Done => 0,
    }
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Drive the parser over `input` split at every position in `splits`,
    /// collecting the decoded payload.
    fn decode_split(input: &[u8], split_at: usize) -> Result<Vec<u8>, InvalidChunked> {
        let mut state = ChunkedState::default();
        let mut out = vec![];
        for part in [&input[..split_at], &input[split_at..]] {
            let mut pos = 0;
            loop {
                match parse(&mut state, part, &mut pos)? {
                    ChunkStatus::Chunk | ChunkStatus::Again => {
                        // Consume available payload by hand, like the body
                        // filter does.
                        let avail = (part.len() - pos).min(state.size as usize);
                        out.extend_from_slice(&part[pos..pos + avail]);
                        pos += avail;
                        state.size -= avail as u64;
                        if pos == part.len() {
                            break;
                        }
                    }
                    ChunkStatus::Done => return Ok(out),
                }
            }
        }
        // Final drive with empty input to observe Done if pending.
        let mut pos = 0;
        match parse(&mut state, &[], &mut pos)? {
            ChunkStatus::Done => Ok(out),
            _ => panic!("body incomplete"),
        }
    }

    fn encode(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![];
        for c in chunks {
            out.extend_from_slice(format!("{:x}\r\n", c.len()).as_bytes());
            out.extend_from_slice(c);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    #[test]
    fn test_single_chunk() {
        let wire = encode(&[b"hello"]);
        for split in 0..wire.len() {
            assert_eq!(decode_split(&wire, split).unwrap(), b"hello", "split {split}");
        }
    }

    #[test]
    fn test_multiple_chunks_round_trip() {
        let body: Vec<u8> = (0u16..600).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<&[u8]> = body.chunks(97).collect();
        let wire = encode(&chunks);
        for split in [0, 1, 3, 50, 99, 100, wire.len() / 2, wire.len() - 1] {
            assert_eq!(decode_split(&wire, split).unwrap(), body, "split {split}");
        }
    }

    #[test]
    fn test_empty_body() {
        let wire = encode(&[]);
        for split in 0..wire.len() {
            assert_eq!(decode_split(&wire, split).unwrap(), b"", "split {split}");
        }
    }

    #[test]
    fn test_single_byte_chunks() {
        let wire = encode(&[b"a", b"b", b"c"]);
        for split in 0..wire.len() {
            assert_eq!(decode_split(&wire, split).unwrap(), b"abc", "split {split}");
        }
    }

    #[test]
    fn test_chunk_extension_is_skipped() {
        let wire = b"5;name=value\r\nhello\r\n0\r\n\r\n";
        assert_eq!(decode_split(wire, 7).unwrap(), b"hello");
    }

    #[test]
    fn test_trailers_are_skipped() {
        let wire = b"5\r\nhello\r\n0\r\nX-Check: 1\r\n\r\n";
        for split in 0..wire.len() {
            assert_eq!(decode_split(wire, split).unwrap(), b"hello", "split {split}");
        }
    }

    #[test]
    fn test_invalid_size_character() {
        let mut state = ChunkedState::default();
        let mut pos = 0;
        assert!(parse(&mut state, b"zz\r\n", &mut pos).is_err());
    }

    #[test]
    fn test_missing_chunk_crlf() {
        let mut state = ChunkedState::default();
        let mut pos = 0;
        // "5\r\nhello" then garbage instead of CRLF.
        let wire = b"5\r\nhelloXX";
        assert_eq!(parse(&mut state, wire, &mut pos).unwrap(), ChunkStatus::Chunk);
        pos += 5;
        state.size = 0;
        assert!(parse(&mut state, wire, &mut pos).is_err());
    }

    #[test]
    fn test_oversize_chunk_size_is_rejected() {
        let mut state = ChunkedState::default();
        let mut pos = 0;
        let wire = b"fffffffffffffffffff\r\n";
        assert!(parse(&mut state, wire, &mut pos).is_err());
    }
}
