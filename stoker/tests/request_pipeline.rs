// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end body pipeline over a real (nonblocking) loopback socket:
//! head parse → pre-read feed → drain loop with genuine `EWOULDBLOCK`
//! suspensions → completion.

use std::{io::Write,
          net::{TcpListener, TcpStream},
          time::Duration};

use pretty_assertions::assert_eq;
use stoker::{core::{buf::ReadBuf, config::Config},
             http::{BodyProgress, HeadStatus, PostAction, Request, do_read_body,
                    parse_request_head, read_request_body}};

fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (client, server)
}

/// Read until a complete head is parsed (retrying on `WouldBlock`).
fn read_head(server: &mut TcpStream) -> Request {
    let mut hb = ReadBuf::with_capacity(4096);
    loop {
        let space = hb.space();
        match hb.fill_from(server, space) {
            Ok(0) => panic!("peer closed during head"),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            Err(e) => panic!("head read failed: {e}"),
        }
        match parse_request_head(&mut hb).unwrap() {
            HeadStatus::Complete(r) => return *r,
            HeadStatus::Partial => {}
        }
    }
}

fn drive_to_completion(r: &mut Request, server: &mut TcpStream, cfg: &Config) {
    for _ in 0..500 {
        match do_read_body(r, server, cfg).unwrap() {
            BodyProgress::Complete => return,
            BodyProgress::Again => std::thread::sleep(Duration::from_millis(2)),
        }
    }
    panic!("body never completed");
}

#[test]
fn test_post_body_over_a_real_socket() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        prefix: dir.path().to_path_buf(),
        client_body_buffer_size: 32,
        ..Config::default()
    };

    let (mut client, mut server) = connected_pair();

    // Head plus a pre-read prefix of the body in one segment.
    client
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nhel")
        .unwrap();

    let mut request = read_head(&mut server);
    assert_eq!(request.content_length_n, 10);
    assert_eq!(&*request.header_buf.data(), b"hel");

    // The rest of the body is not there yet: the pipeline suspends.
    let progress =
        read_request_body(&mut request, &mut server, &cfg, PostAction::Respond(200))
            .unwrap();
    assert_eq!(progress, BodyProgress::Again);

    client.write_all(b"lo world").unwrap();
    drive_to_completion(&mut request, &mut server, &cfg);

    let rb = request.body.as_ref().unwrap();
    assert_eq!(rb.rest, 0);
    assert_eq!(rb.collect_memory(), b"hello world"[..10].to_vec());
}

#[test]
fn test_chunked_body_over_a_real_socket() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config {
        prefix: dir.path().to_path_buf(),
        ..Config::default()
    };

    let (mut client, mut server) = connected_pair();

    client
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n")
        .unwrap();

    let mut request = read_head(&mut server);
    assert!(request.chunked);

    let progress =
        read_request_body(&mut request, &mut server, &cfg, PostAction::Respond(200))
            .unwrap();
    assert_eq!(progress, BodyProgress::Again);

    // Two chunks, then the terminator, in separate segments.
    client.write_all(b"5\r\nhello\r\n").unwrap();
    client.write_all(b"6\r\n world\r\n").unwrap();
    client.write_all(b"0\r\n\r\n").unwrap();

    drive_to_completion(&mut request, &mut server, &cfg);

    let rb = request.body.as_ref().unwrap();
    assert_eq!(rb.collect_memory(), b"hello world");
    assert_eq!(request.content_length_n, 11);
}
