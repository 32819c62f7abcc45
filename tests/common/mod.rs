//! scripted tcp servers for exact wire control in tests.
#![allow(dead_code)]

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

pub async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// read until `buf` holds `heads` complete request header sections.
pub async fn read_request_heads(stream: &mut TcpStream, heads: usize) -> Vec<u8> {
    read_until(stream, move |buf| count_heads(buf) >= heads).await
}

/// read until `needle` shows up in the accumulated bytes.
pub async fn read_until_contains(stream: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
    let needle = needle.to_vec();
    read_until(stream, move |buf| contains(buf, &needle)).await
}

async fn read_until(stream: &mut TcpStream, done: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    while !done(&buf) {
        let n = stream.read(&mut tmp).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    buf
}

pub fn count_heads(buf: &[u8]) -> usize {
    // request heads end in a blank line. skip overlap from the extra blank
    // line the client writes after fixed length bodies.
    let mut count = 0;
    let mut i = 0;
    while i + 4 <= buf.len() {
        if &buf[i..i + 4] == b"\r\n\r\n" {
            count += 1;
            i += 4;
        } else {
            i += 1;
        }
    }
    count
}

pub fn contains(buf: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && buf.windows(needle.len()).any(|w| w == needle)
}

pub fn count_occurrences(buf: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    buf.windows(needle.len()).filter(|w| *w == needle).count()
}

/// park the connection until the peer goes away, so the client never sees an
/// unexpected eof while the test is still asserting.
pub async fn hold_until_closed(stream: &mut TcpStream) {
    let mut tmp = [0u8; 1024];
    loop {
        match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
