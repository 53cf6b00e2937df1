use std::collections::VecDeque;
use std::io::{self, Read, Write};

use mio::Interest;
use tracing::warn;

/// One connected caller: inbound line buffer plus pending outbound frames.
pub struct Client {
    pub stream: mio::net::TcpStream,
    pub buffer: Vec<u8>,
    pub output_buffer: VecDeque<u8>,
}

impl Client {
    pub fn new(stream: mio::net::TcpStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            output_buffer: VecDeque::new(),
        }
    }
}

/// Drains the socket into the client's buffer and splits off every complete
/// line. Returns true when the connection should be closed.
///
/// Must read until `WouldBlock`: readiness is reported once, so bytes left
/// in the kernel buffer after a short read would never trigger another event.
pub fn handle_read(client: &mut Client, lines: &mut Vec<String>) -> bool {
    let mut chunk = [0; 4096];
    let mut closed = false;
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => client.buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                closed = true;
                break;
            }
            Err(e) => {
                warn!(%e, "read error");
                closed = true;
                break;
            }
        }
    }

    lines.extend(drain_lines(&mut client.buffer));
    closed
}

/// Splits complete newline-terminated lines off the front of the buffer,
/// leaving any trailing partial line in place. Blank lines are dropped.
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw = buffer.drain(..=pos).collect::<Vec<u8>>();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }

    lines
}

/// Flushes as much of the output buffer as the socket accepts. Returns true
/// when the connection should be closed.
pub fn handle_write(client: &mut Client) -> bool {
    while !client.output_buffer.is_empty() {
        let (head, _) = client.output_buffer.as_slices();
        match client.stream.write(head) {
            Ok(n) => {
                client.output_buffer.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(_) => return true,
        }
    }
    false
}

pub fn needs_writable_interest(client: &Client) -> bool {
    !client.output_buffer.is_empty()
}

pub fn writable_interest() -> Interest {
    Interest::READABLE | Interest::WRITABLE
}
