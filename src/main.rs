mod cache;
mod catalog;
mod config;
mod engine;
mod error;
mod protocol;
mod reporter;
mod session;
mod signal;
#[cfg(test)]
mod testutil;
mod transport;
mod worker;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Error as E, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::WorkerConfig;
use engine::loader::GgufLoader;
use reporter::{encode_frame, EventQueue};
use transport::{handle_read, handle_write, needs_writable_interest, writable_interest, Client};
use worker::Worker;

const SERVER: Token = Token(0);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = WorkerConfig::load(config_path.as_deref()).map_err(E::msg)?;

    let loader = GgufLoader::new(PathBuf::from(&config.models_dir), config.sampling);
    let mut worker = Worker::new(Box::new(loader), config.max_new_tokens);
    let mut queue = EventQueue::new();

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(128);

    let addr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.listen_addr))?;
    let mut server = TcpListener::bind(addr)?;
    poll.registry()
        .register(&mut server, SERVER, Interest::READABLE)?;

    let mut clients: HashMap<Token, Client> = HashMap::new();
    let mut unique_token = Token(SERVER.0 + 1);

    info!(%addr, models_dir = %config.models_dir, "worker listening");

    loop {
        // Zero timeout while generating so the next decode step runs
        // immediately after pending IO is serviced.
        let timeout = if worker.has_active_session() {
            Duration::ZERO
        } else {
            Duration::from_millis(5)
        };
        poll.poll(&mut events, Some(timeout))?;

        let mut pending_lines = Vec::new();
        let mut closed = Vec::new();

        for event in events.iter() {
            match event.token() {
                SERVER => loop {
                    match server.accept() {
                        Ok((mut stream, peer)) => {
                            let token = unique_token;
                            unique_token.0 += 1;
                            info!(%peer, "client connected");
                            poll.registry()
                                .register(&mut stream, token, Interest::READABLE)?;
                            clients.insert(token, Client::new(stream));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => warn!(%e, "accept error"),
                    }
                },
                token => {
                    if let Some(client) = clients.get_mut(&token) {
                        let mut should_close = false;
                        if event.is_readable() && handle_read(client, &mut pending_lines) {
                            should_close = true;
                        }
                        if event.is_writable() {
                            if handle_write(client) {
                                should_close = true;
                            } else if client.output_buffer.is_empty() {
                                poll.registry().reregister(
                                    &mut client.stream,
                                    token,
                                    Interest::READABLE,
                                )?;
                            }
                        }
                        if should_close {
                            closed.push(token);
                        }
                    }
                }
            }
        }

        for token in closed {
            info!(token = token.0, "client disconnected");
            clients.remove(&token);
        }

        for line in pending_lines {
            worker.handle_line(&line, &mut queue);
        }

        worker.tick(&mut queue);

        if !queue.is_empty() {
            let mut frames = Vec::new();
            for event in queue.drain() {
                frames.extend(encode_frame(&event));
            }
            for (token, client) in clients.iter_mut() {
                client.output_buffer.extend(frames.iter().copied());
                if needs_writable_interest(client) {
                    if let Err(e) = poll.registry().reregister(
                        &mut client.stream,
                        *token,
                        writable_interest(),
                    ) {
                        error!(%e, token = token.0, "reregister failed");
                    }
                }
            }
        }
    }
}
