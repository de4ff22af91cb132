//! Unix-socket front end for the service.
//!
//! Connections are handled on their own threads, but every mutating
//! request serializes on the service lock, so the daemon stays
//! single-writer. Peer credentials come from the socket.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::rpc::{Request, Response};
use crate::service::{Peer, Service};

/// Bind the daemon socket, replacing a stale one from a previous run.
#[context("Binding {path}")]
pub fn bind_socket(path: &Utf8Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("removed stale socket {path}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Removing stale socket {path}")),
    }
    UnixListener::bind(path).map_err(Into::into)
}

fn peer_of(stream: &UnixStream) -> Result<Peer> {
    let cred = nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials)
        .context("Reading peer credentials")?;
    Ok(Peer { uid: cred.uid() })
}

/// Accept loop. With `exit_on_idle`, the process exits after the last
/// client disconnects, matching the daemon's on-demand lifecycle.
pub fn serve(listener: UnixListener, service: Arc<Service>, exit_on_idle: bool) -> Result<()> {
    let clients = Arc::new(AtomicUsize::new(0));
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                continue;
            }
        };
        clients.fetch_add(1, Ordering::SeqCst);
        let service = service.clone();
        let clients = clients.clone();
        std::thread::spawn(move || {
            if let Err(e) = handle_client(&service, stream) {
                tracing::warn!("client connection ended: {e:#}");
            }
            let remaining = clients.fetch_sub(1, Ordering::SeqCst) - 1;
            if exit_on_idle && remaining == 0 && !service.is_in_progress() {
                tracing::info!("last client disconnected, exiting");
                std::process::exit(0);
            }
        });
    }
    Ok(())
}

/// One request/response exchange per line until the peer disconnects.
pub fn handle_client(service: &Service, stream: UnixStream) -> Result<()> {
    let peer = peer_of(&stream)?;
    let mut reader = BufReader::new(stream.try_clone().context("Cloning stream")?);
    let mut writer = stream;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            // Chunk payloads trail the request frame, so the dispatch
            // must read them through the same buffered reader.
            Ok(request) => service.dispatch(&peer, request, &mut reader),
            Err(e) => Response::Error {
                message: format!("malformed request: {e}"),
            },
        };
        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
}
