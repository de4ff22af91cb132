//! The `dsid` daemon: startup recovery, then serve the install socket.

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use dsid_lib::paths::{Layout, DEFAULT_SOCKET};
use dsid_lib::server;
use dsid_lib::service::{AccessPolicy, Service};
use dsid_lib::Backends;

/// Privileged daemon installing generic system images.
#[derive(Debug, Parser)]
#[clap(name = "dsid", version)]
struct Opt {
    /// Socket to listen on.
    #[clap(long, default_value = DEFAULT_SOCKET)]
    socket: Utf8PathBuf,

    /// Override the boot-status metadata root.
    #[clap(long)]
    metadata_root: Option<Utf8PathBuf>,

    /// Override the image data root.
    #[clap(long)]
    data_root: Option<Utf8PathBuf>,

    /// Exit when the last client disconnects; the daemon is started on
    /// demand.
    #[clap(long)]
    exit_on_idle: bool,

    #[clap(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Perform boot-time recovery and exit.
    RunStartupTasks,
}

fn main() -> Result<()> {
    dsid_utils::initialize_tracing();
    let opt = Opt::parse();

    let mut layout = Layout::system();
    if let Some(metadata_root) = opt.metadata_root {
        layout.metadata_root = metadata_root;
    }
    if let Some(data_root) = opt.data_root {
        layout.data_root = data_root;
    }
    dsid_lib::ensure_metadata_root(&layout)?;

    let service = Arc::new(Service::new(
        layout,
        Backends::system(),
        AccessPolicy::system(),
    ));
    service.run_startup_tasks();
    if matches!(opt.command, Some(Cmd::RunStartupTasks)) {
        return Ok(());
    }

    let listener = server::bind_socket(&opt.socket)?;
    tracing::info!("listening on {}", opt.socket);
    server::serve(listener, service, opt.exit_on_idle)
}
