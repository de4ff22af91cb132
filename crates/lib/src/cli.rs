//! The `dsutool` command line: drives an installation stream into the
//! daemon and manages the lifecycle of an installed image.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::paths::DEFAULT_SOCKET;
use crate::progress::{Progress, ProgressStatus};
use crate::rpc::{Request, Response, INSTALL_OK};

// Standard sysexits codes.
pub const EX_USAGE: i32 = 64;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_NOPERM: i32 = 77;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line tool for installing generic system images.
#[derive(Debug, Parser)]
#[clap(name = "dsutool", version)]
pub struct Cli {
    /// Socket the daemon listens on.
    #[clap(long, default_value = DEFAULT_SOCKET)]
    socket: Utf8PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install a new system image read from stdin or --input.
    Install {
        /// Size of the system image in bytes; defaults to the size of
        /// the --input file.
        #[clap(long)]
        size: Option<i64>,

        /// Size of the writable userdata image (default 2 GiB).
        #[clap(long)]
        userdata_size: Option<i64>,

        /// Remove an old installation (including userdata) first.
        #[clap(long)]
        wipe: bool,

        /// Do not reboot after a successful install.
        #[clap(long)]
        no_reboot: bool,

        /// Name of the installation slot under the image directory.
        #[clap(long)]
        dsu_slot: Option<String>,

        /// Read the image from this file instead of stdin.
        #[clap(long)]
        input: Option<Utf8PathBuf>,
    },
    /// Enable a previously disabled installation.
    Enable {
        /// Boot the installed image exactly once, then fall back.
        #[clap(short = 's', long)]
        single_boot: bool,
    },
    /// Keep the installation but stop booting it.
    Disable,
    /// Completely remove an installation and its userdata.
    Wipe,
    /// Print one of `running`, `installed` or `normal`.
    Status,
}

/// A connection to the daemon.
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Client {
    pub fn connect(socket: &Utf8PathBuf) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("Connecting to the installer daemon at {socket}"))?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        })
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        serde_json::to_writer(&mut self.writer, request)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Response> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            bail!("daemon closed the connection");
        }
        Ok(serde_json::from_str(&line)?)
    }

    fn request(&mut self, request: Request) -> Result<Response> {
        self.send(&request)?;
        let response = self.receive()?;
        if let Response::SecurityError { message } = &response {
            bail!(PermissionDenied(message.clone()));
        }
        Ok(response)
    }

    pub fn request_status(&mut self, request: Request) -> Result<i32> {
        match self.request(request)? {
            Response::Status { code } => Ok(code),
            other => Err(anyhow!("unexpected response {other:?}")),
        }
    }

    pub fn request_bool(&mut self, request: Request) -> Result<bool> {
        match self.request(request)? {
            Response::Bool { value } => Ok(value),
            other => Err(anyhow!("unexpected response {other:?}")),
        }
    }

    pub fn get_progress(&mut self) -> Result<Progress> {
        match self.request(Request::GetInstallProgress)? {
            Response::Progress { progress } => Ok(progress),
            other => Err(anyhow!("unexpected response {other:?}")),
        }
    }

    /// Send one streamed chunk: the request frame, then `bytes` of raw
    /// image data on the same socket.
    pub fn commit_from_reader(&mut self, input: &mut dyn Read, bytes: u64) -> Result<bool> {
        self.send(&Request::CommitChunkFromStream {
            bytes: bytes as i64,
        })?;
        let copied = std::io::copy(&mut input.take(bytes), &mut self.writer)
            .context("Streaming image data")?;
        if copied != bytes {
            bail!("input ended after {copied} of {bytes} bytes");
        }
        self.writer.flush()?;
        match self.receive()? {
            Response::Bool { value } => Ok(value),
            other => Err(anyhow!("unexpected response {other:?}")),
        }
    }
}

/// Marker error for unauthorized callers, mapped to EX_NOPERM.
#[derive(Debug, thiserror::Error)]
#[error("permission denied: {0}")]
struct PermissionDenied(String);

/// Poll the daemon's progress record on a side connection and render it.
struct ProgressDisplay {
    stop: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl ProgressDisplay {
    fn start(socket: Utf8PathBuf) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let worker = std::thread::spawn(move || {
            let Ok(mut client) = Client::connect(&socket) else {
                return;
            };
            let bar = indicatif::ProgressBar::hidden();
            bar.set_style(
                indicatif::ProgressStyle::default_bar()
                    .template("{prefix:15} {bar:80.green/red} {percent:>3}%")
                    // SAFETY: the template is a literal
                    .unwrap(),
            );
            let mut current_step = String::new();
            while !stop_flag.load(Ordering::SeqCst) {
                let Ok(progress) = client.get_progress() else {
                    break;
                };
                if progress.status != ProgressStatus::NoOperation && progress.total_bytes > 0 {
                    if progress.step != current_step {
                        current_step = progress.step.clone();
                        bar.set_prefix(current_step.clone());
                        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    }
                    bar.set_length(progress.total_bytes);
                    bar.set_position(progress.bytes_processed);
                }
                std::thread::sleep(PROGRESS_POLL_INTERVAL);
            }
            bar.finish_and_clear();
        });
        Self {
            stop,
            worker: Some(worker),
        }
    }
}

impl Drop for ProgressDisplay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn install(
    client: &mut Client,
    socket: &Utf8PathBuf,
    size: Option<i64>,
    userdata_size: Option<i64>,
    wipe: bool,
    no_reboot: bool,
    dsu_slot: Option<String>,
    input: Option<Utf8PathBuf>,
) -> Result<i32> {
    let (mut stream, size): (Box<dyn Read>, i64) = match input {
        Some(path) => {
            let file = File::open(&path).with_context(|| format!("Opening {path}"))?;
            let len = file.metadata()?.len() as i64;
            (Box::new(BufReader::new(file)), size.unwrap_or(len))
        }
        None => {
            let Some(size) = size else {
                eprintln!("Must specify --size when reading from stdin.");
                return Ok(EX_USAGE);
            };
            (Box::new(std::io::stdin().lock()), size)
        }
    };
    if size <= 0 {
        eprintln!("Invalid image size {size}.");
        return Ok(EX_USAGE);
    }

    if client.request_bool(Request::IsRunning)? {
        eprintln!("Cannot install an image within a live installed image.");
        eprintln!("Use dsutool disable or wipe and reboot first.");
        return Ok(EX_SOFTWARE);
    }
    if wipe && !client.request_bool(Request::Remove)? {
        eprintln!("Could not remove the old installation.");
        return Ok(EX_SOFTWARE);
    }

    let install_dir = dsu_slot
        .map(|slot| format!("{}/{slot}/", crate::paths::DEFAULT_DATA_ROOT))
        .unwrap_or_default();
    let status = client.request_status(Request::OpenInstall { install_dir })?;
    if status != INSTALL_OK {
        eprintln!("Could not start the installation, error code {status}.");
        return Ok(EX_SOFTWARE);
    }

    let progress = ProgressDisplay::start(socket.clone());

    let status = client.request_status(Request::CreatePartition {
        name: "userdata".into(),
        size: userdata_size.unwrap_or(0),
        read_only: false,
    })?;
    if status != INSTALL_OK {
        eprintln!("Could not create the userdata image, error code {status}.");
        return Ok(EX_SOFTWARE);
    }

    let status = client.request_status(Request::CreatePartition {
        name: "system".into(),
        size,
        read_only: true,
    })?;
    if status != INSTALL_OK {
        eprintln!("Could not create the system image, error code {status}.");
        return Ok(EX_SOFTWARE);
    }

    if !client.commit_from_reader(&mut stream, size as u64)? {
        eprintln!("Could not commit the image data.");
        return Ok(EX_SOFTWARE);
    }
    drop(progress);

    let status = client.request_status(Request::CloseInstall)?;
    if status != INSTALL_OK {
        eprintln!("Could not record the installation, error code {status}.");
        return Ok(EX_SOFTWARE);
    }
    let status = client.request_status(Request::Enable { one_shot: false })?;
    if status != INSTALL_OK {
        eprintln!("Could not make the image bootable, error code {status}.");
        return Ok(EX_SOFTWARE);
    }

    if no_reboot {
        println!("Please reboot to use the installed image.");
    } else {
        use dsid_utils::CommandRunExt;
        std::process::Command::new("systemctl")
            .arg("reboot")
            .run()
            .context("Initiating reboot")?;
    }
    Ok(0)
}

fn enable(client: &mut Client, single_boot: bool) -> Result<i32> {
    if !client.request_bool(Request::IsInstalled)? {
        eprintln!("Could not find an installation to re-enable.");
        return Ok(EX_SOFTWARE);
    }
    if client.request_bool(Request::IsInProgress)? {
        eprintln!("Cannot enable or disable while an installation is in progress.");
        return Ok(EX_SOFTWARE);
    }
    let status = client.request_status(Request::Enable {
        one_shot: single_boot,
    })?;
    if status != INSTALL_OK {
        eprintln!("Error re-enabling the installed image, error code {status}.");
        return Ok(EX_SOFTWARE);
    }
    println!("Installed image successfully enabled.");
    Ok(0)
}

fn disable(client: &mut Client) -> Result<i32> {
    if client.request_bool(Request::IsInProgress)? {
        eprintln!("Cannot enable or disable while an installation is in progress.");
        return Ok(EX_SOFTWARE);
    }
    if !client.request_bool(Request::Disable)? {
        eprintln!("Error disabling the installed image.");
        return Ok(EX_SOFTWARE);
    }
    println!("Installed image successfully disabled.");
    Ok(0)
}

fn wipe(client: &mut Client) -> Result<i32> {
    if !client.request_bool(Request::Remove)? {
        eprintln!("Error removing the installed image.");
        return Ok(EX_SOFTWARE);
    }
    println!("Installed image successfully removed.");
    Ok(0)
}

fn status(client: &mut Client) -> Result<i32> {
    let state = if client.request_bool(Request::IsRunning)? {
        "running"
    } else if client.request_bool(Request::IsInstalled)? {
        "installed"
    } else {
        "normal"
    };
    println!("{state}");
    Ok(0)
}

fn run_inner(cli: Cli) -> Result<i32> {
    let mut client = match Client::connect(&cli.socket) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Could not connect to the installer daemon: {e:#}");
            return Ok(EX_NOPERM);
        }
    };
    match cli.command {
        Command::Install {
            size,
            userdata_size,
            wipe: wipe_first,
            no_reboot,
            dsu_slot,
            input,
        } => install(
            &mut client,
            &cli.socket,
            size,
            userdata_size,
            wipe_first,
            no_reboot,
            dsu_slot,
            input,
        ),
        Command::Enable { single_boot } => enable(&mut client, single_boot),
        Command::Disable => disable(&mut client),
        Command::Wipe => wipe(&mut client),
        Command::Status => status(&mut client),
    }
}

/// Entry point for the `dsutool` binary; returns the process exit code.
pub fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = e.print();
            return code;
        }
    };
    match run_inner(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            if e.is::<PermissionDenied>() {
                EX_NOPERM
            } else {
                EX_SOFTWARE
            }
        }
    }
}
