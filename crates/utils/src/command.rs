use std::io::Read;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;

/// Maximum amount of captured stderr we attach to an error message.
const MAX_STDERR_BYTES: usize = 4096;

fn command_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn stderr_tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the command we're about to execute.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, discarding stdout; stderr is captured
    /// and attached to the error on failure.
    fn run(&mut self) -> Result<()>;

    /// Like [`Self::run`], but also capture stderr on success (some tools
    /// write noise there that we don't want on the terminal).
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a `String`.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        // This is useful for debugging
        tracing::debug!("exec: {:?}", self);
        self
    }

    fn run(&mut self) -> Result<()> {
        self.stdout(Stdio::null());
        self.run_capture_stderr()
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let name = command_name(self);
        let output = self
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {name}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{name} failed: {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            ));
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let name = command_name(self);
        let mut child = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {name}"))?;
        let mut stdout = String::new();
        // SAFETY: Piped above
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut stdout)
            .with_context(|| format!("Reading from {name}"))?;
        let mut stderr = Vec::new();
        let _ = child.stderr.take().unwrap().read_to_end(&mut stderr);
        let status = child.wait()?;
        if !status.success() {
            return Err(anyhow!(
                "{name} failed: {status}: {}",
                stderr_tail(&stderr)
            ));
        }
        Ok(stdout)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = command_name(self);
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf).with_context(|| format!("Parsing output of {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run() {
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());
    }

    #[test]
    fn test_run_stderr_in_error() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 1"])
            .run()
            .unwrap_err();
        assert!(e.to_string().contains("oops"), "{e}");
    }

    #[test]
    fn test_run_get_string() {
        let out = Command::new("echo")
            .args(["hello", "world"])
            .run_get_string()
            .unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"a": 42}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, 42);
    }
}
