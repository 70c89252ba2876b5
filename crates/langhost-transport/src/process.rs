//! Host started as a local child process, speaking frames over stdio.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use langhost_core::{Channel, Endpoint, Transport, TransportError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::stream::line_channel;

/// How long a host may linger after its stdin closes before being killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Parsed host command (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HostCommand {
    /// Split a shell-style command line and append extra arguments.
    ///
    /// # Errors
    /// Returns error if the command line cannot be parsed or is empty.
    pub fn parse(command: &str, extra_args: &[String]) -> Result<Self, TransportError> {
        let mut parts = shlex::split(command)
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("cannot parse: {command}")))?;
        if parts.is_empty() {
            return Err(TransportError::InvalidEndpoint(
                "host command is empty".to_string(),
            ));
        }
        parts.extend(extra_args.iter().cloned());
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if the executable cannot be found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), TransportError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(TransportError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Resolve an executable by explicit path or via `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Transport that launches the host as a child process group.
///
/// Frames travel over the child's stdin/stdout; stderr lines are logged.
/// The group is killed if it does not exit shortly after the channel is
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessTransport {
    working_dir: Option<PathBuf>,
}

impl ProcessTransport {
    /// Create a new process transport.
    #[must_use]
    pub const fn new() -> Self {
        Self { working_dir: None }
    }

    /// Start hosts in `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let Endpoint::Process { command, args } = endpoint else {
            return Err(TransportError::Unsupported(endpoint.to_string()));
        };
        let (executable, args) = HostCommand::parse(command, args)?.into_resolved().await?;

        let mut cmd = Command::new(&executable);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.group_spawn().map_err(TransportError::Connect)?;
        let stdin = child.inner().stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.inner().stdout.take().ok_or(TransportError::Closed)?;
        let stderr = child.inner().stderr.take();
        tracing::info!(
            executable = %executable.display(),
            pid = ?child.id(),
            "Started host process"
        );

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "langhost::host_stderr", "{line}");
                }
            });
        }

        let (channel, tasks) = line_channel(stdout, stdin);

        tokio::spawn(async move {
            let writer = tasks.writer;
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::info!(%status, "Host process exited"),
                        Err(e) => tracing::warn!("Failed to wait for host process: {e}"),
                    }
                    return;
                }
                _ = writer => {}
            }
            // stdin is closed; give the host a moment to exit on its own.
            if let Ok(status) = tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                tracing::info!(status = ?status.ok(), "Host process exited");
                return;
            }
            tracing::warn!("Host process ignored closed stdin, killing process group");
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill host process group: {e}");
            }
            let _ = child.wait().await;
        });

        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_command() {
        let extra = ["--quiet".to_string()];
        let parsed = HostCommand::parse("R --vanilla -e 'host()'", &extra).unwrap();
        assert_eq!(parsed.program, "R");
        assert_eq!(parsed.args, vec!["--vanilla", "-e", "host()", "--quiet"]);
    }

    #[test]
    fn test_parse_rejects_empty_and_unbalanced() {
        assert!(matches!(
            HostCommand::parse("   ", &[]),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            HostCommand::parse("host 'unterminated", &[]),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let err = ProcessTransport::new()
            .connect(&Endpoint::Process {
                command: "definitely-not-a-langhost-binary-42".to_string(),
                args: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ExecutableNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_echo_host() {
        use langhost_core::{ClientFrame, HostFrame, HostRequest};

        // `cat` echoes the request back; it is not a host frame, so the
        // reader skips it and then sees EOF once stdin closes.
        let mut channel = ProcessTransport::new()
            .connect(&Endpoint::Process {
                command: "cat".to_string(),
                args: vec![],
            })
            .await
            .unwrap();
        channel
            .outbound
            .send(ClientFrame::Request {
                id: 1,
                request: HostRequest::Handshake,
            })
            .unwrap();
        drop(channel.outbound);

        let frame: Option<HostFrame> =
            tokio::time::timeout(Duration::from_secs(5), channel.inbound.recv())
                .await
                .expect("Test timed out");
        assert!(frame.is_none());
    }
}
