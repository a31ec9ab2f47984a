/*
   Polar (OSS)

   Copyright 2024 Carnegie Mellon University.

   NO WARRANTY. THIS CARNEGIE MELLON UNIVERSITY AND SOFTWARE ENGINEERING INSTITUTE MATERIAL IS
   FURNISHED ON AN "AS-IS" BASIS. CARNEGIE MELLON UNIVERSITY MAKES NO WARRANTIES OF ANY KIND,
   EITHER EXPRESSED OR IMPLIED, AS TO ANY MATTER INCLUDING, BUT NOT LIMITED TO, WARRANTY OF FITNESS
   FOR PURPOSE OR MERCHANTABILITY, EXCLUSIVITY, OR RESULTS OBTAINED FROM USE OF THE MATERIAL.
   CARNEGIE MELLON UNIVERSITY DOES NOT MAKE ANY WARRANTY OF ANY KIND WITH RESPECT TO FREEDOM FROM
   PATENT, TRADEMARK, OR COPYRIGHT INFRINGEMENT.

   Licensed under a MIT-style license, please see license.txt or contact permission@sei.cmu.edu for
   full terms.

   [DISTRIBUTION STATEMENT A] This material has been approved for public release and unlimited
   distribution.  Please see Copyright notice for non-US Government use and distribution.

   This Software includes and/or makes use of Third-Party Software each subject to its own license.

   DM24-0470
*/

//! Building the producer's command line and forwarding its raw output.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil::events::RAW_LOG_KIND;
use vigil::{Config, ConfigError, Event, LogLine, CONFIG_ENV_VAR};
use vigil_channel::ChannelEndpoint;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no command given to launch")]
    EmptyCommand,
    #[error("failed to hand configuration to the producer: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Runs the command as given.
    Fixed,
    /// Asks the producer's own process manager to restart on source changes.
    Reload,
}

/// The producer command and how to run it.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: String,
    args: Vec<String>,
    mode: LaunchMode,
    reload_dirs: Vec<PathBuf>,
}

impl LaunchSpec {
    /// Takes the command line as `program args...`. The mode follows `config.reload`.
    pub fn new(command: Vec<String>, config: &Config) -> Result<Self, LaunchError> {
        let mut command = command.into_iter();
        let program = command.next().ok_or(LaunchError::EmptyCommand)?;
        Ok(LaunchSpec {
            program,
            args: command.collect(),
            mode: if config.reload {
                LaunchMode::Reload
            } else {
                LaunchMode::Fixed
            },
            reload_dirs: config.reload_dirs.clone(),
        })
    }

    pub fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    /// Arguments passed to the program, including the reload flags.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if self.mode == LaunchMode::Reload {
            args.push("--reload".to_string());
            for dir in &self.reload_dirs {
                args.push("--reload-dir".to_string());
                args.push(dir.display().to_string());
            }
        }
        args
    }

    /// A command with piped output and the configuration and channel bootstrap variables
    /// set. Nothing is spawned yet.
    pub fn command(&self, endpoint: &ChannelEndpoint, config: &Config) -> Result<Command, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args())
            .env(CONFIG_ENV_VAR, config.to_payload()?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        endpoint.export(&mut command);
        Ok(command)
    }
}

/// Republishes each non-empty line of `output` as a `RAW` log event until end of file or
/// cancellation. Returns the number of lines forwarded.
///
/// Lines are decoded lossily. The pipe is read to the end even once the event queue is
/// gone, since closing it early would fail the producer's next write.
pub async fn forward_output<R>(
    output: R,
    stream: &'static str,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    let mut forwarded = 0;
    let mut queue_open = true;
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if line.is_empty() || !queue_open {
                    continue;
                }
                let event = Event::Log(LogLine::new("INFO", line).with_kind(RAW_LOG_KIND));
                if events.send(event).await.is_err() {
                    debug!("Event queue closed, discarding the rest of producer {stream}");
                    queue_open = false;
                    continue;
                }
                forwarded += 1;
            }
            Err(e) => {
                warn!("Failed to read producer {stream}: {e}");
                break;
            }
        }
    }
    debug!("Forwarded {forwarded} lines of producer {stream}");
    forwarded
}
