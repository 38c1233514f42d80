//! Stdio transport: NDJSON over a spawned child process's pipes.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::codec;
use crate::transport::{
    StateCell, Transport, TransportChannels, TransportKind, TransportState, CHANNEL_CAPACITY,
};

/// Transport that spawns the server as a child process and frames envelopes
/// as NDJSON lines over its stdin/stdout. The child's stderr carries
/// diagnostics only and is surfaced as log lines, never parsed.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    state: StateCell,
    child: Option<Child>,
}

impl StdioTransport {
    /// Create a transport for a launch command line (program + arguments).
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| Error::Config("empty stdio command".to_string()))?
            .to_string();
        Ok(Self::new(command, parts.map(String::from).collect()))
    }

    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            env: HashMap::new(),
            state: StateCell::new(),
            child: None,
        }
    }

    /// Extra environment variables for the child.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn start(&mut self) -> Result<TransportChannels> {
        self.state.advance(TransportState::Connecting);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Connection(format!("failed to spawn {}: {}", self.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Connection("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Connection("child stderr unavailable".to_string()))?;

        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Reader task: one envelope per stdout line.
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!("EOF on child stdout");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!("stdio received: {}", trimmed);
                        match codec::decode_line(trimmed) {
                            Ok(envelope) => {
                                if incoming_tx.send(envelope).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // Scoped to this line; keep reading.
                                warn!("skipping malformed stdio line: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("error reading child stdout: {}", e);
                        break;
                    }
                }
            }
            state.advance(TransportState::Closed);
        });

        // Writer task: envelopes to stdin, flushed per line.
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                let line = match codec::encode_line(&envelope) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("failed to encode envelope: {}", e);
                        continue;
                    }
                };
                trace!("stdio sending: {}", line.trim_end());
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("error writing child stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!("error flushing child stdin: {}", e);
                    break;
                }
            }
            state.advance(TransportState::Closed);
        });

        // Stderr is diagnostics only.
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => debug!("server stderr: {}", line.trim_end()),
                    Err(_) => break,
                }
            }
        });

        self.child = Some(child);
        self.state.advance(TransportState::Ready);

        Ok(TransportChannels {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }

    async fn stop(&mut self) -> Result<()> {
        self.state.advance(TransportState::Closing);
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("child already gone on stop: {}", e);
            }
        }
        self.state.advance(TransportState::Closed);
        Ok(())
    }
}
