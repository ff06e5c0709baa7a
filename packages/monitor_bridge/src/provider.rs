//! Upstream provider backed by an external monitor command.
//!
//! Each acquisition spawns the configured command for one port. Its stdout
//! becomes the message stream and writes go to its stdin. Pausing kills the
//! process but keeps the stream open so that resuming (or a baud change) can
//! respawn into the same channel.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use monitor_hub::{
    MonitorProvider, PortIdentifier, ProtocolSettings, ProviderError, UpstreamConfig,
    UpstreamControl, UpstreamStream,
};

const MESSAGE_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;
const DEFAULT_BAUDRATE: u32 = 9600;
const COMMON_BAUDRATES: [u32; 14] = [
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 74880, 115200, 230400, 250000, 500000,
    1000000,
];

const PLACEHOLDERS: [&str; 4] = ["address", "protocol", "baudrate", "fqbn"];

#[derive(Clone, Debug)]
pub struct CommandProviderConfig {
    /// Program followed by its argument template.
    pub command: Vec<String>,
    /// An exit inside this window counts as a failed open.
    pub startup_grace: Duration,
    pub baudrate_protocols: Vec<String>,
}

/// Values substituted into the command template.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Placeholders {
    pub address: String,
    pub protocol: String,
    pub baudrate: Option<u32>,
    pub fqbn: Option<String>,
}

impl Placeholders {
    fn for_port(port: &PortIdentifier, config: &UpstreamConfig) -> Self {
        Self {
            address: port.address.clone(),
            protocol: port.protocol.clone(),
            baudrate: config.baudrate,
            fqbn: config.fqbn.clone(),
        }
    }

    fn value(&self, name: &str) -> Option<String> {
        match name {
            "address" => Some(self.address.clone()),
            "protocol" => Some(self.protocol.clone()),
            "baudrate" => self.baudrate.map(|b| b.to_string()),
            "fqbn" => self.fqbn.clone(),
            _ => None,
        }
    }
}

/// Fill in the command template. An argument naming an absent value is
/// dropped together with a flag directly before it.
pub fn render_command(template: &[String], values: &Placeholders) -> Vec<String> {
    let mut argv: Vec<String> = Vec::with_capacity(template.len());
    let mut last_was_flag = false;

    for arg in template {
        let mut rendered = arg.clone();
        let mut missing = false;
        for name in PLACEHOLDERS {
            let token = format!("{{{name}}}");
            if !arg.contains(&token) {
                continue;
            }
            match values.value(name) {
                Some(value) => rendered = rendered.replace(&token, &value),
                None => missing = true,
            }
        }

        if missing {
            if last_was_flag {
                argv.pop();
            }
            last_was_flag = false;
            continue;
        }

        last_was_flag = !argv.is_empty() && rendered.starts_with('-');
        argv.push(rendered);
    }
    argv
}

/// Map an early exit onto a provider error using what the command printed.
pub fn classify_exit(stderr: &str, code: Option<i32>) -> ProviderError {
    let message = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("monitor exited with code {code}"),
            None => "monitor exited".to_string(),
        });

    let lower = stderr.to_ascii_lowercase();
    if lower.contains("busy") || lower.contains("in use") {
        ProviderError::Busy(message)
    } else if lower.contains("not found") || lower.contains("no such") {
        ProviderError::NotFound(message)
    } else {
        ProviderError::Other(message)
    }
}

pub struct CommandProvider {
    config: CommandProviderConfig,
}

impl CommandProvider {
    pub fn new(config: CommandProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MonitorProvider for CommandProvider {
    async fn acquire(
        &self,
        port: &PortIdentifier,
        config: &UpstreamConfig,
    ) -> Result<UpstreamStream, ProviderError> {
        if self.config.command.is_empty() {
            return Err(ProviderError::Other("no monitor command configured".into()));
        }

        let (tx, messages) = mpsc::channel(MESSAGE_CAPACITY);
        let link = Arc::new(CommandLink {
            port: port.clone(),
            template: self.config.command.clone(),
            grace: self.config.startup_grace,
            inner: Mutex::new(LinkInner {
                values: Placeholders::for_port(port, config),
                process: None,
                messages: Some(tx),
            }),
            generation: Arc::new(AtomicU64::new(0)),
            paused: AtomicBool::new(false),
        });

        {
            let mut inner = link.inner.lock().await;
            link.spawn(&mut inner).await?;
        }

        // The grace window already passed inside spawn
        let (ready_tx, ready) = oneshot::channel();
        let _ = ready_tx.send(Ok(()));

        Ok(UpstreamStream {
            control: link,
            messages,
            ready,
        })
    }

    async fn describe_settings(&self, protocol: &str) -> Result<ProtocolSettings, ProviderError> {
        let requires_baudrate = self.config.baudrate_protocols.iter().any(|p| p == protocol);
        Ok(ProtocolSettings {
            protocol: protocol.to_string(),
            requires_baudrate,
            default_baudrate: requires_baudrate.then_some(DEFAULT_BAUDRATE),
            supported_baudrates: if requires_baudrate {
                COMMON_BAUDRATES.to_vec()
            } else {
                Vec::new()
            },
        })
    }
}

struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

struct LinkInner {
    values: Placeholders,
    process: Option<RunningProcess>,
    /// Dropped on dispose; the stream ends once the last pump exits.
    messages: Option<mpsc::Sender<Result<Vec<u8>, ProviderError>>>,
}

struct CommandLink {
    port: PortIdentifier,
    template: Vec<String>,
    grace: Duration,
    inner: Mutex<LinkInner>,
    /// Bumped whenever a process is replaced or stopped on purpose. A pump
    /// only reports an exit if its generation is still current.
    generation: Arc<AtomicU64>,
    paused: AtomicBool,
}

impl CommandLink {
    async fn spawn(&self, inner: &mut LinkInner) -> Result<(), ProviderError> {
        let Some(tx) = inner.messages.clone() else {
            return Err(ProviderError::Aborted("monitor disposed".into()));
        };

        let argv = render_command(&self.template, &inner.values);
        let Some((program, args)) = argv.split_first() else {
            return Err(ProviderError::Other("no monitor command configured".into()));
        };
        debug!("Spawning monitor for {}: {:?}", self.port, argv);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Other(format!("failed to start {program}: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        if !self.grace.is_zero() {
            tokio::select! {
                status = child.wait() => {
                    let mut text = String::new();
                    if let Some(mut stderr) = stderr.take() {
                        let _ = stderr.read_to_string(&mut text).await;
                    }
                    let code = status.ok().and_then(|s| s.code());
                    let err = classify_exit(&text, code);
                    warn!("Monitor for {} exited during startup: {}", self.port, err);
                    return Err(err);
                }
                _ = tokio::time::sleep(self.grace) => {}
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(stdout) = stdout {
            tokio::spawn(pump_output(
                stdout,
                tx,
                self.generation.clone(),
                generation,
                self.port.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(stderr, self.port.clone()));
        }

        inner.process = Some(RunningProcess { child, stdin });
        info!("Monitor process for {} started", self.port);
        Ok(())
    }

    async fn stop(&self, inner: &mut LinkInner) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut process) = inner.process.take() {
            drop(process.stdin.take());
            if let Err(e) = process.child.kill().await {
                debug!("Monitor for {} already gone: {}", self.port, e);
            }
        }
    }
}

async fn pump_output<R>(
    mut stdout: R,
    tx: mpsc::Sender<Result<Vec<u8>, ProviderError>>,
    current: Arc<AtomicU64>,
    generation: u64,
    port: PortIdentifier,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Reading monitor output for {} failed: {}", port, e);
                break;
            }
        }
    }

    if current.load(Ordering::SeqCst) == generation {
        let _ = tx
            .send(Err(ProviderError::Aborted(format!(
                "monitor process for {port} exited"
            ))))
            .await;
    }
}

async fn log_stderr<R>(stderr: R, port: PortIdentifier)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{}] {}", port, line);
    }
}

#[async_trait]
impl UpstreamControl for CommandLink {
    async fn send_message(&self, data: &[u8]) -> Result<usize, ProviderError> {
        let mut inner = self.inner.lock().await;
        let stdin = inner
            .process
            .as_mut()
            .and_then(|p| p.stdin.as_mut())
            .ok_or_else(|| ProviderError::Aborted("monitor is not running".into()))?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| ProviderError::Other(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProviderError::Other(format!("flush failed: {e}")))?;
        Ok(data.len())
    }

    async fn update_baudrate(&self, baudrate: u32) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        inner.values.baudrate = Some(baudrate);
        if inner.process.is_some() {
            self.stop(&mut inner).await;
            self.spawn(&mut inner).await?;
        }
        info!("Monitor for {} now at {} baud", self.port, baudrate);
        Ok(())
    }

    async fn pause(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        self.paused.store(true, Ordering::SeqCst);
        self.stop(&mut inner).await;
        Ok(())
    }

    async fn resume(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        if inner.process.is_none() {
            self.spawn(&mut inner).await?;
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        self.stop(&mut inner).await;
        inner.messages = None;
        debug!("Monitor for {} disposed", self.port);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
