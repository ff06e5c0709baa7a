//! Monitor acquisition layer.
//!
//! Wraps the upstream provider: checks discovery, classifies provider
//! failures, primes the fresh stream, and exposes pause/resume/dispose on the
//! resulting [`MonitorLink`] without touching any subscriber state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::discovery::PortDiscovery;
use crate::error::MonitorError;
use crate::port::PortIdentifier;
use crate::provider::{
    MessageStream, MonitorProvider, ProtocolSettings, ProviderError, UpstreamConfig,
    UpstreamControl,
};

/// How long a fresh stream may take to report readiness before we carry on.
pub const DEFAULT_PRIMING_TIMEOUT: Duration = Duration::from_millis(500);

/// Link state as seen by the hub's read loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Running,
    Paused,
    Disposed,
}

/// How priming ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimingOutcome {
    /// The provider signalled readiness.
    Ready,
    /// The readiness signal never came within the priming window.
    TimedOut,
    /// The provider dropped its readiness sender without answering.
    NoSignal,
}

/// Result of priming: the outcome plus any bytes that arrived early, in order.
#[derive(Debug)]
pub struct Primed {
    pub outcome: PrimingOutcome,
    pub pending: Vec<Vec<u8>>,
}

/// Race readiness against incoming data, bounded by `timeout`.
///
/// Data arriving before readiness is held back and returned in `pending` so
/// the caller can flush it once the stream is installed.
pub async fn prime(
    mut ready: oneshot::Receiver<Result<(), ProviderError>>,
    messages: &mut MessageStream,
    timeout: Duration,
) -> Result<Primed, ProviderError> {
    let deadline = Instant::now() + timeout;
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            biased;
            signal = &mut ready => {
                let outcome = match signal {
                    Ok(Ok(())) => PrimingOutcome::Ready,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => PrimingOutcome::NoSignal,
                };
                return Ok(Primed { outcome, pending });
            }
            chunk = messages.recv() => match chunk {
                Some(Ok(bytes)) => pending.push(bytes),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProviderError::Aborted(
                        "stream closed before it became ready".into(),
                    ));
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(Primed { outcome: PrimingOutcome::TimedOut, pending });
            }
        }
    }
}

/// Map a provider failure onto the public taxonomy.
pub fn classify(port: &PortIdentifier, err: ProviderError) -> MonitorError {
    match err {
        ProviderError::Busy(msg) => MonitorError::PortBusy(format!("{port}: {msg}")),
        ProviderError::NotFound(_) => MonitorError::PortNotDetected(port.to_string()),
        ProviderError::Aborted(msg) | ProviderError::Other(msg) => {
            MonitorError::MonitorOpenFailed(msg)
        }
    }
}

/// An acquired upstream stream. Shared between the session that owns it and
/// its read loop; nothing else holds it.
pub struct MonitorLink {
    port: PortIdentifier,
    control: Arc<dyn UpstreamControl>,
    state: watch::Sender<LinkState>,
    pauses: AtomicU64,
    disposed: AtomicBool,
}

impl MonitorLink {
    pub fn new(port: PortIdentifier, control: Arc<dyn UpstreamControl>) -> Self {
        let (state, _) = watch::channel(LinkState::Running);
        Self {
            port,
            control,
            state,
            pauses: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == LinkState::Paused
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Number of pauses so far. A reader compares this against the last value
    /// it saw to recognise aborts queued by a pause it has not yet observed.
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::SeqCst)
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, MonitorError> {
        self.control
            .send_message(data)
            .await
            .map_err(|e| MonitorError::MonitorOpenFailed(format!("write to {} failed: {e}", self.port)))
    }

    pub async fn update_baudrate(&self, baudrate: u32) -> Result<(), MonitorError> {
        self.control
            .update_baudrate(baudrate)
            .await
            .map_err(|e| classify(&self.port, e))
    }

    /// Release the hardware. The state flips to paused before the provider is
    /// told, so transport aborts caused by the pause are recognised as such.
    pub async fn pause(&self) -> Result<(), MonitorError> {
        if self.state() != LinkState::Running {
            return Ok(());
        }
        self.state.send_replace(LinkState::Paused);
        self.pauses.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.control.pause().await {
            warn!("Failed to pause monitor on {}: {}", self.port, e);
            self.state.send_replace(LinkState::Running);
            return Err(classify(&self.port, e));
        }
        info!("Monitor on {} paused", self.port);
        Ok(())
    }

    /// Reacquire the hardware and let the read loop continue.
    pub async fn resume(&self) -> Result<(), MonitorError> {
        if self.state() != LinkState::Paused {
            return Ok(());
        }
        self.control
            .resume()
            .await
            .map_err(|e| classify(&self.port, e))?;
        self.state.send_replace(LinkState::Running);
        info!("Monitor on {} resumed", self.port);
        Ok(())
    }

    /// Idempotent teardown.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(LinkState::Disposed);
        self.control.dispose().await;
        debug!("Monitor link on {} disposed", self.port);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// A primed link, its message stream, and the bytes that arrived during priming.
pub struct AcquiredLink {
    pub link: Arc<MonitorLink>,
    pub messages: MessageStream,
    pub pending: Vec<Vec<u8>>,
}

pub struct MonitorAcquirer {
    provider: Arc<dyn MonitorProvider>,
    discovery: Arc<dyn PortDiscovery>,
    priming_timeout: Duration,
}

impl MonitorAcquirer {
    pub fn new(
        provider: Arc<dyn MonitorProvider>,
        discovery: Arc<dyn PortDiscovery>,
        priming_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            discovery,
            priming_timeout,
        }
    }

    pub async fn acquire(
        &self,
        port: &PortIdentifier,
        config: &UpstreamConfig,
    ) -> Result<AcquiredLink, MonitorError> {
        if !self.discovery.is_detected(port) {
            return Err(MonitorError::PortNotDetected(port.to_string()));
        }

        debug!("Acquiring monitor on {} ({:?})", port, config);
        let stream = self
            .provider
            .acquire(port, config)
            .await
            .map_err(|e| classify(port, e))?;

        let link = Arc::new(MonitorLink::new(port.clone(), stream.control));
        let mut messages = stream.messages;

        let primed = match prime(stream.ready, &mut messages, self.priming_timeout).await {
            Ok(primed) => primed,
            Err(e) => {
                link.dispose().await;
                return Err(classify(port, e));
            }
        };

        match primed.outcome {
            PrimingOutcome::Ready => debug!("Monitor on {} ready", port),
            PrimingOutcome::TimedOut => warn!(
                "Monitor on {} did not report ready within {:?}, continuing",
                port, self.priming_timeout
            ),
            PrimingOutcome::NoSignal => debug!("Monitor on {} gave no readiness signal", port),
        }

        info!(
            "Monitor acquired on {} ({} chunk(s) buffered during priming)",
            port,
            primed.pending.len()
        );

        Ok(AcquiredLink {
            link,
            messages,
            pending: primed.pending,
        })
    }

    pub async fn describe_settings(&self, protocol: &str) -> Result<ProtocolSettings, MonitorError> {
        self.provider
            .describe_settings(protocol)
            .await
            .map_err(|e| MonitorError::SettingsUnavailable {
                protocol: protocol.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryWatcher;
    use crate::test_helpers::MockProvider;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn prime_buffers_early_bytes_until_ready() {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(Ok(b"boot".to_vec())).await.unwrap();
        tx.send(Ok(b"loader".to_vec())).await.unwrap();

        let handle = tokio::spawn(async move {
            let primed = prime(ready_rx, &mut rx, Duration::from_secs(1)).await;
            (primed, rx)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ready_tx.send(Ok(())).unwrap();

        let (primed, _rx) = handle.await.unwrap();
        let primed = primed.unwrap();
        assert_eq!(primed.outcome, PrimingOutcome::Ready);
        assert_eq!(primed.pending, vec![b"boot".to_vec(), b"loader".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn prime_times_out_and_keeps_data() {
        let (_ready_tx, ready_rx) = oneshot::channel::<Result<(), ProviderError>>();
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(Ok(b"x".to_vec())).await.unwrap();

        let primed = prime(ready_rx, &mut rx, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(primed.outcome, PrimingOutcome::TimedOut);
        assert_eq!(primed.pending, vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn prime_without_signal_proceeds() {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ProviderError>>();
        drop(ready_tx);
        let (_tx, mut rx) = mpsc::channel(8);

        let primed = prime(ready_rx, &mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(primed.outcome, PrimingOutcome::NoSignal);
        assert!(primed.pending.is_empty());
    }

    #[tokio::test]
    async fn prime_propagates_ready_failure() {
        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(Err(ProviderError::Other("bad config".into()))).unwrap();
        let (_tx, mut rx) = mpsc::channel(8);

        let err = prime(ready_rx, &mut rx, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, ProviderError::Other("bad config".into()));
    }

    #[test]
    fn classify_provider_errors() {
        let port = PortIdentifier::new("serial", "COM3");
        assert_eq!(
            classify(&port, ProviderError::Busy("locked".into())).code(),
            "port-busy"
        );
        assert_eq!(
            classify(&port, ProviderError::NotFound("gone".into())).code(),
            "port-not-detected"
        );
        let err = classify(&port, ProviderError::Other("permission denied".into()));
        assert_eq!(err, MonitorError::MonitorOpenFailed("permission denied".into()));
    }

    #[tokio::test]
    async fn acquire_checks_discovery_first() {
        let provider = Arc::new(MockProvider::new());
        let discovery = Arc::new(DiscoveryWatcher::new(true));
        let acquirer = MonitorAcquirer::new(provider.clone(), discovery, DEFAULT_PRIMING_TIMEOUT);

        let port = PortIdentifier::new("serial", "COM3");
        let err = acquirer
            .acquire(&port, &UpstreamConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "port-not-detected");
        assert_eq!(provider.acquire_calls(), 0);
    }

    #[tokio::test]
    async fn acquire_maps_busy_failures() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_next(ProviderError::Busy("claimed by another program".into()));
        let acquirer = MonitorAcquirer::new(
            provider.clone(),
            Arc::new(DiscoveryWatcher::default()),
            DEFAULT_PRIMING_TIMEOUT,
        );

        let err = acquirer
            .acquire(&PortIdentifier::new("serial", "COM3"), &UpstreamConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "port-busy");
    }

    #[tokio::test]
    async fn pause_resume_and_dispose_are_idempotent() {
        let provider = Arc::new(MockProvider::new());
        let acquirer = MonitorAcquirer::new(
            provider.clone(),
            Arc::new(DiscoveryWatcher::default()),
            DEFAULT_PRIMING_TIMEOUT,
        );
        let acquired = acquirer
            .acquire(&PortIdentifier::new("serial", "COM3"), &UpstreamConfig::default())
            .await
            .unwrap();
        let link = acquired.link;
        let handle = provider.handle(0);

        link.pause().await.unwrap();
        link.pause().await.unwrap();
        assert!(link.is_paused());
        assert_eq!(handle.pause_calls(), 1);

        link.resume().await.unwrap();
        link.resume().await.unwrap();
        assert_eq!(link.state(), LinkState::Running);
        assert_eq!(handle.resume_calls(), 1);

        link.dispose().await;
        link.dispose().await;
        assert!(link.is_disposed());
        assert_eq!(handle.dispose_calls(), 1);
        assert_eq!(link.state(), LinkState::Disposed);
        assert_eq!(link.pause_count(), 1);
    }
}
