//! In-memory monitor provider for tests.
//!
//! Counts acquisitions, can delay or fail them, can slow down pause and
//! dispose on the handles it creates, and hands out a
//! [`MockHandle`] per acquisition so a test can push device output or
//! simulate a transport abort.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::port::PortIdentifier;
use crate::provider::{
    MonitorProvider, ProtocolSettings, ProviderError, UpstreamConfig, UpstreamControl,
    UpstreamStream,
};

type MessageTx = mpsc::Sender<Result<Vec<u8>, ProviderError>>;

pub struct MockHandle {
    pub port: PortIdentifier,
    pub config: UpstreamConfig,
    tx: Mutex<Option<MessageTx>>,
    paused: AtomicBool,
    written: Mutex<Vec<u8>>,
    baudrates: Mutex<Vec<u32>>,
    pause_calls: AtomicUsize,
    pauses_completed: AtomicUsize,
    resume_calls: AtomicUsize,
    dispose_calls: AtomicUsize,
    pause_delay: Duration,
    dispose_delay: Duration,
}

impl MockHandle {
    fn sender(&self) -> Option<MessageTx> {
        self.tx.lock().unwrap().clone()
    }

    /// Push device output onto the message stream.
    pub async fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(Ok(data.to_vec())).await;
        }
    }

    /// Simulate a transport failure.
    pub async fn abort(&self, reason: &str) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(Err(ProviderError::Aborted(reason.into()))).await;
        }
    }

    /// Simulate the device going away: the message stream ends.
    pub fn close_stream(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn baudrates(&self) -> Vec<u32> {
        self.baudrates.lock().unwrap().clone()
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    /// Pauses that have finished parking the hardware.
    pub fn pauses_completed(&self) -> usize {
        self.pauses_completed.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn dispose_calls(&self) -> usize {
        self.dispose_calls.load(Ordering::SeqCst)
    }

    /// True once a dispose has finished.
    pub fn is_disposed(&self) -> bool {
        self.dispose_calls() > 0
    }
}

#[async_trait]
impl UpstreamControl for MockHandle {
    async fn send_message(&self, data: &[u8]) -> Result<usize, ProviderError> {
        // Yield so concurrent writers get a chance to interleave if unserialized
        tokio::task::yield_now().await;
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    async fn update_baudrate(&self, baudrate: u32) -> Result<(), ProviderError> {
        self.baudrates.lock().unwrap().push(baudrate);
        Ok(())
    }

    async fn pause(&self) -> Result<(), ProviderError> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        if !self.pause_delay.is_zero() {
            tokio::time::sleep(self.pause_delay).await;
        }
        self.paused.store(true, Ordering::SeqCst);
        // Releasing the hardware aborts the in-flight read
        if let Some(tx) = self.sender() {
            let _ = tx
                .send(Err(ProviderError::Aborted("connection released".into())))
                .await;
        }
        self.pauses_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), ProviderError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) {
        if !self.dispose_delay.is_zero() {
            tokio::time::sleep(self.dispose_delay).await;
        }
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockProvider {
    acquire_calls: AtomicUsize,
    acquire_delay: Mutex<Duration>,
    pause_delay: Mutex<Duration>,
    dispose_delay: Mutex<Duration>,
    fail_next: Mutex<Option<ProviderError>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
    settings: Mutex<HashMap<String, ProtocolSettings>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every acquisition, to widen race windows.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.acquire_delay.lock().unwrap() = delay;
        self
    }

    /// Make every handle take `delay` to park on pause.
    pub fn with_pause_delay(self, delay: Duration) -> Self {
        *self.pause_delay.lock().unwrap() = delay;
        self
    }

    /// Make every handle take `delay` to tear down.
    pub fn with_dispose_delay(self, delay: Duration) -> Self {
        *self.dispose_delay.lock().unwrap() = delay;
        self
    }

    pub fn fail_next(&self, err: ProviderError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn set_settings(&self, settings: ProtocolSettings) {
        self.settings
            .lock()
            .unwrap()
            .insert(settings.protocol.clone(), settings);
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// The handle from the `n`th successful acquisition.
    pub fn handle(&self, n: usize) -> Arc<MockHandle> {
        self.handles.lock().unwrap()[n].clone()
    }

    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        self.handles.lock().unwrap().clone()
    }

    pub fn live_handles(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !h.is_disposed())
            .count()
    }
}

#[async_trait]
impl MonitorProvider for MockProvider {
    async fn acquire(
        &self,
        port: &PortIdentifier,
        config: &UpstreamConfig,
    ) -> Result<UpstreamStream, ProviderError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.acquire_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }

        let (tx, messages) = mpsc::channel(64);
        let handle = Arc::new(MockHandle {
            port: port.clone(),
            config: config.clone(),
            tx: Mutex::new(Some(tx)),
            paused: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            baudrates: Mutex::new(Vec::new()),
            pause_calls: AtomicUsize::new(0),
            pauses_completed: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
            pause_delay: *self.pause_delay.lock().unwrap(),
            dispose_delay: *self.dispose_delay.lock().unwrap(),
        });
        self.handles.lock().unwrap().push(handle.clone());

        let (ready_tx, ready) = oneshot::channel();
        let _ = ready_tx.send(Ok(()));

        Ok(UpstreamStream {
            control: handle,
            messages,
            ready,
        })
    }

    async fn describe_settings(&self, protocol: &str) -> Result<ProtocolSettings, ProviderError> {
        self.settings
            .lock()
            .unwrap()
            .get(protocol)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("no settings for {protocol}")))
    }
}
