use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use monitor_hub::{
    ChannelSink, ClientId, DiscoveryWatcher, HubConfig, MonitorAcquirer, MonitorHub, MonitorKey,
    MonitorProvider, OpenRequest, PortIdentifier, ProtocolSettings, ProviderError, RingBuffer,
    UpstreamConfig, UpstreamControl, UpstreamStream,
};

// --- Ring buffer ---

/// Split `data` at the given (unsorted, possibly repeated) cut points.
fn segment(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.push(0);
    points.push(data.len());
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|w| data[w[0]..w[1]].to_vec()).collect()
}

proptest! {
    #[test]
    fn tail_is_independent_of_chunking(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        cuts in proptest::collection::vec(any::<usize>(), 0..16),
        capacity in 1usize..256,
        n in 0usize..600,
    ) {
        let mut chunked = RingBuffer::new(capacity);
        for chunk in segment(&data, &cuts) {
            chunked.push(&chunk);
        }
        let mut whole = RingBuffer::new(capacity);
        whole.push(&data);

        let expected_len = n.min(data.len()).min(capacity);
        let expected = &data[data.len() - expected_len..];
        prop_assert_eq!(chunked.tail(n), expected.to_vec());
        prop_assert_eq!(whole.tail(n), expected.to_vec());
        prop_assert!(chunked.len() <= chunked.capacity());
    }

    #[test]
    fn capacity_never_shrinks(
        initial in 1usize..1024,
        requests in proptest::collection::vec(0usize..4096, 0..20),
    ) {
        let mut ring = RingBuffer::new(initial);
        let mut previous = ring.capacity();
        for request in requests {
            ring.ensure_capacity(request);
            prop_assert!(ring.capacity() >= previous);
            prop_assert!(ring.capacity() >= request.min(monitor_hub::ring_buffer::MAX_RING_CAPACITY));
            previous = ring.capacity();
        }
    }
}

// --- Monitor keys ---

fn arb_key() -> impl Strategy<Value = MonitorKey> {
    (
        "[a-z][a-z0-9]{0,7}",
        "[A-Za-z0-9/._:-]{1,24}",
        proptest::option::of(1u32..4_000_000),
        "[0-9a-f]{8}",
    )
        .prop_map(|(protocol, address, baudrate, hash)| {
            MonitorKey::new(PortIdentifier::new(protocol, address), baudrate, hash)
        })
}

proptest! {
    #[test]
    fn canonical_form_parses_back(key in arb_key()) {
        let parsed = MonitorKey::parse(&key.to_string()).unwrap();
        prop_assert_eq!(parsed, key);
    }

    #[test]
    fn rebauding_keeps_port_identity(key in arb_key(), baud in 1u32..4_000_000) {
        let changed = key.with_baudrate(baud);
        prop_assert_eq!(&changed.port, &key.port);
        prop_assert_eq!(&changed.options_hash, &key.options_hash);
        prop_assert_eq!(
            PortIdentifier::parse(&changed.to_string()).unwrap(),
            key.port.clone()
        );
    }
}

// --- Acquisition de-duplication ---

struct IdleControl;

#[async_trait]
impl UpstreamControl for IdleControl {
    async fn send_message(&self, data: &[u8]) -> Result<usize, ProviderError> {
        Ok(data.len())
    }
    async fn update_baudrate(&self, _baudrate: u32) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn pause(&self) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn resume(&self) -> Result<(), ProviderError> {
        Ok(())
    }
    async fn dispose(&self) {}
    fn is_paused(&self) -> bool {
        false
    }
}

/// Counts acquisitions; each one takes a little while to complete.
#[derive(Default)]
struct CountingProvider {
    acquires: AtomicUsize,
    senders: std::sync::Mutex<Vec<mpsc::Sender<Result<Vec<u8>, ProviderError>>>>,
}

#[async_trait]
impl MonitorProvider for CountingProvider {
    async fn acquire(
        &self,
        _port: &PortIdentifier,
        _config: &UpstreamConfig,
    ) -> Result<UpstreamStream, ProviderError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (tx, messages) = mpsc::channel(8);
        self.senders.lock().unwrap().push(tx);
        let (ready_tx, ready) = oneshot::channel();
        let _ = ready_tx.send(Ok(()));
        Ok(UpstreamStream {
            control: Arc::new(IdleControl),
            messages,
            ready,
        })
    }

    async fn describe_settings(&self, protocol: &str) -> Result<ProtocolSettings, ProviderError> {
        Err(ProviderError::NotFound(protocol.to_string()))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn racing_subscribers_acquire_once(clients in 1usize..8, tail in 0usize..64) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let acquires = runtime.block_on(async move {
            let provider = Arc::new(CountingProvider::default());
            let acquirer = MonitorAcquirer::new(
                provider.clone(),
                Arc::new(DiscoveryWatcher::default()),
                Duration::from_millis(50),
            );
            let hub = MonitorHub::new(acquirer, HubConfig::default());
            let key = MonitorKey::parse("serial://COM3@9600#h1").unwrap();

            let mut ids = Vec::new();
            for n in 0..clients {
                let request = OpenRequest::new(key.clone(), ClientId::new(format!("c{n}")));
                ids.push(hub.open(request).await.unwrap());
            }

            let mut receivers = Vec::new();
            let subscribes = ids.iter().map(|id| {
                let (sink, rx) = ChannelSink::new(8);
                receivers.push(rx);
                hub.subscribe(*id, tail, sink)
            });
            let results = futures::future::join_all(subscribes.collect::<Vec<_>>()).await;
            assert!(results.iter().all(|r| r.is_ok()));
            assert_eq!(hub.sessions().await[0].subscriber_count, clients);
            provider.acquires.load(Ordering::SeqCst)
        });

        prop_assert_eq!(acquires, 1);
    }
}
