//! Shared test fixtures: an in-memory two-node mesh with loss injection,
//! a recording sink, and blob generators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use pixmesh_core::buffer::TransferKey;
use pixmesh_core::control;
use pixmesh_core::error::{FailureKind, Result};
use pixmesh_core::frame;
use pixmesh_core::link::{InboundFrame, LinkDriver, LinkSession, NodeId, SendOutcome};
use pixmesh_core::progress::{TransferProgress, TransferSink};
use pixmesh_core::DEFAULT_PORT;

/// Camera-side node id.
pub const NODE_A: NodeId = 0x11AA_0001;

/// Gallery-side node id.
pub const NODE_B: NodeId = 0x22BB_0002;

const INBOUND_QUEUE_DEPTH: usize = 256;

/// In-memory radio: routes datagrams to peer inbound queues and injects
/// scripted failures.
pub struct TestLink {
    node: NodeId,
    routes: HashMap<NodeId, mpsc::Sender<InboundFrame>>,
    /// Data chunk indices to silently lose once (link ack still succeeds).
    drop_data_once: Mutex<HashSet<u8>>,
    /// Number of upcoming data sends that report no link ack.
    fail_acks: AtomicU32,
    /// Data frames handed to the mesh.
    pub data_sent: AtomicU32,
    /// Control frames handed to the mesh, in order.
    pub controls_sent: Mutex<Vec<Vec<u8>>>,
}

impl TestLink {
    fn new(node: NodeId, routes: HashMap<NodeId, mpsc::Sender<InboundFrame>>) -> Self {
        Self {
            node,
            routes,
            drop_data_once: Mutex::new(HashSet::new()),
            fail_acks: AtomicU32::new(0),
            data_sent: AtomicU32::new(0),
            controls_sent: Mutex::new(Vec::new()),
        }
    }

    /// Silently lose the first transmission of each listed chunk index.
    pub fn drop_data_once(&self, indices: impl IntoIterator<Item = u8>) {
        self.drop_data_once.lock().unwrap().extend(indices);
    }

    /// Make the next `count` data sends report `AckTimeout` undelivered.
    pub fn fail_next_acks(&self, count: u32) {
        self.fail_acks.store(count, Ordering::SeqCst);
    }

    /// Control frames sent so far, decoded to strings.
    pub fn control_log(&self) -> Vec<String> {
        self.controls_sent
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

#[async_trait]
impl LinkDriver for TestLink {
    async fn send(
        &self,
        dest: NodeId,
        _port: u16,
        payload: &[u8],
        _want_ack: bool,
    ) -> Result<SendOutcome> {
        let is_control = matches!(control::classify(payload), control::FrameKind::Control(_));

        if is_control {
            self.controls_sent.lock().unwrap().push(payload.to_vec());
        } else {
            self.data_sent.fetch_add(1, Ordering::SeqCst);

            if self
                .fail_acks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Ok(SendOutcome::AckTimeout);
            }

            if let Ok((header, _)) = frame::decode_chunk(payload) {
                if self.drop_data_once.lock().unwrap().remove(&header.chunk_index) {
                    // Acked at the link layer but lost downstream.
                    return Ok(SendOutcome::AckOk);
                }
            }
        }

        if let Some(route) = self.routes.get(&dest) {
            let frame = InboundFrame {
                peer: self.node,
                payload: payload.to_vec(),
            };
            let _ = route.send(frame).await;
        }
        Ok(SendOutcome::AckOk)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One simulated mesh node: driver, open session, and its inbound queue.
/// `inject` feeds the inbound queue directly, bypassing any radio.
pub struct Node {
    pub id: NodeId,
    pub driver: Arc<TestLink>,
    pub link: Arc<LinkSession>,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
    pub inject: mpsc::Sender<InboundFrame>,
}

impl Node {
    /// Take the inbound queue to hand to a receiver engine.
    pub fn take_inbound(&mut self) -> mpsc::Receiver<InboundFrame> {
        self.inbound.take().expect("inbound already taken")
    }

    /// Deliver a raw frame to this node as if `peer` had sent it.
    pub async fn deliver(&self, peer: NodeId, payload: Vec<u8>) {
        self.inject
            .send(InboundFrame { peer, payload })
            .await
            .expect("inbound queue open");
    }
}

/// Install a subscriber once so `RUST_LOG=debug` surfaces engine traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a two-node mesh with working routes in both directions.
pub fn mesh_pair() -> (Node, Node) {
    init_tracing();

    let (tx_a, rx_a) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    let (tx_b, rx_b) = mpsc::channel(INBOUND_QUEUE_DEPTH);

    let driver_a = Arc::new(TestLink::new(NODE_A, HashMap::from([(NODE_B, tx_b.clone())])));
    let driver_b = Arc::new(TestLink::new(NODE_B, HashMap::from([(NODE_A, tx_a.clone())])));

    let link_a = Arc::new(
        LinkSession::open(Arc::clone(&driver_a) as Arc<dyn LinkDriver>, DEFAULT_PORT)
            .expect("open link a"),
    );
    let link_b = Arc::new(
        LinkSession::open(Arc::clone(&driver_b) as Arc<dyn LinkDriver>, DEFAULT_PORT)
            .expect("open link b"),
    );

    (
        Node {
            id: NODE_A,
            driver: driver_a,
            link: link_a,
            inbound: Some(rx_a),
            inject: tx_a,
        },
        Node {
            id: NODE_B,
            driver: driver_b,
            link: link_b,
            inbound: Some(rx_b),
            inject: tx_b,
        },
    )
}

/// Sink that records everything it sees.
#[derive(Default)]
pub struct RecordingSink {
    pub completions: Mutex<Vec<(TransferKey, Vec<u8>)>>,
    pub failures: Mutex<Vec<(TransferKey, FailureKind)>>,
    pub progress_events: AtomicU32,
}

impl RecordingSink {
    pub fn completed_blobs(&self) -> Vec<Vec<u8>> {
        self.completions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, blob)| blob.clone())
            .collect()
    }

    pub fn failure_kinds(&self) -> Vec<FailureKind> {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .map(|(_, kind)| *kind)
            .collect()
    }
}

impl TransferSink for RecordingSink {
    fn on_progress(&self, _key: &TransferKey, _progress: &TransferProgress) {
        self.progress_events.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self, key: &TransferKey, blob: Vec<u8>) {
        self.completions.lock().unwrap().push((*key, blob));
    }

    fn on_failure(&self, key: &TransferKey, kind: FailureKind) {
        self.failures.lock().unwrap().push((*key, kind));
    }
}

/// Sink for nodes whose inbound traffic is control-only.
pub struct NullSink;

impl TransferSink for NullSink {
    fn on_complete(&self, _key: &TransferKey, _blob: Vec<u8>) {}
    fn on_failure(&self, _key: &TransferKey, _kind: FailureKind) {}
}

/// Deterministic incompressible bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Deterministic highly redundant bytes.
pub fn redundant_bytes(len: usize) -> Vec<u8> {
    b"sensor frame 0001 unchanged "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Poll a condition under virtual time until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {budget:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
