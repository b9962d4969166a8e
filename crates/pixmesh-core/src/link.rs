//! Mesh link driver contract.
//!
//! The transport does not talk to radios directly. It consumes a
//! [`LinkDriver`]: a datagram send with optional link-layer acknowledgement
//! plus an inbound delivery path, as provided by a Meshtastic-class mesh
//! stack. Data chunks and control strings share a single port.
//!
//! The radio is a single-writer resource. [`LinkSession`] enforces at most
//! one open session per driver, which in a one-radio process means one
//! session per process, and adds the pause/resume gate an orchestrator uses
//! to quiesce the radio before handing it to a subprocess. A second process
//! grabbing the same radio is the driver's problem and surfaces as a driver
//! open error before this layer is reached.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Mesh node identifier (Meshtastic node number).
pub type NodeId = u32;

/// Per-datagram result reported by the link driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Peer acknowledged the datagram at the link layer
    AckOk,
    /// No link-layer acknowledgement arrived in time
    AckTimeout,
    /// The driver failed to transmit the datagram
    LinkError,
}

/// One inbound datagram delivered by the link driver.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Originating mesh node
    pub peer: NodeId,
    /// Raw datagram payload
    pub payload: Vec<u8>,
}

/// Datagram link to the mesh.
///
/// `send` resolves once the driver knows the fate of the datagram: an
/// acknowledgement, an acknowledgement timeout, or a transmit error. A
/// fatal loss of the underlying session surfaces as
/// [`Error::LinkSessionLost`] and ends the in-flight transfer.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Send one datagram to `dest` on `port`.
    async fn send(
        &self,
        dest: NodeId,
        port: u16,
        payload: &[u8],
        want_ack: bool,
    ) -> Result<SendOutcome>;

    /// Tear down the link.
    async fn close(&self) -> Result<()>;
}

static OPEN_LINKS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

fn driver_key(driver: &Arc<dyn LinkDriver>) -> usize {
    Arc::as_ptr(driver).cast::<()>() as usize
}

/// The single-writer handle to one mesh radio.
pub struct LinkSession {
    driver: Arc<dyn LinkDriver>,
    key: usize,
    port: u16,
    paused: watch::Sender<bool>,
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("port", &self.port)
            .field("paused", &*self.paused.borrow())
            .finish_non_exhaustive()
    }
}

impl LinkSession {
    /// Open the exclusive session for this driver on the given port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LinkBusy`] if a session for this driver is already
    /// open; the caller must drop it before opening another.
    pub fn open(driver: Arc<dyn LinkDriver>, port: u16) -> Result<Self> {
        let key = driver_key(&driver);
        let mut open = OPEN_LINKS
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !open.insert(key) {
            return Err(Error::LinkBusy);
        }
        drop(open);

        let (paused, _) = watch::channel(false);
        tracing::info!(port, "link session opened");
        Ok(Self {
            driver,
            key,
            port,
            paused,
        })
    }

    /// Port shared by data chunks and control strings.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Quiesce the link. In-flight `send` calls complete; new ones wait
    /// until [`Self::resume`].
    pub fn pause(&self) {
        tracing::info!("link paused");
        self.paused.send_replace(true);
    }

    /// Reopen the gate closed by [`Self::pause`].
    pub fn resume(&self) {
        tracing::info!("link resumed");
        self.paused.send_replace(false);
    }

    /// Whether the link is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Send one datagram, waiting out any pause first.
    ///
    /// # Errors
    ///
    /// Propagates driver errors; [`Error::LinkSessionLost`] is fatal for
    /// the in-flight transfer.
    pub async fn send(&self, dest: NodeId, payload: &[u8], want_ack: bool) -> Result<SendOutcome> {
        let mut gate = self.paused.subscribe();
        gate.wait_for(|paused| !paused)
            .await
            .map_err(|_| Error::LinkSessionLost)?;

        self.driver.send(dest, self.port, payload, want_ack).await
    }

    /// Close the session and release the radio.
    ///
    /// # Errors
    ///
    /// Propagates the driver's close error.
    pub async fn close(self) -> Result<()> {
        self.driver.close().await
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        OPEN_LINKS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        tracing::debug!("link session released");
    }
}
