//! Read-only handle for one node on the bus.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::bus::BusShared;
use crate::directory::ServiceInfo;
use crate::errors::Error;
use crate::errors::Result;
use crate::events::BusEvent;
use crate::uri;

/// A device on the QRTR bus, used to look up the services it publishes.
///
/// Handles are cheap to clone and stay valid until the observer emits
/// `NodeRemoved` for this id or is dropped; after that every lookup returns
/// `None`/empty.
#[derive(Clone)]
pub struct Node {
    id: u32,
    shared: Arc<BusShared>,
}

impl Node {
    pub(crate) fn new(id: u32, shared: Arc<BusShared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// `qrtr://<id>` rendering of this node.
    pub fn uri(&self) -> String {
        uri::for_node(self.id)
    }

    /// Port of the announced server for `service`, preferring the highest
    /// version when several instances are registered.
    pub fn lookup_port(&self, service: u32) -> Option<u32> {
        self.shared
            .read()
            .get(self.id)
            .and_then(|record| record.lookup_port(service))
    }

    /// Service id announced at `port`, if any.
    pub fn lookup_service(&self, port: u32) -> Option<u32> {
        self.shared
            .read()
            .get(self.id)
            .and_then(|record| record.lookup_service(port))
    }

    /// Snapshot of the node's service entries in announcement order.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.shared
            .read()
            .get(self.id)
            .map(|record| record.services().to_vec())
            .unwrap_or_default()
    }

    /// True while at least one service is registered on this node.
    pub fn has_services(&self) -> bool {
        self.shared
            .read()
            .get(self.id)
            .is_some_and(|record| record.has_services())
    }

    /// Resolve once every service id in `services` is present on this node.
    ///
    /// Fails with [`Error::NodeRemoved`] if the node deregisters before the
    /// set is complete, [`Error::Timeout`] when the budget elapses (zero
    /// waits indefinitely) or [`Error::Cancelled`].
    pub async fn wait_for_services(
        &self,
        services: &[u32],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Subscribe first; an arrival between the check and the
        // subscription must not be missed.
        let mut events = self.shared.events.register(None);
        if self.has_all(services) {
            return Ok(());
        }

        let budget = if timeout.is_zero() {
            Duration::MAX
        } else {
            timeout
        };
        let deadline = time::sleep(budget);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => {
                    return Err(Error::Timeout(format!(
                        "QRTR node {} did not register all awaited services",
                        self.id
                    )));
                }
                event = events.recv() => match event {
                    Some(BusEvent::NodeRemoved(id)) if id == self.id => {
                        return Err(Error::NodeRemoved(self.id));
                    }
                    Some(BusEvent::ServiceAdded { node_id, .. }) if node_id == self.id => {
                        if self.has_all(services) {
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                    None => {
                        return Err(Error::SocketIo(io::Error::other(
                            "observer stopped while waiting for services",
                        )));
                    }
                },
            }
        }
    }

    fn has_all(&self, services: &[u32]) -> bool {
        self.shared
            .read()
            .get(self.id)
            .is_some_and(|record| record.has_all_services(services))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish()
    }
}
