//! Bus observer.
//!
//! One control socket per observer. The observer sends a `NEW_LOOKUP` to the
//! kernel, decodes the `NEW_SERVER`/`DEL_SERVER` stream that follows, and
//! keeps the node directory current. All mutation happens on a single
//! spawned driver task:
//!
//! ```text
//! kernel -> control socket -> BusDriver::run()
//!                                |  decode + directory mutation
//!                                |  publish debounce timers
//!                                v
//!                          EventRegistry -> subscribers
//!                                ^
//!              QrtrBus / Node handles (read-only directory views)
//! ```
//!
//! A freshly discovered node is not announced immediately: the kernel
//! delivers the node's services as a burst, so the driver re-arms a per-node
//! publish timer on every `NEW_SERVER` and announces the node only once the
//! burst has settled. Removal that empties a node before it was published
//! announces nothing.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::BusConfig;
use crate::directory::NodeDirectory;
use crate::directory::ServiceInfo;
use crate::directory::ServiceRemoval;
use crate::errors::Error;
use crate::errors::Result;
use crate::events::BusEvent;
use crate::events::EventKind;
use crate::events::EventRegistry;
use crate::events::EventStream;
use crate::node::Node;
use crate::socket::ControlSocket;
use crate::socket::QrtrAddress;
use crate::socket::QrtrSocket;
use crate::socket::QRTR_PORT_CTRL;
use crate::wire;
use crate::wire::CtrlPacket;
use crate::wire::ServerAnnouncement;

/// State shared between the driver task and the public handles. The driver
/// is the only writer; handles take short read locks, never across an await.
pub(crate) struct BusShared {
    directory: RwLock<NodeDirectory>,
    pub(crate) events: Arc<EventRegistry>,
}

impl BusShared {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, NodeDirectory> {
        self.directory.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeDirectory> {
        self.directory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observer of the QRTR bus: owns the control socket, maintains the node
/// directory and fans out [`BusEvent`]s.
///
/// Dropping the bus stops the driver task and closes the socket; every
/// outstanding [`EventStream`] ends and [`Node`] handles go stale.
pub struct QrtrBus {
    shared: Arc<BusShared>,
    shutdown_tx: watch::Sender<()>,
}

impl QrtrBus {
    /// Open the control socket, request the current bus state from the
    /// kernel and start observing.
    ///
    /// With a non-zero `lookup_timeout_in_ms` the call returns once the
    /// initial service burst has quiesced, so the directory already holds
    /// the current bus state; see [`BusConfig`] for the failure modes.
    pub async fn connect(config: BusConfig) -> Result<Self> {
        Self::connect_cancellable(config, &CancellationToken::new()).await
    }

    /// [`connect`](Self::connect) with an external cancellation token.
    /// Cancellation aborts initialization and destroys the socket.
    pub async fn connect_cancellable(
        config: BusConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let socket = QrtrSocket::new().map_err(Error::SocketCreate)?;
        Self::start(socket, &config, cancel).await
    }

    /// Drive the lookup handshake on an already-open control socket and
    /// spawn the driver. Split out so tests can run the full observer
    /// against an in-memory packet source.
    pub(crate) async fn start<S: ControlSocket>(
        socket: S,
        config: &BusConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let local = socket.local_address().map_err(Error::SocketIo)?;
        debug!(
            node = local.node,
            port = local.port,
            "starting bus lookup from local address"
        );

        let control = QrtrAddress {
            node: local.node,
            port: QRTR_PORT_CTRL,
        };
        socket
            .send_to(&wire::encode_new_lookup(), control)
            .await
            .map_err(Error::SocketIo)?;

        let shared = Arc::new(BusShared {
            directory: RwLock::new(NodeDirectory::default()),
            events: Arc::new(EventRegistry::new(config.event_buffer_size)),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let (init, init_rx) = match config.lookup_timeout() {
            Some(_) => {
                let (notify, rx) = oneshot::channel();
                let init = InitQuiesce {
                    notify,
                    deadline: Instant::now() + config.publish_debounce(),
                };
                (Some(init), Some(rx))
            }
            None => (None, None),
        };

        let driver = BusDriver {
            socket,
            shared: Arc::clone(&shared),
            publish_debounce: config.publish_debounce(),
            publish_deadlines: HashMap::new(),
            init,
            shutdown_rx,
        };
        tokio::spawn(driver.run());

        let bus = QrtrBus {
            shared,
            shutdown_tx,
        };

        if let (Some(budget), Some(init_rx)) = (config.lookup_timeout(), init_rx) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    bus.shutdown();
                    return Err(Error::Cancelled);
                }
                _ = time::sleep(budget) => {
                    bus.shutdown();
                    return Err(Error::Timeout(
                        "timed out waiting for the initial bus lookup".into(),
                    ));
                }
                quiesced = init_rx => {
                    if quiesced.is_err() {
                        return Err(Error::SocketIo(io::Error::other(
                            "observer stopped during the initial bus lookup",
                        )));
                    }
                }
            }
        }

        Ok(bus)
    }

    /// Handle for a published node, or `None` while the node is unknown or
    /// still accumulating its initial service burst.
    pub fn get_node(&self, node_id: u32) -> Option<Node> {
        let directory = self.shared.read();
        directory
            .get_published(node_id)
            .map(|_| Node::new(node_id, Arc::clone(&self.shared)))
    }

    /// Snapshot of every published node.
    pub fn nodes(&self) -> Vec<Node> {
        self.node_ids()
            .into_iter()
            .map(|node_id| Node::new(node_id, Arc::clone(&self.shared)))
            .collect()
    }

    /// Snapshot of published node ids, ascending.
    pub fn node_ids(&self) -> Vec<u32> {
        self.shared.read().published_ids()
    }

    /// Subscribe to every bus event.
    pub fn subscribe(&self) -> EventStream {
        self.shared.events.register(None)
    }

    /// Subscribe to one event kind only.
    pub fn subscribe_kind(&self, kind: EventKind) -> EventStream {
        self.shared.events.register(Some(kind))
    }

    /// Resolve once `node_id` is published, or fail with [`Error::Timeout`]
    /// / [`Error::Cancelled`], whichever happens first. A zero `timeout`
    /// waits until the node appears or the token fires.
    pub async fn wait_for_node(
        &self,
        node_id: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Node> {
        // Subscribe before the directory check so a publish landing between
        // the two cannot be missed.
        let mut added = self.subscribe_kind(EventKind::NodeAdded);
        if let Some(node) = self.get_node(node_id) {
            return Ok(node);
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
                        "QRTR node {node_id} did not appear on the bus"
                    )));
                }
                event = added.recv() => match event {
                    Some(BusEvent::NodeAdded(id)) if id == node_id => {
                        return Ok(Node::new(node_id, Arc::clone(&self.shared)));
                    }
                    Some(_) => {}
                    None => {
                        return Err(Error::SocketIo(io::Error::other(
                            "observer stopped while waiting for the node",
                        )));
                    }
                },
            }
        }
    }

    /// Stop the driver task and close the control socket. Idempotent; also
    /// performed on drop. The directory stays readable at its final state.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for QrtrBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One-call convenience: start an observer (asynchronous lookup) and wait
/// for `node_id` to show up. The returned bus keeps the node handle live.
pub async fn node_for_id(
    node_id: u32,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(QrtrBus, Node)> {
    let config = BusConfig {
        lookup_timeout_in_ms: 0,
        ..BusConfig::default()
    };
    let bus = QrtrBus::connect_cancellable(config, cancel).await?;
    let node = bus.wait_for_node(node_id, timeout, cancel).await?;
    Ok((bus, node))
}

/// Pending completion of the initial lookup: fires once a full debounce
/// window passes without service delivery.
struct InitQuiesce {
    notify: oneshot::Sender<()>,
    deadline: Instant,
}

struct BusDriver<S> {
    socket: S,
    shared: Arc<BusShared>,
    publish_debounce: Duration,
    /// Pending publish deadline per unpublished node, re-armed on every
    /// `NEW_SERVER` for that node.
    publish_deadlines: HashMap<u32, Instant>,
    init: Option<InitQuiesce>,
    shutdown_rx: watch::Receiver<()>,
}

impl<S: ControlSocket> BusDriver<S> {
    async fn run(mut self) {
        let mut buf = [0u8; wire::CTRL_PACKET_LEN];
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    debug!("bus observer shutting down");
                    break;
                }
                _ = sleep_until_or_now(deadline), if deadline.is_some() => {
                    self.fire_due_timers();
                }
                received = self.socket.recv(&mut buf) => match received {
                    Ok(len) => self.handle_datagram(&buf[..len]),
                    Err(error) => {
                        // Frozen failed state: the directory keeps its
                        // last-known content, subscribers get no synthetic
                        // removals.
                        warn!(%error, "control socket i/o failure, stopping observer");
                        break;
                    }
                },
            }
        }
        self.shared.events.close();
    }

    fn next_deadline(&self) -> Option<Instant> {
        let publish = self.publish_deadlines.values().min().copied();
        let init = self.init.as_ref().map(|init| init.deadline);
        match (publish, init) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (publish, None) => publish,
            (None, init) => init,
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();

        let due: Vec<u32> = self
            .publish_deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(node_id, _)| *node_id)
            .collect();
        for node_id in due {
            self.publish_deadlines.remove(&node_id);
            // The node may have emptied and disappeared inside the window.
            if self.shared.write().mark_published(node_id) {
                debug!(node_id, "node published");
                self.shared.events.emit(BusEvent::NodeAdded(node_id));
            }
        }

        if let Some(init) = &self.init {
            if init.deadline <= now {
                if let Some(init) = self.init.take() {
                    debug!("initial bus lookup quiesced");
                    let _ = init.notify.send(());
                }
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        match wire::decode(datagram) {
            Err(short) => {
                debug!(len = short.len, "short control packet received, ignoring");
            }
            Ok(CtrlPacket::Unknown(cmd)) => {
                debug!(cmd, "unknown control packet type received, ignoring");
            }
            Ok(CtrlPacket::NewServer(announcement)) if announcement.is_lookup_terminator() => {
                // End of the kernel's lookup replay. Mutating the directory
                // here would fabricate a node 0 with a service on port 0.
                debug!("initial lookup finished");
            }
            Ok(CtrlPacket::NewServer(announcement)) => {
                self.touch_quiescence();
                self.add_server(announcement);
            }
            Ok(CtrlPacket::DelServer(announcement)) => {
                self.touch_quiescence();
                self.remove_server(announcement);
            }
        }
    }

    fn touch_quiescence(&mut self) {
        if let Some(init) = &mut self.init {
            init.deadline = Instant::now() + self.publish_debounce;
        }
    }

    fn add_server(&mut self, announcement: ServerAnnouncement) {
        debug!(
            node_id = announcement.node,
            port = announcement.port,
            service = announcement.service,
            version = announcement.version,
            instance = announcement.instance,
            "server added on bus"
        );

        let info = ServiceInfo {
            service: announcement.service,
            port: announcement.port,
            version: announcement.version,
            instance: announcement.instance,
        };
        let (created, published) = {
            let mut directory = self.shared.write();
            let created = directory.insert_service(announcement.node, info);
            let published = directory
                .get(announcement.node)
                .is_some_and(|record| record.is_published());
            (created, published)
        };
        if created {
            debug!(node_id = announcement.node, "created new node record");
        }

        self.shared.events.emit(BusEvent::ServiceAdded {
            node_id: announcement.node,
            service: announcement.service,
        });

        if !published {
            // More services may follow for this node shortly; hold the
            // announcement until the burst settles.
            self.publish_deadlines
                .insert(announcement.node, Instant::now() + self.publish_debounce);
        }
    }

    fn remove_server(&mut self, announcement: ServerAnnouncement) {
        debug!(
            node_id = announcement.node,
            port = announcement.port,
            service = announcement.service,
            version = announcement.version,
            instance = announcement.instance,
            "server removed from bus"
        );

        let removal = {
            let mut directory = self.shared.write();
            let removal = directory.remove_service(announcement.node, announcement.port);
            if let ServiceRemoval::Removed {
                node_now_empty: true,
                ..
            } = removal
            {
                directory.remove_node(announcement.node);
            }
            removal
        };

        match removal {
            ServiceRemoval::UnknownNode => {
                warn!(
                    node_id = announcement.node,
                    "cannot remove service: unknown node"
                );
            }
            ServiceRemoval::UnknownPort => {
                info!(
                    node_id = announcement.node,
                    service = announcement.service,
                    port = announcement.port,
                    "tried to remove unknown service"
                );
            }
            ServiceRemoval::Removed {
                info,
                node_now_empty,
                node_published,
            } => {
                self.shared.events.emit(BusEvent::ServiceRemoved {
                    node_id: announcement.node,
                    service: info.service,
                });
                if node_now_empty {
                    debug!(node_id = announcement.node, "removing node record");
                    self.publish_deadlines.remove(&announcement.node);
                    // A node that was never announced disappears silently.
                    if node_published {
                        self.shared
                            .events
                            .emit(BusEvent::NodeRemoved(announcement.node));
                    }
                }
            }
        }
    }
}

fn sleep_until_or_now(deadline: Option<Instant>) -> Sleep {
    time::sleep_until(deadline.unwrap_or_else(Instant::now))
}
