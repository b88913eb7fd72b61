//! Per-endpoint message channel.
//!
//! A client owns one unbound `AF_QIPCRTR` datagram socket pointed at a
//! single `(node, port)`. Outbound buffers go out as one datagram each, no
//! framing; inbound datagrams from exactly that endpoint are delivered in
//! kernel order as owned byte buffers. QRTR is reliable and ordered within
//! a session, so there are no retries and no send queue beyond the kernel
//! socket buffers.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::errors::Error;
use crate::errors::Result;
use crate::node::Node;
use crate::socket::MessageSocket;
use crate::socket::QrtrAddress;
use crate::socket::QrtrSocket;

/// Upper bound on a QRTR datagram payload.
const MAX_DATAGRAM_LEN: usize = 65536;

/// Inbound messages queued ahead of the consumer before the receive task
/// applies backpressure.
const INBOUND_BUFFER: usize = 128;

/// A datagram conduit to one `(node, port)` on the bus.
///
/// The client records the node id for identity only: it does not pin the
/// node's directory record, and it keeps working for as long as the kernel
/// keeps the peer reachable.
pub struct QrtrClient {
    remote: QrtrAddress,
    socket: Arc<dyn MessageSocket>,
    inbound: mpsc::Receiver<Bytes>,
    _shutdown_tx: watch::Sender<()>,
}

impl QrtrClient {
    /// Open a channel to `port` on `node`. Must be called from within a
    /// tokio runtime, which the receive task runs on.
    pub fn open(node: &Node, port: u32) -> Result<Self> {
        let socket = Arc::new(QrtrSocket::new().map_err(Error::SocketCreate)?);
        Self::open_with_socket(node, port, socket)
    }

    /// [`open`](Self::open) over an already-open socket. Split out so tests
    /// can run the channel against an in-memory endpoint.
    pub(crate) fn open_with_socket(
        node: &Node,
        port: u32,
        socket: Arc<dyn MessageSocket>,
    ) -> Result<Self> {
        let remote = QrtrAddress {
            node: node.id(),
            port,
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::spawn(recv_loop(
            Arc::clone(&socket),
            remote,
            inbound_tx,
            shutdown_rx,
        ));

        debug!(node_id = remote.node, port = remote.port, "client opened");
        Ok(Self {
            remote,
            socket,
            inbound: inbound_rx,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.remote.node
    }

    pub fn port(&self) -> u32 {
        self.remote.port
    }

    /// Send `message` to the remote endpoint as one datagram.
    pub async fn send(&self, message: &[u8], cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            sent = self.socket.send_to(message, self.remote) => {
                sent.map_err(Error::SocketIo)?;
                Ok(())
            }
        }
    }

    /// The next inbound datagram from the remote endpoint, as a freshly
    /// owned buffer. Zero-length datagrams come through as empty buffers.
    /// `None` once the channel is closed or its socket failed.
    pub async fn next_message(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Release the socket and stop the receive task. Equivalent to drop,
    /// spelled out for call sites that want the teardown explicit.
    pub fn close(self) {}
}

async fn recv_loop(
    socket: Arc<dyn MessageSocket>,
    remote: QrtrAddress,
    inbound: mpsc::Sender<Bytes>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, Some(from))) if from == remote => {
                    let message = Bytes::copy_from_slice(&buf[..len]);
                    // Backpressure against a slow consumer; the send only
                    // fails once the client handle is gone.
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Ok((_, Some(from))) => {
                    trace!(
                        node_id = from.node,
                        port = from.port,
                        "ignoring datagram from unexpected sender"
                    );
                }
                Ok((_, None)) => {
                    debug!("ignoring datagram with non-QRTR source address");
                }
                Err(error) => {
                    warn!(
                        node_id = remote.node,
                        port = remote.port,
                        %error,
                        "client socket i/o failure"
                    );
                    break;
                }
            },
        }
    }
}
