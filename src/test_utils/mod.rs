//! Shared helpers for unit tests: in-memory control and message sockets
//! plus packet builders, so the full observer and client channels can run
//! without a QRTR-capable kernel.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::QrtrBus;
use crate::config::BusConfig;
use crate::socket::ControlSocket;
use crate::socket::MessageSocket;
use crate::socket::QrtrAddress;
use crate::wire;
use crate::wire::ServerAnnouncement;

pub(crate) const LOCAL_ADDRESS: QrtrAddress = QrtrAddress { node: 1, port: 421 };

/// Kernel stand-in: whatever the test pushes through [`MockBusHandle`]
/// comes out of `recv`, and everything the observer sends is captured.
pub(crate) struct MockControlSocket {
    packets: mpsc::UnboundedReceiver<Vec<u8>>,
    sent: mpsc::UnboundedSender<(Vec<u8>, QrtrAddress)>,
}

/// Test-side feeder for a [`MockControlSocket`]. Dropping it makes the next
/// `recv` fail, which the driver treats as a socket i/o failure.
pub(crate) struct MockBusHandle {
    packets: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) sent: mpsc::UnboundedReceiver<(Vec<u8>, QrtrAddress)>,
}

pub(crate) fn mock_control_socket() -> (MockControlSocket, MockBusHandle) {
    let (packets_tx, packets_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        MockControlSocket {
            packets: packets_rx,
            sent: sent_tx,
        },
        MockBusHandle {
            packets: packets_tx,
            sent: sent_rx,
        },
    )
}

impl MockBusHandle {
    /// True once the observer side dropped its socket.
    pub(crate) fn is_closed(&self) -> bool {
        self.packets.is_closed()
    }

    pub(crate) fn feed(&self, packet: &[u8]) {
        self.packets
            .send(packet.to_vec())
            .expect("observer is gone");
    }

    pub(crate) fn new_server(&self, node: u32, port: u32, service: u32, version: u8, instance: u32) {
        self.feed(&wire::encode_new_server(&ServerAnnouncement {
            service,
            version,
            instance,
            node,
            port,
        }));
    }

    pub(crate) fn del_server(&self, node: u32, port: u32, service: u32, version: u8, instance: u32) {
        self.feed(&wire::encode_del_server(&ServerAnnouncement {
            service,
            version,
            instance,
            node,
            port,
        }));
    }

    pub(crate) fn lookup_terminator(&self) {
        self.new_server(0, 0, 0, 0, 0);
    }
}

#[async_trait]
impl ControlSocket for MockControlSocket {
    fn local_address(&self) -> io::Result<QrtrAddress> {
        Ok(LOCAL_ADDRESS)
    }

    async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize> {
        let _ = self.sent.send((buf.to_vec(), addr));
        Ok(buf.len())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.packets.recv().await {
            Some(packet) => {
                // Datagram semantics: oversized input is truncated.
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => Err(io::Error::other("mock packet source closed")),
        }
    }
}

/// Peer stand-in for a client channel: datagrams pushed through
/// [`MockEndpointHandle`] come out of `recv_from`, and everything the
/// client sends is captured.
pub(crate) struct MockMessageSocket {
    datagrams: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Option<QrtrAddress>)>>,
    sent: mpsc::UnboundedSender<(Vec<u8>, QrtrAddress)>,
}

/// Test-side peer for a [`MockMessageSocket`]. Dropping it makes the next
/// `recv_from` fail, which the receive task treats as a socket i/o failure.
pub(crate) struct MockEndpointHandle {
    datagrams: mpsc::UnboundedSender<(Vec<u8>, Option<QrtrAddress>)>,
    pub(crate) sent: mpsc::UnboundedReceiver<(Vec<u8>, QrtrAddress)>,
}

pub(crate) fn mock_message_socket() -> (Arc<MockMessageSocket>, MockEndpointHandle) {
    let (datagrams_tx, datagrams_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockMessageSocket {
            datagrams: Mutex::new(datagrams_rx),
            sent: sent_tx,
        }),
        MockEndpointHandle {
            datagrams: datagrams_tx,
            sent: sent_rx,
        },
    )
}

impl MockEndpointHandle {
    /// True once the client side dropped its socket.
    pub(crate) fn is_closed(&self) -> bool {
        self.datagrams.is_closed()
    }

    /// Deliver one inbound datagram claiming to come from `from`.
    pub(crate) fn deliver(&self, payload: &[u8], from: QrtrAddress) {
        self.datagrams
            .send((payload.to_vec(), Some(from)))
            .expect("client is gone");
    }

    /// Deliver a datagram whose source the kernel could not express as a
    /// QRTR address.
    pub(crate) fn deliver_foreign(&self, payload: &[u8]) {
        self.datagrams
            .send((payload.to_vec(), None))
            .expect("client is gone");
    }
}

#[async_trait]
impl MessageSocket for MockMessageSocket {
    async fn send_to(&self, buf: &[u8], addr: QrtrAddress) -> io::Result<usize> {
        let _ = self.sent.send((buf.to_vec(), addr));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<QrtrAddress>)> {
        match self.datagrams.lock().await.recv().await {
            Some((payload, from)) => {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::other("mock endpoint closed")),
        }
    }
}

/// Config used by most scenario tests: asynchronous lookup, default
/// debounce.
pub(crate) fn async_lookup_config() -> BusConfig {
    BusConfig {
        lookup_timeout_in_ms: 0,
        ..BusConfig::default()
    }
}

/// Start an observer over a mock control socket with asynchronous lookup,
/// returning the bus and the feeder.
pub(crate) async fn start_mock_bus() -> (QrtrBus, MockBusHandle) {
    let (socket, handle) = mock_control_socket();
    let bus = QrtrBus::start(socket, &async_lookup_config(), &CancellationToken::new())
        .await
        .expect("observer should start");
    (bus, handle)
}
