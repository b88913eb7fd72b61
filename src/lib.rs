//! # qrtr-bus
//!
//! Userspace client library for the Qualcomm IPC Router (QRTR), the kernel
//! datagram bus (`AF_QIPCRTR`) that Qualcomm modem and SoC platforms use to
//! expose services running on remote processors.
//!
//! ## Features
//! - **Bus observation**: one control socket drives the kernel lookup
//!   handshake and keeps an in-memory index of nodes and their services.
//! - **Debounced discovery**: a node is announced only after its initial
//!   service burst has settled, so consumers always see it fully populated.
//! - **Events**: `NodeAdded`/`NodeRemoved`/`ServiceAdded`/`ServiceRemoved`
//!   streams, plus `wait_for_node` with timeout and cancellation.
//! - **Message channels**: per-`(node, port)` datagram sockets for talking
//!   to a service directly.
//!
//! ## Quick Start
//! ```no_run
//! use std::time::Duration;
//!
//! use qrtr_bus::{BusConfig, QrtrBus, QrtrClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> qrtr_bus::Result<()> {
//!     let bus = QrtrBus::connect(BusConfig::default()).await?;
//!
//!     let cancel = CancellationToken::new();
//!     let node = bus.wait_for_node(24, Duration::from_secs(5), &cancel).await?;
//!
//!     if let Some(port) = node.lookup_port(15) {
//!         let mut client = QrtrClient::open(&node, port)?;
//!         client.send(b"\x01\x00", &cancel).await?;
//!         if let Some(reply) = client.next_message().await {
//!             println!("{} reply bytes from {}", reply.len(), node.uri());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//! ```text
//! kernel ─▶ control socket ─▶ decoder ─▶ node directory ─▶ events ─▶ app
//!                                                 ▲
//! app ─▶ QrtrClient ─▶ kernel                Node handles
//! ```
//!
//! No application-layer parsing happens here: datagrams are opaque byte
//! buffers, and routing, reliability and ordering are the kernel's business.
//! Each process owns its own observer; there is no multi-process
//! coordination.

pub mod uri;
pub mod wire;

mod bus;
mod client;
mod config;
mod directory;
mod errors;
mod events;
mod node;
mod socket;

pub use bus::node_for_id;
pub use bus::QrtrBus;
pub use client::QrtrClient;
pub use config::BusConfig;
pub use directory::ServiceInfo;
pub use errors::Error;
pub use errors::Result;
pub use events::BusEvent;
pub use events::EventKind;
pub use events::EventStream;
pub use node::Node;
pub use socket::QrtrAddress;
pub use socket::QrtrSocket;
pub use socket::AF_QIPCRTR;
pub use socket::QRTR_PORT_CTRL;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
mod test_utils;
