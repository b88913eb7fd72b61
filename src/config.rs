//! Bus observer configuration parameters
//!
//! Encapsulates the tunables of a [`QrtrBus`](crate::QrtrBus): the initial
//! lookup budget, the publish debounce window and the event fan-out buffer.
//!
//! # Defaults
//! Field-level defaults use helper functions prefixed with `default_` so the
//! struct can be spliced into an embedder's own configuration file via
//! `serde`. The crate itself never reads files or environment variables.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusConfig {
    /// Budget for the initial bus lookup, in milliseconds.
    ///
    /// With a non-zero budget, [`QrtrBus::connect`](crate::QrtrBus::connect)
    /// completes once the initial `NEW_SERVER` burst has quiesced, or fails
    /// with [`Error::Timeout`] when the budget elapses first. Zero disables
    /// the wait: `connect` returns immediately and nodes are discovered
    /// asynchronously through `NodeAdded` events.
    ///
    /// Default: `default_lookup_timeout_in_ms()` (1000)
    #[serde(default = "default_lookup_timeout_in_ms")]
    pub lookup_timeout_in_ms: u64,

    /// Publish debounce window, in milliseconds.
    ///
    /// A freshly discovered node is announced only after this much time has
    /// passed without another `NEW_SERVER` for it, so consumers observe a
    /// fully populated node instead of a trickle of services.
    ///
    /// Default: `default_publish_debounce_in_ms()` (100)
    #[serde(default = "default_publish_debounce_in_ms")]
    pub publish_debounce_in_ms: u64,

    /// Per-subscriber event channel capacity.
    ///
    /// A subscriber that falls this many events behind is disconnected
    /// rather than blocking the observer.
    ///
    /// Default: `default_event_buffer_size()` (256)
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_in_ms: default_lookup_timeout_in_ms(),
            publish_debounce_in_ms: default_publish_debounce_in_ms(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl BusConfig {
    /// Validates configuration consistency.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if any configuration rule is violated.
    pub fn validate(&self) -> Result<()> {
        if self.publish_debounce_in_ms == 0 {
            return Err(Error::Config(
                "publish_debounce_in_ms must be non-zero".into(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::Config("event_buffer_size must be non-zero".into()));
        }
        Ok(())
    }

    pub(crate) fn lookup_timeout(&self) -> Option<Duration> {
        (self.lookup_timeout_in_ms > 0).then(|| Duration::from_millis(self.lookup_timeout_in_ms))
    }

    pub(crate) fn publish_debounce(&self) -> Duration {
        Duration::from_millis(self.publish_debounce_in_ms)
    }
}

fn default_lookup_timeout_in_ms() -> u64 {
    1000
}
fn default_publish_debounce_in_ms() -> u64 {
    100
}
fn default_event_buffer_size() -> usize {
    256
}
