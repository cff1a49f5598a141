//! Bridge configuration.
//!
//! Defaults match the remote firmware's protocol revision 1. Platform code
//! normally uses [`BridgeConfig::default`] and only overrides the bus name.

use core::ops::RangeInclusive;

/// Bound on a single FIFO wait, in milliseconds.
pub const DEFAULT_FIFO_TIMEOUT_MS: u64 = 1000;

/// Lowest remote protocol version this bridge speaks.
pub const PROTOCOL_VERSION_MIN: u32 = 0x01;
/// Highest remote protocol version this bridge speaks.
pub const PROTOCOL_VERSION_MAX: u32 = 0x01;

/// Size of the device id space (7-bit id field).
pub const MAX_DEVICES: usize = 128;

/// Cap on the negotiated ring size, independent of what the remote offers.
pub const DEFAULT_MAX_QUEUE_SIZE: u16 = 256;

/// Platform identifier reported through `bus_name`.
pub const DEFAULT_BUS_NAME: &str = "3ds-pxi";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Per-word FIFO wait bound.
    pub fifo_timeout_ms: u64,
    /// Accepted remote protocol versions.
    pub versions: RangeInclusive<u32>,
    /// Largest device count accepted at enumeration; clamped to [`MAX_DEVICES`].
    pub max_devices: usize,
    /// Largest ring the bridge will allocate per queue.
    pub max_queue_size: u16,
    pub bus_name: &'static str,
}

impl BridgeConfig {
    /// Device limit actually enforced.
    pub fn device_limit(&self) -> usize {
        self.max_devices.min(MAX_DEVICES)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fifo_timeout_ms: DEFAULT_FIFO_TIMEOUT_MS,
            versions: PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX,
            max_devices: MAX_DEVICES,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            bus_name: DEFAULT_BUS_NAME,
        }
    }
}
