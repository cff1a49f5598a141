//! # virtio_pxi
//!
//! VirtIO transport over the PXI inter-processor FIFO.
//!
//! The remote processor owns a set of virtio devices and exposes their
//! registers through a 32-bit command/response protocol carried over a small
//! hardware FIFO block. This crate turns that channel into virtio devices on
//! the local side:
//! - [`FifoTransport`] - lock-serialized, bounded-wait word exchange
//! - [`Command`] / [`Register`] - the register-addressing command codec
//! - [`RemoteDevice`] - virtio control plane (status, features, config)
//! - [`Virtqueue`] - ring allocation and hardware registration
//! - [`Bridge`] - enumeration and interrupt dispatch
//!
//! Ring processing itself belongs to the virtio framework above; this crate
//! only carries control operations and interrupt signaling.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

extern crate alloc;

mod bridge;
pub mod config;
mod device;
mod error;
pub mod fifo;
pub mod hal;
mod irq;
pub mod protocol;
mod queue;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, VirtioBus};
pub use config::BridgeConfig;
pub use device::RemoteDevice;
pub use error::{FifoError, PxiError};
pub use fifo::FifoTransport;
pub use hal::{Clock, MmioRegisters, PxiRegisters, TickClock, TickSource};
#[cfg(any(test, feature = "std"))]
pub use hal::StdClock;
pub use irq::{IrqWork, PendingIrqs};
pub use protocol::{Command, Direction, Register};
pub use queue::{QueueCallback, QueueRequest, RingMemory, Virtqueue};

pub use virtio_drivers::transport::DeviceStatus;

/// VirtIO feature bits the bridge cares about.
pub mod features {
    /// Device complies with VirtIO 1.0+; mandatory for this transport.
    pub const VERSION_1: u64 = 1 << 32;
}
