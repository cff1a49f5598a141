//! PXI FIFO transport.
//!
//! A single logical channel shared by every remote device and queue. Each
//! [`FifoTransport::exchange`] holds the channel lock from the first word sent
//! to the last word received, so the words of two exchanges never interleave.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::FifoError;
use crate::hal::{Clock, PxiRegisters};

/// PXI register offsets.
pub mod regs {
    /// Local-side sync byte (8-bit).
    pub const SYNC_TX: usize = 0x01;
    /// Sync interrupt control (8-bit).
    pub const SYNC_IRQ: usize = 0x03;
    /// FIFO control/status (32-bit).
    pub const CNT: usize = 0x04;
    /// Transmit FIFO port (32-bit).
    pub const TX: usize = 0x08;
    /// Receive FIFO port (32-bit).
    pub const RX: usize = 0x0C;
}

/// Words the hardware FIFO holds in each direction.
pub const FIFO_DEPTH: usize = 16;

bitflags! {
    /// FIFO control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FifoCnt: u32 {
        /// Transmit FIFO full (read-only).
        const TX_FULL = 1 << 1;
        /// Interrupt when transmit FIFO has space.
        const TX_IRQ = 1 << 2;
        /// Flush the transmit FIFO (write-only).
        const FLUSH = 1 << 3;
        /// Receive FIFO empty (read-only).
        const RX_EMPTY = 1 << 8;
        /// Interrupt when receive FIFO has data.
        const RX_IRQ = 1 << 10;
        /// Error flag; write 1 to acknowledge.
        const ERROR_ACK = 1 << 14;
        /// FIFO enable.
        const ENABLE = 1 << 15;
    }
}

bitflags! {
    /// Sync interrupt control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncIrq: u8 {
        /// Deliver the local sync interrupt.
        const ENABLE = 1 << 7;
    }
}

/// Control value written after a fault: flush, acknowledge, keep running.
const RECOVER: FifoCnt = FifoCnt::FLUSH
    .union(FifoCnt::ERROR_ACK)
    .union(FifoCnt::ENABLE)
    .union(FifoCnt::TX_IRQ)
    .union(FifoCnt::RX_IRQ);

/// Blocking word exchange over the PXI FIFO.
pub struct FifoTransport {
    regs: Arc<dyn PxiRegisters>,
    clock: Arc<dyn Clock>,
    channel: Mutex<()>,
    /// Bumped by the tx/rx FIFO interrupts. A waiter that sees it move
    /// between its register check and [`Clock::idle`] re-checks instead of
    /// sleeping through the interrupt it just missed.
    wakeups: AtomicU32,
    timeout_ms: u64,
}

impl FifoTransport {
    /// Take ownership of the channel and reset it.
    ///
    /// The FIFO is flushed, stale receive words are drained and the sync and
    /// FIFO interrupts are armed before the transport is returned.
    pub fn new(regs: Arc<dyn PxiRegisters>, clock: Arc<dyn Clock>, timeout_ms: u64) -> Self {
        let fifo = Self {
            regs,
            clock,
            channel: Mutex::new(()),
            wakeups: AtomicU32::new(0),
            timeout_ms,
        };
        fifo.reset();
        fifo
    }

    fn reset(&self) {
        let regs = &*self.regs;
        regs.write8(regs::SYNC_TX, 0);
        regs.write8(regs::SYNC_IRQ, 0);
        regs.write32(
            regs::CNT,
            (FifoCnt::FLUSH | FifoCnt::ERROR_ACK | FifoCnt::ENABLE).bits(),
        );

        for _ in 0..FIFO_DEPTH {
            let _ = regs.read32(regs::RX);
        }

        regs.write32(regs::CNT, 0);
        regs.write8(regs::SYNC_IRQ, SyncIrq::ENABLE.bits());
        regs.write32(regs::CNT, RECOVER.bits());
    }

    /// Per-wait bound in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Send every word of `writes`, then receive exactly `reads.len()` words.
    ///
    /// Any single wait longer than the timeout fails with
    /// [`FifoError::Timeout`]. A hardware error flag flushes and re-arms the
    /// channel and fails with [`FifoError::Fault`]; remaining words are not
    /// transferred in either case.
    pub fn exchange(&self, writes: &[u32], reads: &mut [u32]) -> Result<(), FifoError> {
        let _channel = self.channel.lock();

        #[cfg(feature = "verbose")]
        log::trace!("[PXI] tx {:08x?} rx {}", writes, reads.len());

        for &word in writes {
            self.wait_until(|cnt| !cnt.contains(FifoCnt::TX_FULL))?;
            self.regs.write32(regs::TX, word);
            self.check_error()?;
        }

        for slot in reads.iter_mut() {
            self.wait_until(|cnt| !cnt.contains(FifoCnt::RX_EMPTY))?;
            *slot = self.regs.read32(regs::RX);
            self.check_error()?;
        }

        #[cfg(feature = "verbose")]
        log::trace!("[PXI] rx {:08x?}", reads);

        Ok(())
    }

    /// TX-space / RX-data interrupt entry point. Safe from interrupt context.
    ///
    /// The interrupt itself ends the waiter's [`Clock::idle`]; this only
    /// records it for a waiter that has not gone idle yet.
    pub fn on_fifo_irq(&self) {
        self.wakeups.fetch_add(1, Ordering::Release);
    }

    fn control(&self) -> FifoCnt {
        FifoCnt::from_bits_retain(self.regs.read32(regs::CNT))
    }

    fn wait_until(&self, ready: impl Fn(FifoCnt) -> bool) -> Result<(), FifoError> {
        let start = self.clock.now_ms();
        loop {
            let seen = self.wakeups.load(Ordering::Acquire);
            if ready(self.control()) {
                return Ok(());
            }
            if self.clock.now_ms().saturating_sub(start) >= self.timeout_ms {
                return Err(FifoError::Timeout);
            }
            if self.wakeups.load(Ordering::Acquire) == seen {
                self.clock.idle();
            }
        }
    }

    fn check_error(&self) -> Result<(), FifoError> {
        if self.control().contains(FifoCnt::ERROR_ACK) {
            self.regs.write32(regs::CNT, RECOVER.bits());
            log::warn!("[PXI] FIFO error acknowledged, channel flushed");
            return Err(FifoError::Fault);
        }
        Ok(())
    }
}
