//! Hardware abstraction for the PXI block.
//!
//! Platform code supplies register access and a time source; everything above
//! this module is portable and runs unchanged against the simulated remote used
//! in tests.

use core::num::NonZeroU64;
use core::ptr::{read_volatile, write_volatile};

/// Byte-addressed access to the PXI register window.
///
/// Offsets are relative to the window base. Implementations must perform each
/// access exactly once and in program order (no merging or caching).
pub trait PxiRegisters: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn write8(&self, offset: usize, value: u8);
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// Volatile MMIO implementation of [`PxiRegisters`].
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// Wrap an already-mapped register window.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped PXI register block that
    /// stays mapped for the lifetime of this value.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl PxiRegisters for MmioRegisters {
    #[inline]
    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: Caller of `new` guarantees base is a valid MMIO address.
        unsafe { read_volatile((self.base + offset) as *const u8) }
    }

    #[inline]
    fn write8(&self, offset: usize, value: u8) {
        // SAFETY: Caller of `new` guarantees base is a valid MMIO address.
        unsafe { write_volatile((self.base + offset) as *mut u8, value) }
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: Caller of `new` guarantees base is a valid MMIO address.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: Caller of `new` guarantees base is a valid MMIO address.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Millisecond time source used to bound FIFO waits.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u64;

    /// Idle while waiting for FIFO space or data.
    ///
    /// Called only when no FIFO interrupt arrived since the last check. On
    /// targets with interrupts this should sleep until the next one (WFI): the
    /// tx-space and rx-data lines are what end the wait. It must return in
    /// bounded time, since the FIFO timeout is only checked between calls.
    /// The default spins once.
    fn idle(&self) {
        core::hint::spin_loop();
    }
}

/// A free-running hardware counter.
pub trait TickSource: Send + Sync {
    /// Read the current counter value.
    fn read_counter(&self) -> u64;

    /// Counter frequency in Hz.
    fn read_frequency(&self) -> u64;
}

/// [`Clock`] over a hardware counter, for targets without an OS timer.
pub struct TickClock<T: TickSource> {
    source: T,
    frequency: NonZeroU64,
}

impl<T: TickSource> TickClock<T> {
    /// Latch the counter frequency. Returns `None` if the counter reports 0 Hz,
    /// since such a clock never advances and no FIFO wait could time out.
    pub fn new(source: T) -> Option<Self> {
        let frequency = NonZeroU64::new(source.read_frequency())?;
        Some(Self { source, frequency })
    }
}

impl<T: TickSource> Clock for TickClock<T> {
    fn now_ms(&self) -> u64 {
        let ticks = u128::from(self.source.read_counter());
        (ticks * 1000 / u128::from(self.frequency.get())) as u64
    }
}

/// Host clock backed by `std::time::Instant`.
#[cfg(any(test, feature = "std"))]
pub struct StdClock {
    start: std::time::Instant,
}

#[cfg(any(test, feature = "std"))]
impl StdClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "std"))]
impl Clock for StdClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn idle(&self) {
        std::thread::yield_now();
    }
}
