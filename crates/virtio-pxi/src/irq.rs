//! Remote interrupt state.
//!
//! The remote latches one pending bit per device in two bank sets: queue
//! activity and config changes. Reading a bank acknowledges it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::bridge::Host;
use crate::error::FifoError;
use crate::protocol::{IRQ_BANKS, ManagerReg, Register};

/// Bit-to-device mapping: bit `b` of bank `n` is device `32 * n + b`.
const DEVICES_PER_BANK: usize = 32;

/// One sweep of every interrupt bank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingIrqs {
    queue: [u32; IRQ_BANKS],
    config: [u32; IRQ_BANKS],
}

impl PendingIrqs {
    pub const fn new(queue: [u32; IRQ_BANKS], config: [u32; IRQ_BANKS]) -> Self {
        Self { queue, config }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.iter().chain(self.config.iter()).all(|&bank| bank == 0)
    }

    /// Devices with queue activity, in ascending id order.
    pub fn queue_pending(&self) -> impl Iterator<Item = u8> + '_ {
        set_bits(&self.queue)
    }

    /// Devices whose config space changed, in ascending id order.
    pub fn config_pending(&self) -> impl Iterator<Item = u8> + '_ {
        set_bits(&self.config)
    }

    /// Read every bank in one exchange.
    pub(crate) fn read(host: &Host) -> Result<Self, FifoError> {
        let mut regs = [Register::Manager(ManagerReg::Version); 2 * IRQ_BANKS];
        for bank in 0..IRQ_BANKS {
            regs[bank] = Register::Manager(ManagerReg::QueueIrq(bank as u8));
            regs[IRQ_BANKS + bank] = Register::Manager(ManagerReg::ConfigIrq(bank as u8));
        }

        let words = host.read_array(0, regs)?;
        let mut pending = Self::default();
        pending.queue.copy_from_slice(&words[..IRQ_BANKS]);
        pending.config.copy_from_slice(&words[IRQ_BANKS..]);
        Ok(pending)
    }
}

fn set_bits(banks: &[u32; IRQ_BANKS]) -> impl Iterator<Item = u8> + '_ {
    banks.iter().enumerate().flat_map(|(bank, &word)| {
        (0..DEVICES_PER_BANK)
            .filter(move |bit| word & (1 << bit) != 0)
            .map(move |bit| (bank * DEVICES_PER_BANK + bit) as u8)
    })
}

/// Deferred-work flag raised by the sync interrupt.
///
/// The interrupt handler only calls [`IrqWork::schedule`]; the worker context
/// calls [`IrqWork::take`] and drains the banks.
#[derive(Debug, Default)]
pub struct IrqWork {
    pending: AtomicBool,
}

impl IrqWork {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Mark work pending. Returns `false` if it already was.
    pub fn schedule(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    /// Claim pending work, clearing the flag.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}
