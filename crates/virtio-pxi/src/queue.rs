//! Virtqueue lifecycle.
//!
//! Rings are allocated here and registered with the remote; the descriptor,
//! available and used rings themselves are driven by the virtio framework
//! through [`Virtqueue::ring`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr::NonNull;

use virtio_drivers::{BufferDirection, Hal, PhysAddr};

use crate::bridge::Host;
use crate::device::RemoteDevice;
use crate::error::PxiError;
use crate::protocol::{MAX_QUEUE_INDEX, QueueReg, Register};

/// Size of a page for DMA allocation.
pub const PAGE_SIZE: usize = 4096;

/// Largest ring the split-ring format allows.
const MAX_RING_SIZE: u32 = 32768;

/// Calculate number of pages needed for a given size.
pub const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

const fn align_up(value: usize) -> usize {
    pages_for(value) * PAGE_SIZE
}

/// Interrupt callback for a virtqueue. Runs with the owning device's queue
/// list locked, so it must not set up or tear down queues on that device.
pub type QueueCallback<H> = Box<dyn Fn(&Virtqueue<H>) + Send + Sync>;

/// Offsets of the three split-ring areas inside one allocation.
///
/// The used ring starts on a page boundary (legacy vring alignment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingLayout {
    avail_offset: usize,
    used_offset: usize,
    total: usize,
}

impl RingLayout {
    const fn new(size: u16) -> Self {
        let n = size as usize;
        let desc = 16 * n;
        let avail = 6 + 2 * n;
        let used = 6 + 8 * n;
        let used_offset = align_up(desc + avail);
        Self {
            avail_offset: desc,
            used_offset,
            total: used_offset + align_up(used),
        }
    }
}

/// Page-aligned DMA memory holding one split ring.
///
/// Freed through the HAL when dropped.
pub struct RingMemory<H: Hal> {
    paddr: PhysAddr,
    vaddr: NonNull<u8>,
    pages: usize,
    layout: RingLayout,
    _hal: PhantomData<fn() -> H>,
}

// SAFETY: the ring is exclusively owned; the raw pointer is only handed out,
// never dereferenced here.
unsafe impl<H: Hal> Send for RingMemory<H> {}
// SAFETY: as above, no interior access through &self.
unsafe impl<H: Hal> Sync for RingMemory<H> {}

impl<H: Hal> RingMemory<H> {
    fn allocate(size: u16) -> Result<Self, PxiError> {
        let layout = RingLayout::new(size);
        let pages = pages_for(layout.total);
        let (paddr, vaddr) = H::dma_alloc(pages, BufferDirection::Both);
        if paddr == 0 {
            return Err(PxiError::RingAlloc);
        }

        let ring = Self {
            paddr,
            vaddr,
            pages,
            layout,
            _hal: PhantomData,
        };
        // Queue address registers are 32 bits wide.
        if ring.paddr + (ring.len() as u64) > (1 << 32) {
            return Err(PxiError::RingAddress);
        }
        Ok(ring)
    }

    /// Bus address of the descriptor table.
    pub fn desc_paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Bus address of the available (driver) ring.
    pub fn avail_paddr(&self) -> PhysAddr {
        self.paddr + self.layout.avail_offset as u64
    }

    /// Bus address of the used (device) ring.
    pub fn used_paddr(&self) -> PhysAddr {
        self.paddr + self.layout.used_offset as u64
    }

    /// Start of the allocation in the local address space.
    pub fn vaddr(&self) -> NonNull<u8> {
        self.vaddr
    }

    /// Allocation length in bytes.
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

impl<H: Hal> Drop for RingMemory<H> {
    fn drop(&mut self) {
        // SAFETY: paddr/vaddr/pages are exactly what dma_alloc returned.
        unsafe {
            H::dma_dealloc(self.paddr, self.vaddr, self.pages);
        }
    }
}

/// An active virtqueue on a remote device.
pub struct Virtqueue<H: Hal> {
    index: u8,
    device: u8,
    name: String,
    max_size: u32,
    size: u16,
    ring: RingMemory<H>,
    callback: Option<QueueCallback<H>>,
    host: Weak<Host>,
}

impl<H: Hal> Virtqueue<H> {
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Id of the remote device owning this queue.
    pub fn device_id(&self) -> u8 {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum size the remote offered.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Negotiated ring size; fixed while the queue is active.
    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn ring(&self) -> &RingMemory<H> {
        &self.ring
    }

    /// Tell the remote there are new available buffers.
    pub fn notify(&self) -> Result<(), PxiError> {
        let host = self.host.upgrade().ok_or(PxiError::Detached)?;
        host.write_reg(
            self.device,
            Register::Queue {
                index: self.index,
                reg: QueueReg::Notify,
            },
            1,
        )?;
        Ok(())
    }

    pub(crate) fn interrupt(&self) {
        if let Some(callback) = &self.callback {
            callback(self);
        }
    }
}

/// One entry of a [`RemoteDevice::find_vqs`] request.
pub struct QueueRequest<H: Hal> {
    pub name: String,
    pub callback: Option<QueueCallback<H>>,
}

impl<H: Hal> QueueRequest<H> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callback: None,
        }
    }

    pub fn with_callback(
        mut self,
        callback: impl Fn(&Virtqueue<H>) + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// Ring size to program: the remote's maximum, capped, rounded down to a power of two.
fn negotiated_size(max_size: u32, cap: u16) -> u16 {
    let n = max_size.min(u32::from(cap)).min(MAX_RING_SIZE);
    if n == 0 {
        return 0;
    }
    (1u32 << (31 - n.leading_zeros())) as u16
}

impl<H: Hal> RemoteDevice<H> {
    /// Activate queue `index`.
    ///
    /// Fails with [`PxiError::QueueActive`] without touching the hardware if the
    /// remote already reports the queue ready. The ready flag is the last
    /// register written, so a failure part way through leaves it inactive.
    pub fn setup_vq(
        &self,
        index: u8,
        name: &str,
        callback: Option<QueueCallback<H>>,
    ) -> Result<Arc<Virtqueue<H>>, PxiError> {
        if index > MAX_QUEUE_INDEX {
            return Err(PxiError::InvalidQueue);
        }
        let host = self.host()?;
        let queue_reg = |reg| Register::Queue { index, reg };

        let [ready, max_size] =
            host.read_array(self.id(), [queue_reg(QueueReg::Ready), queue_reg(QueueReg::MaxSize)])?;
        if ready != 0 {
            log::error!("[PXI] queue {} is already enabled on device {}", index, self.id());
            return Err(PxiError::QueueActive);
        }

        let size = negotiated_size(max_size, host.max_queue_size());
        if size == 0 {
            log::error!("[PXI] queue {} is zero on device {}", index, self.id());
            return Err(PxiError::QueueSizeZero);
        }

        let ring = RingMemory::<H>::allocate(size)?;
        host.write_regs(
            self.id(),
            &[
                (queue_reg(QueueReg::Size), u32::from(size)),
                (queue_reg(QueueReg::Desc), ring.desc_paddr() as u32),
                (queue_reg(QueueReg::Avail), ring.avail_paddr() as u32),
                (queue_reg(QueueReg::Used), ring.used_paddr() as u32),
                (queue_reg(QueueReg::Ready), 1),
            ],
        )?;

        let vq = Arc::new(Virtqueue {
            index,
            device: self.id(),
            name: String::from(name),
            max_size,
            size,
            ring,
            callback,
            host: Arc::downgrade(&host),
        });
        self.queues.lock().push(Arc::clone(&vq));
        log::debug!(
            "[PXI] dev {} queue {} '{}' active, {} entries",
            self.id(),
            index,
            name,
            size
        );
        Ok(vq)
    }

    /// Deactivate one queue.
    ///
    /// The queue leaves the device's list before the remote is told, so the
    /// interrupt dispatcher stops calling it first. Ring memory is released
    /// once the last handle is dropped.
    pub fn del_vq(&self, vq: &Arc<Virtqueue<H>>) -> Result<(), PxiError> {
        let removed = {
            let mut queues = self.queues.lock();
            queues
                .iter()
                .position(|q| Arc::ptr_eq(q, vq))
                .map(|pos| queues.remove(pos))
        };
        match removed {
            Some(vq) => self.deactivate(vq.index),
            None => Ok(()),
        }
    }

    /// Deactivate every queue of this device.
    ///
    /// All remotes are told even if one write fails; the first error is returned.
    pub fn del_vqs(&self) -> Result<(), PxiError> {
        let drained = core::mem::take(&mut *self.queues.lock());
        let mut result = Ok(());
        for vq in drained {
            if let Err(err) = self.deactivate(vq.index) {
                log::warn!("[PXI] dev {} queue {} teardown failed: {}", self.id(), vq.index, err);
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Set up queues for every named request, on consecutive indices.
    ///
    /// `None` entries produce `None` and do not consume an index. On failure
    /// every queue of the device is torn down.
    pub fn find_vqs(
        &self,
        requests: Vec<Option<QueueRequest<H>>>,
    ) -> Result<Vec<Option<Arc<Virtqueue<H>>>>, PxiError> {
        let mut vqs = Vec::with_capacity(requests.len());
        let mut next_index: usize = 0;

        for request in requests {
            let Some(request) = request else {
                vqs.push(None);
                continue;
            };

            let setup = u8::try_from(next_index)
                .map_err(|_| PxiError::InvalidQueue)
                .and_then(|index| self.setup_vq(index, &request.name, request.callback));
            match setup {
                Ok(vq) => vqs.push(Some(vq)),
                Err(err) => {
                    if let Err(cleanup) = self.del_vqs() {
                        log::warn!("[PXI] dev {} rollback incomplete: {}", self.id(), cleanup);
                    }
                    return Err(err);
                }
            }
            next_index += 1;
        }

        Ok(vqs)
    }

    fn deactivate(&self, index: u8) -> Result<(), PxiError> {
        self.host()?.write_reg(
            self.id(),
            Register::Queue {
                index,
                reg: QueueReg::Ready,
            },
            0,
        )?;
        log::debug!("[PXI] dev {} queue {} inactive", self.id(), index);
        Ok(())
    }
}
