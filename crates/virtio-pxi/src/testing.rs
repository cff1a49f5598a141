//! Test doubles: a simulated remote processor, a manual clock, DMA HALs and a
//! recording virtio bus.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use virtio_drivers::{BufferDirection, Hal, PhysAddr};

use crate::bridge::VirtioBus;
use crate::device::RemoteDevice;
use crate::error::PxiError;
use crate::fifo::{FifoCnt, regs};
use crate::hal::{Clock, PxiRegisters};
use crate::protocol::{Command, DeviceReg, Direction, IRQ_BANKS, ManagerReg, QueueReg, Register};
use crate::queue::PAGE_SIZE;

const SIM_CONFIG_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SimQueue {
    pub max_size: u32,
    pub size: u32,
    pub ready: u32,
    pub desc: u32,
    pub avail: u32,
    pub used: u32,
    pub notifies: u32,
}

struct SimDevice {
    device_id: u32,
    vendor_id: u32,
    status: u32,
    features: u64,
    driver_features: u64,
    generation: u32,
    config: Vec<u8>,
    queues: BTreeMap<u8, SimQueue>,
}

impl SimDevice {
    fn new(id: usize) -> Self {
        Self {
            device_id: 1 + id as u32,
            vendor_id: 0x4E54_4E44,
            status: 0,
            features: 0,
            driver_features: 0,
            generation: 0,
            config: alloc::vec![0; SIM_CONFIG_SIZE],
            queues: BTreeMap::new(),
        }
    }
}

type IrqWords = ([u32; IRQ_BANKS], [u32; IRQ_BANKS]);

struct SimState {
    version: u32,
    device_count: u32,
    devices: Vec<SimDevice>,
    rx: VecDeque<u32>,
    pending_write: Option<Command>,
    enables: FifoCnt,
    error: bool,
    sync_tx: u8,
    sync_irq: u8,
    tx_stalled: bool,
    rx_stalled: bool,
    fault_at_word: Option<usize>,
    fail_config_reads: bool,
    fail_device_reads: Option<u8>,
    tx_words: usize,
    commands: Vec<Command>,
    writes: Vec<(u8, Register, u32)>,
    irq_script: VecDeque<IrqWords>,
    irq_current: IrqWords,
    irq_sweeps: usize,
}

impl SimState {
    fn push_tx(&mut self, word: u32) {
        self.tx_words += 1;
        if let Some(cmd) = self.pending_write.take() {
            self.apply_write(cmd, word);
        } else {
            let cmd = Command::from_raw(word);
            self.commands.push(cmd);
            match cmd.direction() {
                Direction::Write => self.pending_write = Some(cmd),
                Direction::Read => match self.read_reg(cmd) {
                    Some(value) => self.rx.push_back(value),
                    None => self.error = true,
                },
            }
        }
        if self.fault_at_word == Some(self.tx_words) {
            self.fault_at_word = None;
            self.error = true;
        }
    }

    fn read_reg(&mut self, cmd: Command) -> Option<u32> {
        let reg = cmd.register()?;
        let dev = cmd.device();
        if let Register::Manager(reg) = reg {
            return Some(self.read_manager(reg));
        }
        if self.fail_device_reads == Some(dev) {
            return None;
        }
        if self.fail_config_reads && matches!(reg, Register::Config(_)) {
            return None;
        }
        let device = self.devices.get(usize::from(dev))?;
        Some(match reg {
            Register::Device(reg) => match reg {
                DeviceReg::DeviceId => device.device_id,
                DeviceReg::VendorId => device.vendor_id,
                DeviceReg::Status => device.status,
                DeviceReg::DeviceFeatures0 => device.features as u32,
                DeviceReg::DeviceFeatures1 => (device.features >> 32) as u32,
                DeviceReg::DriverFeatures0 => device.driver_features as u32,
                DeviceReg::DriverFeatures1 => (device.driver_features >> 32) as u32,
                DeviceReg::ConfigGeneration => device.generation,
            },
            Register::Config(offset) => u32::from(*device.config.get(usize::from(offset))?),
            Register::Queue { index, reg } => {
                let queue = device.queues.get(&index).copied().unwrap_or_default();
                match reg {
                    QueueReg::MaxSize => queue.max_size,
                    QueueReg::Size => queue.size,
                    QueueReg::Ready => queue.ready,
                    QueueReg::Notify => queue.notifies,
                    QueueReg::Desc => queue.desc,
                    QueueReg::Avail => queue.avail,
                    QueueReg::Used => queue.used,
                }
            }
            Register::Manager(_) => return None,
        })
    }

    fn read_manager(&mut self, reg: ManagerReg) -> u32 {
        match reg {
            ManagerReg::Version => self.version,
            ManagerReg::DeviceCount => self.device_count,
            ManagerReg::QueueIrq(bank) => {
                if bank == 0 {
                    self.irq_current = self.irq_script.pop_front().unwrap_or_default();
                    self.irq_sweeps += 1;
                }
                self.irq_current.0[usize::from(bank)]
            }
            ManagerReg::ConfigIrq(bank) => self.irq_current.1[usize::from(bank)],
        }
    }

    fn apply_write(&mut self, cmd: Command, value: u32) {
        let dev = cmd.device();
        let Some(reg) = cmd.register() else {
            self.error = true;
            return;
        };
        self.writes.push((dev, reg, value));
        let Some(device) = self.devices.get_mut(usize::from(dev)) else {
            return;
        };
        match reg {
            Register::Device(DeviceReg::Status) => device.status = value,
            Register::Device(DeviceReg::DriverFeatures0) => {
                device.driver_features = (device.driver_features & !0xFFFF_FFFF) | u64::from(value);
            }
            Register::Device(DeviceReg::DriverFeatures1) => {
                device.driver_features =
                    (device.driver_features & 0xFFFF_FFFF) | (u64::from(value) << 32);
            }
            Register::Device(_) | Register::Manager(_) => {}
            Register::Config(offset) => {
                if let Some(byte) = device.config.get_mut(usize::from(offset)) {
                    *byte = value as u8;
                }
            }
            Register::Queue { index, reg } => {
                let queue = device.queues.entry(index).or_default();
                match reg {
                    QueueReg::MaxSize => {}
                    QueueReg::Size => queue.size = value,
                    QueueReg::Ready => queue.ready = value,
                    QueueReg::Notify => queue.notifies += 1,
                    QueueReg::Desc => queue.desc = value,
                    QueueReg::Avail => queue.avail = value,
                    QueueReg::Used => queue.used = value,
                }
            }
        }
    }

    fn control(&self) -> FifoCnt {
        let mut cnt = self.enables;
        if self.tx_stalled {
            cnt |= FifoCnt::TX_FULL;
        }
        if self.rx_stalled || self.rx.is_empty() {
            cnt |= FifoCnt::RX_EMPTY;
        }
        if self.error {
            cnt |= FifoCnt::ERROR_ACK;
        }
        cnt
    }
}

/// Simulated remote processor behind the PXI register window.
pub(crate) struct SimRemote {
    state: Mutex<SimState>,
}

impl SimRemote {
    /// `count` devices speaking protocol `version`; every queue offers 64 entries.
    pub fn with_devices(version: u32, count: usize) -> Arc<Self> {
        let devices = (0..count)
            .map(|id| {
                let mut device = SimDevice::new(id);
                for index in 0..4 {
                    device.queues.insert(
                        index,
                        SimQueue {
                            max_size: 64,
                            ..SimQueue::default()
                        },
                    );
                }
                device
            })
            .collect();
        Arc::new(Self {
            state: Mutex::new(SimState {
                version,
                device_count: count as u32,
                devices,
                rx: VecDeque::new(),
                pending_write: None,
                enables: FifoCnt::empty(),
                error: false,
                sync_tx: 0,
                sync_irq: 0,
                tx_stalled: false,
                rx_stalled: false,
                fault_at_word: None,
                fail_config_reads: false,
                fail_device_reads: None,
                tx_words: 0,
                commands: Vec::new(),
                writes: Vec::new(),
                irq_script: VecDeque::new(),
                irq_current: IrqWords::default(),
                irq_sweeps: 0,
            }),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_device_count(&self, count: u32) {
        self.with(|s| s.device_count = count);
    }

    pub fn set_tx_stalled(&self, stalled: bool) {
        self.with(|s| s.tx_stalled = stalled);
    }

    pub fn set_rx_stalled(&self, stalled: bool) {
        self.with(|s| s.rx_stalled = stalled);
    }

    /// Raise the error flag once `n` more words have been transmitted.
    pub fn fault_after_tx_words(&self, n: usize) {
        self.with(|s| {
            s.tx_words = 0;
            s.fault_at_word = Some(n);
        });
    }

    pub fn fail_config_reads(&self, fail: bool) {
        self.with(|s| s.fail_config_reads = fail);
    }

    pub fn fail_device_reads(&self, dev: u8) {
        self.with(|s| s.fail_device_reads = Some(dev));
    }

    pub fn inject_stale_rx(&self, words: &[u32]) {
        self.with(|s| s.rx.extend(words.iter().copied()));
    }

    pub fn rx_is_empty(&self) -> bool {
        self.with(|s| s.rx.is_empty())
    }

    pub fn error_pending(&self) -> bool {
        self.with(|s| s.error)
    }

    pub fn cnt_enables(&self) -> FifoCnt {
        self.with(|s| s.enables)
    }

    pub fn sync_irq(&self) -> u8 {
        self.with(|s| s.sync_irq)
    }

    pub fn tx_word_count(&self) -> usize {
        self.with(|s| s.tx_words)
    }

    pub fn commands(&self) -> Vec<Command> {
        self.with(|s| s.commands.clone())
    }

    pub fn writes(&self) -> Vec<(u8, Register, u32)> {
        self.with(|s| s.writes.clone())
    }

    pub fn config_byte(&self, dev: u8, offset: usize) -> u8 {
        self.with(|s| s.devices[usize::from(dev)].config[offset])
    }

    pub fn set_config(&self, dev: u8, offset: usize, bytes: &[u8]) {
        self.with(|s| {
            s.devices[usize::from(dev)].config[offset..offset + bytes.len()].copy_from_slice(bytes);
        });
    }

    pub fn set_features(&self, dev: u8, features: u64) {
        self.with(|s| s.devices[usize::from(dev)].features = features);
    }

    pub fn driver_features(&self, dev: u8) -> u64 {
        self.with(|s| s.devices[usize::from(dev)].driver_features)
    }

    pub fn status(&self, dev: u8) -> u32 {
        self.with(|s| s.devices[usize::from(dev)].status)
    }

    pub fn set_generation(&self, dev: u8, generation: u32) {
        self.with(|s| s.devices[usize::from(dev)].generation = generation);
    }

    pub fn queue(&self, dev: u8, index: u8) -> SimQueue {
        self.with(|s| {
            s.devices[usize::from(dev)]
                .queues
                .get(&index)
                .copied()
                .unwrap_or_default()
        })
    }

    pub fn set_queue(&self, dev: u8, index: u8, queue: SimQueue) {
        self.with(|s| {
            s.devices[usize::from(dev)].queues.insert(index, queue);
        });
    }

    /// Queue one interrupt sweep result: (queue banks, config banks).
    pub fn push_irqs(&self, queue: [u32; IRQ_BANKS], config: [u32; IRQ_BANKS]) {
        self.with(|s| s.irq_script.push_back((queue, config)));
    }

    pub fn irq_sweeps(&self) -> usize {
        self.with(|s| s.irq_sweeps)
    }
}

impl PxiRegisters for SimRemote {
    fn read8(&self, offset: usize) -> u8 {
        self.with(|s| match offset {
            regs::SYNC_TX => s.sync_tx,
            regs::SYNC_IRQ => s.sync_irq,
            _ => 0,
        })
    }

    fn write8(&self, offset: usize, value: u8) {
        self.with(|s| match offset {
            regs::SYNC_TX => s.sync_tx = value,
            regs::SYNC_IRQ => s.sync_irq = value,
            _ => {}
        });
    }

    fn read32(&self, offset: usize) -> u32 {
        self.with(|s| match offset {
            regs::CNT => s.control().bits(),
            regs::RX if !s.rx_stalled => s.rx.pop_front().unwrap_or(0),
            _ => 0,
        })
    }

    fn write32(&self, offset: usize, value: u32) {
        self.with(|s| match offset {
            regs::CNT => {
                let cnt = FifoCnt::from_bits_retain(value);
                if cnt.contains(FifoCnt::FLUSH) {
                    s.pending_write = None;
                }
                if cnt.contains(FifoCnt::ERROR_ACK) {
                    s.error = false;
                }
                s.enables = cnt & (FifoCnt::TX_IRQ | FifoCnt::RX_IRQ | FifoCnt::ENABLE);
            }
            regs::TX if !s.tx_stalled => s.push_tx(value),
            _ => {}
        });
    }
}

/// Clock that advances by `step` milliseconds every time it is read.
pub(crate) struct ManualClock {
    now: AtomicU64,
    step: u64,
}

impl ManualClock {
    pub fn new(step: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step,
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }
}

std::thread_local! {
    static LIVE_PAGES: Cell<usize> = const { Cell::new(0) };
}

/// Ring pages currently allocated on this thread through [`TestHal`].
pub(crate) fn live_pages() -> usize {
    LIVE_PAGES.with(Cell::get)
}

static NEXT_PADDR: AtomicU64 = AtomicU64::new(0x2000_0000);

fn host_alloc(pages: usize) -> NonNull<u8> {
    let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    LIVE_PAGES.with(|live| live.set(live.get() + pages));
    NonNull::new(ptr).unwrap()
}

fn host_dealloc(vaddr: NonNull<u8>, pages: usize) {
    let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    // SAFETY: vaddr came from host_alloc with the same layout.
    unsafe { std::alloc::dealloc(vaddr.as_ptr(), layout) };
    LIVE_PAGES.with(|live| live.set(live.get() - pages));
}

/// DMA HAL backed by the host allocator, handing out fake sub-4GiB bus addresses.
pub(crate) struct TestHal;

unsafe impl Hal for TestHal {
    fn dma_alloc(pages: usize, _direction: BufferDirection) -> (PhysAddr, NonNull<u8>) {
        let paddr = NEXT_PADDR.fetch_add((pages * PAGE_SIZE) as u64, Ordering::Relaxed);
        (paddr, host_alloc(pages))
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, vaddr: NonNull<u8>, pages: usize) -> i32 {
        host_dealloc(vaddr, pages);
        0
    }

    unsafe fn mmio_phys_to_virt(_paddr: PhysAddr, _size: usize) -> NonNull<u8> {
        NonNull::dangling()
    }

    unsafe fn share(buffer: NonNull<[u8]>, _direction: BufferDirection) -> PhysAddr {
        buffer.as_ptr() as *mut u8 as u64
    }

    unsafe fn unshare(_paddr: PhysAddr, _buffer: NonNull<[u8]>, _direction: BufferDirection) {}
}

/// DMA HAL whose allocations always fail.
pub(crate) struct FailingHal;

unsafe impl Hal for FailingHal {
    fn dma_alloc(_pages: usize, _direction: BufferDirection) -> (PhysAddr, NonNull<u8>) {
        (0, NonNull::dangling())
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, _vaddr: NonNull<u8>, _pages: usize) -> i32 {
        0
    }

    unsafe fn mmio_phys_to_virt(_paddr: PhysAddr, _size: usize) -> NonNull<u8> {
        NonNull::dangling()
    }

    unsafe fn share(buffer: NonNull<[u8]>, _direction: BufferDirection) -> PhysAddr {
        buffer.as_ptr() as *mut u8 as u64
    }

    unsafe fn unshare(_paddr: PhysAddr, _buffer: NonNull<[u8]>, _direction: BufferDirection) {}
}

/// DMA HAL that places rings above the 32-bit window.
pub(crate) struct HighHal;

unsafe impl Hal for HighHal {
    fn dma_alloc(pages: usize, _direction: BufferDirection) -> (PhysAddr, NonNull<u8>) {
        (0x1_0000_0000, host_alloc(pages))
    }

    unsafe fn dma_dealloc(_paddr: PhysAddr, vaddr: NonNull<u8>, pages: usize) -> i32 {
        host_dealloc(vaddr, pages);
        0
    }

    unsafe fn mmio_phys_to_virt(_paddr: PhysAddr, _size: usize) -> NonNull<u8> {
        NonNull::dangling()
    }

    unsafe fn share(buffer: NonNull<[u8]>, _direction: BufferDirection) -> PhysAddr {
        buffer.as_ptr() as *mut u8 as u64
    }

    unsafe fn unshare(_paddr: PhysAddr, _buffer: NonNull<[u8]>, _direction: BufferDirection) {}
}

/// Virtio framework stand-in that records what the bridge hands it.
#[derive(Default)]
pub(crate) struct RecordingBus {
    pub registered: Mutex<Vec<u8>>,
    pub unregistered: Mutex<Vec<u8>>,
    pub config_changes: Mutex<Vec<u8>>,
    pub reject: Option<u8>,
}

impl RecordingBus {
    pub fn rejecting(id: u8) -> Self {
        Self {
            reject: Some(id),
            ..Self::default()
        }
    }

    pub fn registered(&self) -> Vec<u8> {
        self.registered.lock().unwrap().clone()
    }

    pub fn unregistered(&self) -> Vec<u8> {
        self.unregistered.lock().unwrap().clone()
    }

    pub fn config_changes(&self) -> Vec<u8> {
        self.config_changes.lock().unwrap().clone()
    }
}

impl<H: Hal> VirtioBus<H> for RecordingBus {
    fn register_device(&self, device: &Arc<RemoteDevice<H>>) -> Result<(), PxiError> {
        if self.reject == Some(device.id()) {
            return Err(PxiError::Registration);
        }
        self.registered.lock().unwrap().push(device.id());
        Ok(())
    }

    fn unregister_device(&self, device: &Arc<RemoteDevice<H>>) {
        self.unregistered.lock().unwrap().push(device.id());
    }

    fn config_changed(&self, device: &RemoteDevice<H>) {
        self.config_changes.lock().unwrap().push(device.id());
    }
}
