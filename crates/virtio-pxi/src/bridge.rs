//! Bridge bring-up and interrupt dispatch.
//!
//! [`Bridge::probe`] resets the channel, negotiates the protocol version and
//! hands every remote device to the virtio framework through [`VirtioBus`].
//! Afterwards the platform routes its three PXI interrupt lines here:
//! - sync: [`Bridge::handle_sync_irq`], then [`Bridge::run_pending_work`] from
//!   a worker context
//! - tx-space and rx-data: [`Bridge::handle_fifo_irq`]

use alloc::sync::Arc;
use alloc::vec::Vec;

use virtio_drivers::Hal;

use crate::config::BridgeConfig;
use crate::device::RemoteDevice;
use crate::error::{FifoError, PxiError};
use crate::fifo::FifoTransport;
use crate::hal::{Clock, PxiRegisters};
use crate::irq::{IrqWork, PendingIrqs};
use crate::protocol::{self, DeviceReg, ManagerReg, Register};

/// The virtio framework the bridge registers devices with.
pub trait VirtioBus<H: Hal>: Send + Sync {
    /// Take ownership of a newly discovered device.
    fn register_device(&self, device: &Arc<RemoteDevice<H>>) -> Result<(), PxiError>;

    /// Drop a device registered earlier. Only used to unwind a failed probe.
    fn unregister_device(&self, device: &Arc<RemoteDevice<H>>);

    /// The remote signaled a config space change.
    fn config_changed(&self, device: &RemoteDevice<H>);
}

/// Shared channel state. Devices and queues reach it through `Weak` handles.
pub(crate) struct Host {
    fifo: FifoTransport,
    bus_name: &'static str,
    max_queue_size: u16,
}

impl Host {
    pub(crate) fn bus_name(&self) -> &'static str {
        self.bus_name
    }

    pub(crate) fn max_queue_size(&self) -> u16 {
        self.max_queue_size
    }

    /// Read `regs` of device `dev` in one exchange into `out`.
    pub(crate) fn read_regs(
        &self,
        dev: u8,
        regs: &[Register],
        out: &mut [u32],
    ) -> Result<(), FifoError> {
        debug_assert_eq!(regs.len(), out.len());
        self.fifo.exchange(&protocol::read_batch(dev, regs), out)
    }

    pub(crate) fn read_array<const N: usize>(
        &self,
        dev: u8,
        regs: [Register; N],
    ) -> Result<[u32; N], FifoError> {
        let mut out = [0u32; N];
        self.read_regs(dev, &regs, &mut out)?;
        Ok(out)
    }

    pub(crate) fn read_reg(&self, dev: u8, reg: Register) -> Result<u32, FifoError> {
        let [value] = self.read_array(dev, [reg])?;
        Ok(value)
    }

    /// Write every `(register, value)` pair of device `dev` in one exchange.
    pub(crate) fn write_regs(&self, dev: u8, writes: &[(Register, u32)]) -> Result<(), FifoError> {
        self.fifo.exchange(&protocol::write_batch(dev, writes), &mut [])
    }

    pub(crate) fn write_reg(&self, dev: u8, reg: Register, value: u32) -> Result<(), FifoError> {
        self.write_regs(dev, &[(reg, value)])
    }
}

/// A running virtio-over-PXI bridge.
pub struct Bridge<H: Hal> {
    host: Arc<Host>,
    version: u32,
    devices: Vec<Arc<RemoteDevice<H>>>,
    bus: Arc<dyn VirtioBus<H>>,
    work: IrqWork,
}

impl<H: Hal> Bridge<H> {
    /// Bring up the channel and register every remote device.
    ///
    /// Every device is identified before the first one is registered. If the
    /// framework refuses one, the devices already registered are unregistered
    /// again and the probe fails.
    pub fn probe(
        regs: Arc<dyn PxiRegisters>,
        clock: Arc<dyn Clock>,
        bus: Arc<dyn VirtioBus<H>>,
        config: BridgeConfig,
    ) -> Result<Self, PxiError> {
        let host = Arc::new(Host {
            fifo: FifoTransport::new(regs, clock, config.fifo_timeout_ms),
            bus_name: config.bus_name,
            max_queue_size: config.max_queue_size,
        });

        let [version, count] = host.read_array(
            0,
            [
                Register::Manager(ManagerReg::Version),
                Register::Manager(ManagerReg::DeviceCount),
            ],
        )?;

        if !config.versions.contains(&version) {
            log::warn!(
                "[PXI] remote speaks protocol {:#x}, expected {:#x}..={:#x}",
                version,
                config.versions.start(),
                config.versions.end()
            );
            return Err(PxiError::UnsupportedVersion);
        }

        let count = count as usize;
        if count > config.device_limit() {
            log::error!(
                "[PXI] remote reports {} devices, limit is {}",
                count,
                config.device_limit()
            );
            return Err(PxiError::TooManyDevices);
        }

        let mut bridge = Self {
            host,
            version,
            devices: Vec::with_capacity(count),
            bus,
            work: IrqWork::new(),
        };
        if count == 0 {
            log::info!("[PXI] protocol {:#x}, no remote devices", version);
            return Ok(bridge);
        }

        // Whatever the remote latched before we were listening is stale.
        PendingIrqs::read(&bridge.host)?;

        for id in 0..count as u8 {
            let [device_id, vendor_id] = bridge
                .host
                .read_array(
                    id,
                    [
                        Register::Device(DeviceReg::DeviceId),
                        Register::Device(DeviceReg::VendorId),
                    ],
                )
                .map_err(|err| {
                    log::error!("[PXI] failed to identify device {}: {}", id, err);
                    PxiError::DeviceInfo(err)
                })?;
            bridge.devices.push(Arc::new(RemoteDevice::new(
                id,
                device_id,
                vendor_id,
                Arc::downgrade(&bridge.host),
            )));
        }

        for (n, device) in bridge.devices.iter().enumerate() {
            if let Err(err) = bridge.bus.register_device(device) {
                log::error!("[PXI] failed to register device {}: {}", device.id(), err);
                for registered in bridge.devices[..n].iter().rev() {
                    bridge.bus.unregister_device(registered);
                }
                return Err(err);
            }
        }

        log::info!(
            "[PXI] protocol {:#x}, {} remote device(s) on {}",
            version,
            count,
            bridge.host.bus_name()
        );
        Ok(bridge)
    }

    /// Remote protocol version negotiated at probe.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Arc<RemoteDevice<H>>] {
        &self.devices
    }

    pub fn device(&self, id: u8) -> Option<&Arc<RemoteDevice<H>>> {
        self.devices.get(usize::from(id))
    }

    pub fn bus_name(&self) -> &'static str {
        self.host.bus_name()
    }

    /// Sync interrupt entry point. Safe from interrupt context.
    ///
    /// Returns `true` if work was not already pending, i.e. the platform should
    /// wake its worker.
    pub fn handle_sync_irq(&self) -> bool {
        self.work.schedule()
    }

    /// TX-space / RX-data interrupt entry point. Safe from interrupt context.
    pub fn handle_fifo_irq(&self) {
        self.host.fifo.on_fifo_irq();
    }

    /// Worker body: drain interrupts if the sync interrupt fired.
    ///
    /// Returns the number of non-empty sweeps.
    pub fn run_pending_work(&self) -> Result<usize, PxiError> {
        if !self.work.take() {
            return Ok(0);
        }
        self.drain_interrupts()
    }

    /// Sweep the interrupt banks until a sweep comes back empty.
    ///
    /// Queue bits run the device's queue callbacks; config bits go to
    /// [`VirtioBus::config_changed`]. A transport failure stops the loop.
    pub fn drain_interrupts(&self) -> Result<usize, PxiError> {
        let mut sweeps = 0;
        loop {
            let pending = PendingIrqs::read(&self.host)?;
            if pending.is_empty() {
                return Ok(sweeps);
            }
            sweeps += 1;

            for id in pending.queue_pending() {
                match self.device(id) {
                    Some(device) => device.queue_interrupt(),
                    None => log::warn!("[PXI] queue interrupt for unknown device {}", id),
                }
            }
            for id in pending.config_pending() {
                match self.device(id) {
                    Some(device) => self.bus.config_changed(device),
                    None => log::warn!("[PXI] config interrupt for unknown device {}", id),
                }
            }
        }
    }

    /// Removing a running bridge is not supported by the remote firmware.
    pub fn teardown(&self) -> Result<(), PxiError> {
        log::warn!("[PXI] bridge teardown requested; not supported");
        Err(PxiError::Unsupported)
    }
}
