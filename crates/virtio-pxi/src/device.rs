//! Virtio control plane of one remote device.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;
use virtio_drivers::Hal;
use virtio_drivers::transport::DeviceStatus;

use crate::bridge::Host;
use crate::error::PxiError;
use crate::features;
use crate::protocol::{CONFIG_SPACE_SIZE, DeviceReg, Register};
use crate::queue::Virtqueue;

/// Longest config access carried in one exchange.
const MAX_CONFIG_ACCESS: usize = 8;

/// A virtio device living on the remote processor.
///
/// Handed to the virtio framework at enumeration. Every operation goes over
/// the bridge's FIFO; once the bridge is dropped they fail with
/// [`PxiError::Detached`].
pub struct RemoteDevice<H: Hal> {
    id: u8,
    device_id: u32,
    vendor_id: u32,
    host: Weak<Host>,
    pub(crate) queues: Mutex<Vec<Arc<Virtqueue<H>>>>,
}

impl<H: Hal> RemoteDevice<H> {
    pub(crate) fn new(id: u8, device_id: u32, vendor_id: u32, host: Weak<Host>) -> Self {
        Self {
            id,
            device_id,
            vendor_id,
            host,
            queues: Mutex::new(Vec::new()),
        }
    }

    /// Index of this device on the bridge.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Virtio device type.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub(crate) fn host(&self) -> Result<Arc<Host>, PxiError> {
        self.host.upgrade().ok_or(PxiError::Detached)
    }

    pub fn reset(&self) -> Result<(), PxiError> {
        let host = self.host()?;
        host.write_reg(self.id, Register::Device(DeviceReg::Status), 0)?;
        Ok(())
    }

    pub fn get_status(&self) -> Result<DeviceStatus, PxiError> {
        let host = self.host()?;
        let raw = host.read_reg(self.id, Register::Device(DeviceReg::Status))?;
        Ok(DeviceStatus::from_bits_truncate(raw))
    }

    /// Write the status register. An empty status is a reset and must go
    /// through [`RemoteDevice::reset`].
    pub fn set_status(&self, status: DeviceStatus) -> Result<(), PxiError> {
        if status.is_empty() {
            return Err(PxiError::InvalidStatus);
        }
        let host = self.host()?;
        host.write_reg(self.id, Register::Device(DeviceReg::Status), status.bits())?;
        Ok(())
    }

    /// Read `buf.len()` config bytes starting at `offset`.
    ///
    /// Transport failures are not reported: the buffer is zero-filled and the
    /// call succeeds. Only an out-of-range request is an error.
    pub fn get_config(&self, offset: usize, buf: &mut [u8]) -> Result<(), PxiError> {
        check_config_range(offset, buf.len())?;

        let mut regs = [Register::Config(0); MAX_CONFIG_ACCESS];
        for (i, reg) in regs.iter_mut().enumerate().take(buf.len()) {
            *reg = Register::Config((offset + i) as u16);
        }
        let mut words = [0u32; MAX_CONFIG_ACCESS];
        let words = &mut words[..buf.len()];

        let result = match self.host() {
            Ok(host) => host
                .read_regs(self.id, &regs[..buf.len()], &mut *words)
                .map_err(PxiError::from),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                for (byte, word) in buf.iter_mut().zip(words.iter()) {
                    *byte = *word as u8;
                }
            }
            Err(err) => {
                log::warn!("[PXI] dev {} config read at {:#x} failed: {}", self.id, offset, err);
                buf.fill(0);
            }
        }
        Ok(())
    }

    /// Write `buf` to config space starting at `offset`, one register per byte.
    pub fn set_config(&self, offset: usize, buf: &[u8]) -> Result<(), PxiError> {
        check_config_range(offset, buf.len())?;

        let mut writes = [(Register::Config(0), 0u32); MAX_CONFIG_ACCESS];
        for (i, (write, &byte)) in writes.iter_mut().zip(buf).enumerate() {
            *write = (Register::Config((offset + i) as u16), u32::from(byte));
        }
        self.host()?.write_regs(self.id, &writes[..buf.len()])?;
        Ok(())
    }

    /// Config generation counter, or 0 if it cannot be read.
    pub fn generation(&self) -> u32 {
        self.host()
            .and_then(|host| {
                host.read_reg(self.id, Register::Device(DeviceReg::ConfigGeneration))
                    .map_err(PxiError::from)
            })
            .unwrap_or(0)
    }

    /// Features offered by the device, or 0 if they cannot be read.
    pub fn get_features(&self) -> u64 {
        let read = self.host().and_then(|host| {
            host.read_array(
                self.id,
                [
                    Register::Device(DeviceReg::DeviceFeatures0),
                    Register::Device(DeviceReg::DeviceFeatures1),
                ],
            )
            .map_err(PxiError::from)
        });
        match read {
            Ok([lo, hi]) => u64::from(lo) | (u64::from(hi) << 32),
            Err(err) => {
                log::warn!("[PXI] dev {} feature read failed: {}", self.id, err);
                0
            }
        }
    }

    /// Commit the driver feature set. `VERSION_1` is mandatory.
    pub fn finalize_features(&self, driver_features: u64) -> Result<(), PxiError> {
        if driver_features & features::VERSION_1 == 0 {
            log::warn!("[PXI] dev {} driver did not accept VIRTIO_F_VERSION_1", self.id);
            return Err(PxiError::MissingVersion1);
        }
        self.host()?.write_regs(
            self.id,
            &[
                (Register::Device(DeviceReg::DriverFeatures0), driver_features as u32),
                (Register::Device(DeviceReg::DriverFeatures1), (driver_features >> 32) as u32),
            ],
        )?;
        Ok(())
    }

    /// Platform identifier of the bridge this device sits on.
    pub fn bus_name(&self) -> Result<&'static str, PxiError> {
        Ok(self.host()?.bus_name())
    }

    /// Run the callback of every active queue.
    pub(crate) fn queue_interrupt(&self) {
        for vq in self.queues.lock().iter() {
            vq.interrupt();
        }
    }
}

fn check_config_range(offset: usize, len: usize) -> Result<(), PxiError> {
    let end = offset.checked_add(len).ok_or(PxiError::ConfigRange)?;
    if len > MAX_CONFIG_ACCESS || end > CONFIG_SPACE_SIZE {
        return Err(PxiError::ConfigRange);
    }
    Ok(())
}
