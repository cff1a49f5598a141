//! Command protocol codec.
//!
//! Every register access is one 32-bit command word:
//!
//! ```text
//! [31]    direction (0 = read, 1 = write)
//! [30:24] remote device id
//! [23:0]  payload: [1:0] register class, [23:2] register address
//! ```
//!
//! A read command is answered by one data word. A write command is followed by
//! its value word. Nothing here performs I/O.

use alloc::vec::Vec;

const DIR_SHIFT: u32 = 31;
const DEV_SHIFT: u32 = 24;
const DEV_MASK: u32 = 0x7F;
const PAYLOAD_MASK: u32 = 0x00FF_FFFF;
const CLASS_MASK: u32 = 0x3;
const ADDR_SHIFT: u32 = 2;
const ADDR_MASK: u32 = PAYLOAD_MASK >> ADDR_SHIFT;

/// Register field width for device, config and manager classes.
const REG_MASK: u32 = 0x3FFF;
/// Queue index / queue register field width.
const QUEUE_FIELD_MASK: u32 = 0x7F;
const QUEUE_REG_SHIFT: u32 = 7;

/// Highest queue index the 7-bit field can carry.
pub const MAX_QUEUE_INDEX: u8 = 0x7F;
/// Highest device id the 7-bit field can carry.
pub const MAX_DEVICE_ID: u8 = 0x7F;
/// Size of the byte-addressed config space.
pub const CONFIG_SPACE_SIZE: usize = (REG_MASK as usize) + 1;
/// Number of interrupt banks per event type (32 devices per bank).
pub const IRQ_BANKS: usize = crate::config::MAX_DEVICES / 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Register class selected by the low two payload bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegClass {
    Device = 0,
    Config = 1,
    Queue = 2,
    Manager = 3,
}

impl RegClass {
    const fn from_bits(bits: u32) -> Self {
        match bits & CLASS_MASK {
            0 => RegClass::Device,
            1 => RegClass::Config,
            2 => RegClass::Queue,
            _ => RegClass::Manager,
        }
    }
}

/// Per-device virtio registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DeviceReg {
    DeviceId = 0x00,
    VendorId = 0x01,
    Status = 0x02,
    DeviceFeatures0 = 0x03,
    DeviceFeatures1 = 0x04,
    DriverFeatures0 = 0x05,
    DriverFeatures1 = 0x06,
    ConfigGeneration = 0x07,
}

impl DeviceReg {
    const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x00 => DeviceReg::DeviceId,
            0x01 => DeviceReg::VendorId,
            0x02 => DeviceReg::Status,
            0x03 => DeviceReg::DeviceFeatures0,
            0x04 => DeviceReg::DeviceFeatures1,
            0x05 => DeviceReg::DriverFeatures0,
            0x06 => DeviceReg::DriverFeatures1,
            0x07 => DeviceReg::ConfigGeneration,
            _ => return None,
        })
    }
}

/// Per-queue registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueueReg {
    MaxSize = 0x00,
    Size = 0x01,
    Ready = 0x02,
    Notify = 0x03,
    Desc = 0x04,
    Avail = 0x05,
    Used = 0x06,
}

impl QueueReg {
    const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x00 => QueueReg::MaxSize,
            0x01 => QueueReg::Size,
            0x02 => QueueReg::Ready,
            0x03 => QueueReg::Notify,
            0x04 => QueueReg::Desc,
            0x05 => QueueReg::Avail,
            0x06 => QueueReg::Used,
            _ => return None,
        })
    }
}

/// Bridge-global registers. Always addressed through device id 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerReg {
    Version,
    DeviceCount,
    /// Queue interrupt pending bits for devices `32 * bank ..`.
    QueueIrq(u8),
    /// Config-changed pending bits for devices `32 * bank ..`.
    ConfigIrq(u8),
}

const MANAGER_QUEUE_IRQ: u32 = 0x08;
const MANAGER_CONFIG_IRQ: u32 = 0x0C;

impl ManagerReg {
    const fn raw(self) -> u32 {
        match self {
            ManagerReg::Version => 0x00,
            ManagerReg::DeviceCount => 0x01,
            ManagerReg::QueueIrq(bank) => MANAGER_QUEUE_IRQ + (bank as u32 & 3),
            ManagerReg::ConfigIrq(bank) => MANAGER_CONFIG_IRQ + (bank as u32 & 3),
        }
    }

    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x00 => Some(ManagerReg::Version),
            0x01 => Some(ManagerReg::DeviceCount),
            0x08..=0x0B => Some(ManagerReg::QueueIrq((raw - MANAGER_QUEUE_IRQ) as u8)),
            0x0C..=0x0F => Some(ManagerReg::ConfigIrq((raw - MANAGER_CONFIG_IRQ) as u8)),
            _ => None,
        }
    }
}

/// A fully addressed register within one remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Device(DeviceReg),
    /// Config space byte at this offset.
    Config(u16),
    Queue { index: u8, reg: QueueReg },
    Manager(ManagerReg),
}

impl Register {
    pub const fn class(self) -> RegClass {
        match self {
            Register::Device(_) => RegClass::Device,
            Register::Config(_) => RegClass::Config,
            Register::Queue { .. } => RegClass::Queue,
            Register::Manager(_) => RegClass::Manager,
        }
    }

    /// Register address (payload bits above the class field).
    pub const fn address(self) -> u32 {
        match self {
            Register::Device(reg) => reg as u32 & REG_MASK,
            Register::Config(offset) => offset as u32 & REG_MASK,
            Register::Queue { index, reg } => {
                ((reg as u32 & QUEUE_FIELD_MASK) << QUEUE_REG_SHIFT)
                    | (index as u32 & QUEUE_FIELD_MASK)
            }
            Register::Manager(reg) => reg.raw() & REG_MASK,
        }
    }

    /// 24-bit command payload: address and class.
    pub const fn payload(self) -> u32 {
        ((self.address() & ADDR_MASK) << ADDR_SHIFT) | self.class() as u32
    }

    /// Decode a payload. Unknown registers yield `None`.
    pub const fn from_payload(payload: u32) -> Option<Self> {
        let addr = (payload & PAYLOAD_MASK) >> ADDR_SHIFT;
        match RegClass::from_bits(payload) {
            RegClass::Device => match DeviceReg::from_raw(addr) {
                Some(reg) => Some(Register::Device(reg)),
                None => None,
            },
            RegClass::Config if addr <= REG_MASK => Some(Register::Config(addr as u16)),
            RegClass::Config => None,
            RegClass::Queue => {
                if addr >> (2 * QUEUE_REG_SHIFT) != 0 {
                    return None;
                }
                let index = (addr & QUEUE_FIELD_MASK) as u8;
                match QueueReg::from_raw(addr >> QUEUE_REG_SHIFT) {
                    Some(reg) => Some(Register::Queue { index, reg }),
                    None => None,
                }
            }
            RegClass::Manager => match ManagerReg::from_raw(addr) {
                Some(reg) => Some(Register::Manager(reg)),
                None => None,
            },
        }
    }
}

/// An encoded command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(u32);

impl Command {
    /// Encode from raw fields. Out-of-range bits are masked off.
    pub const fn encode(dir: Direction, dev: u8, class: RegClass, address: u32) -> Self {
        let dir_bit = match dir {
            Direction::Read => 0,
            Direction::Write => 1,
        };
        let payload = ((address & ADDR_MASK) << ADDR_SHIFT) | class as u32;
        Command((dir_bit << DIR_SHIFT) | ((dev as u32 & DEV_MASK) << DEV_SHIFT) | payload)
    }

    pub const fn read(dev: u8, reg: Register) -> Self {
        Self::encode(Direction::Read, dev, reg.class(), reg.address())
    }

    pub const fn write(dev: u8, reg: Register) -> Self {
        Self::encode(Direction::Write, dev, reg.class(), reg.address())
    }

    pub const fn from_raw(word: u32) -> Self {
        Command(word)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn direction(self) -> Direction {
        if self.0 >> DIR_SHIFT == 0 {
            Direction::Read
        } else {
            Direction::Write
        }
    }

    pub const fn device(self) -> u8 {
        ((self.0 >> DEV_SHIFT) & DEV_MASK) as u8
    }

    pub const fn class(self) -> RegClass {
        RegClass::from_bits(self.0)
    }

    pub const fn address(self) -> u32 {
        (self.0 & PAYLOAD_MASK) >> ADDR_SHIFT
    }

    pub const fn register(self) -> Option<Register> {
        Register::from_payload(self.0 & PAYLOAD_MASK)
    }
}

/// Read commands for `regs`; the remote answers with one word per command,
/// in the same order.
pub fn read_batch(dev: u8, regs: &[Register]) -> Vec<u32> {
    regs.iter().map(|reg| Command::read(dev, *reg).raw()).collect()
}

/// Write commands for `writes`, each command word followed by its value.
pub fn write_batch(dev: u8, writes: &[(Register, u32)]) -> Vec<u32> {
    let mut words = Vec::with_capacity(writes.len() * 2);
    for &(reg, value) in writes {
        words.push(Command::write(dev, reg).raw());
        words.push(value);
    }
    words
}
