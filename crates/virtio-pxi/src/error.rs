//! Bridge error types.

use pxi_error::define_kernel_error;

define_kernel_error! {
    /// Failures of a single FIFO exchange.
    /// Error codes in range 0x31xx (PXI FIFO subsystem).
    pub enum FifoError(0x31) {
        /// A wait for tx space or rx data exceeded the configured bound
        Timeout = 0x01 => "FIFO wait timed out",
        /// Hardware raised the error-acknowledge flag; channel was flushed
        Fault = 0x02 => "FIFO error acknowledged",
    }
}

define_kernel_error! {
    /// Bridge, negotiation and virtqueue errors.
    /// Error codes in range 0x32xx (virtio-over-PXI subsystem).
    pub enum PxiError(0x32) {
        /// Transport failure during a register exchange
        Fifo(FifoError) = 0x01 => "PXI transfer failed",
        /// Remote protocol version outside the accepted range
        UnsupportedVersion = 0x02 => "Unsupported protocol version",
        /// Remote device count exceeds the id space
        TooManyDevices = 0x03 => "Remote device count exceeds limit",
        /// Device-id / vendor-id read failed during enumeration
        DeviceInfo(FifoError) = 0x04 => "Device identification failed",
        /// The virtio framework refused a device
        Registration = 0x05 => "Virtio framework rejected device",
        /// Driver features lack VIRTIO_F_VERSION_1
        MissingVersion1 = 0x06 => "VIRTIO_F_VERSION_1 not negotiated",
        /// Queue ready flag already set
        QueueActive = 0x07 => "Virtqueue already active",
        /// Queue reports a maximum size of zero
        QueueSizeZero = 0x08 => "Virtqueue has zero size",
        /// DMA allocation for ring memory failed
        RingAlloc = 0x09 => "Ring allocation failed",
        /// Ring memory does not fit the 32-bit address registers
        RingAddress = 0x0A => "Ring outside 32-bit DMA window",
        /// Queue index does not fit the 7-bit field
        InvalidQueue = 0x0B => "Virtqueue index out of range",
        /// Status zero is reserved for reset
        InvalidStatus = 0x0C => "Invalid device status",
        /// Config access too long or past the end of config space
        ConfigRange = 0x0D => "Config access out of range",
        /// Owning bridge has been dropped
        Detached = 0x0E => "Bridge no longer present",
        /// Operation intentionally not supported
        Unsupported = 0x0F => "Operation not supported",
    }
}

impl From<FifoError> for PxiError {
    fn from(err: FifoError) -> Self {
        PxiError::Fifo(err)
    }
}
