//! Error handling infrastructure for the PXI bridge crates.
//!
//! Provides the `define_kernel_error!` macro for consistent error type definitions.
//! Every generated type carries a subsystem byte, a per-variant code, a fixed
//! description and a `core::error::Error` impl whose `source()` exposes the
//! inner error of nested variants.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_kernel_error! {
//!     pub enum FifoError(0x31) {
//!         Timeout = 0x01 => "FIFO wait timed out",
//!         Fault = 0x02 => "FIFO error acknowledged",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_kernel_error! {
//!     pub enum PxiError(0x32) {
//!         Fifo(FifoError) = 0x01 => "PXI transfer failed",
//!         DeviceInfo(FifoError) = 0x04 => "Device identification failed",
//!     }
//! }
//! ```
//!
//! Several variants may wrap the same inner type, so no `From` impls are
//! generated; callers write the one conversion they want by hand.

#![no_std]

/// Macro to define a subsystem error type with consistent handling.
///
/// Supports both simple variants and nested variants containing inner errors.
/// Inner types must be `Copy + Eq + core::error::Error + 'static`.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Get numeric error code for debugging.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Get error name for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            $desc
                        }
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(
                                @display_body self f $desc $(($inner))? inner
                            )
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {
            fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
                match self {
                    $(
                        $crate::define_kernel_error!(@pattern $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(@source $(($inner))? inner)
                        }
                    )*
                }
            }
        }
    };

    // Helper to generate patterns
    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    // Helper to generate display bodies
    (@display_body $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display_body $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };

    // Helper to generate `source()` bodies
    (@source ($inner:ty) $bind:ident) => {
        Some($bind as &(dyn core::error::Error + 'static))
    };
    (@source $bind:ident) => { None };
}
