//! World Precision Instruments adapters.
//!
//! This crate provides adapters for WPI instruments, including:
//! - Aladdin syringe pumps (one or more daisy-chained on a single RS-232 port)
//!
//! # Usage
//!
//! Register the factory with your adapter registry:
//!
//! ```rust,ignore
//! use adapter_driver_wpi::AladdinFactory;
//!
//! registry.register_factory(Box::new(AladdinFactory));
//! ```

mod aladdin;

pub use aladdin::{AladdinConfig, AladdinFactory, AladdinPump, PUMP_ERRORS};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<AladdinFactory>());
}
