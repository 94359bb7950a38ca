//! Toptica Photonics adapters.
//!
//! This crate provides adapters for Toptica lasers, including:
//! - iBeam smart diode lasers, in four variants (full, simple, fine,
//!   external trigger)
//!
//! # Usage
//!
//! ```rust,ignore
//! use adapter_driver_toptica::IBeamSmartFactory;
//!
//! registry.register_factory(Box::new(IBeamSmartFactory));
//!
//! let config = toml::toml! {
//!     port = "/dev/ttyUSB1"
//!     variant = "fine"
//! };
//! let laser = registry.build("ibeam_smart", config.into()).await?;
//! laser.initialize().await?;
//! laser.set_property("Laser Operation", "On".into()).await?;
//! ```

mod ibeam_smart;

pub use ibeam_smart::{
    IBeamSmart, IBeamSmartConfig, IBeamSmartFactory, IBeamVariant, CLIP_FAIL, DATA_NOT_FOUND,
    LASER_ERRORS, UNEXPECTED_CLIP_STATUS,
};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<IBeamSmartFactory>());
}
