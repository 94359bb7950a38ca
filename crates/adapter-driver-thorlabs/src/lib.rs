//! Thorlabs adapters.
//!
//! This crate provides adapters for Thorlabs instruments, including:
//! - Elliptec ELL9 four-position sliders on the Elliptec bus
//!
//! # Usage
//!
//! ```rust,ignore
//! use adapter_driver_thorlabs::Ell9Factory;
//!
//! registry.register_factory(Box::new(Ell9Factory));
//! ```

mod ell9;

pub use ell9::{Ell9Config, Ell9Factory, Ell9Slider, STATUS_ERRORS};

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<Ell9Factory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
