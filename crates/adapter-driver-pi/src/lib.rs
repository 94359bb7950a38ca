//! Physik Instrumente (PI) adapters.
//!
//! - Piezo Z stage used as a focus lock, switchable between its internal
//!   capacitive sensor and an external sensor feeding the servo loop.
//!
//! ```rust,ignore
//! use adapter_driver_pi::PiFocusLockFactory;
//!
//! registry.register_factory(Box::new(PiFocusLockFactory));
//! ```

mod focus_lock;

pub use focus_lock::{PiFocusLock, PiFocusLockConfig, PiFocusLockFactory, GCS_ERRORS};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<PiFocusLockFactory>());
}
