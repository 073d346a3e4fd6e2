//! Device classes and the drivers the kernel itself needs.
//!
//! Concrete bus and storage drivers live out of tree; what's here are
//! the class contracts they implement against (clock, timer, input) and
//! the 16550 UART the logger writes through.

pub mod clock;
pub mod input;
pub mod timer;
pub mod uart16550;
