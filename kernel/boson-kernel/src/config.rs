//! Build-time kernel configuration.

/// Maximum supported CPUs.
pub use boson_core::percpu::MAX_CPUS;

/// Scheduler tick frequency in Hz.
pub const TICK_HZ: u64 = 1000;

/// First canonical user-space address.
pub const USER_SPACE_ADDR_BEGIN: u64 = 0x0000_0000_0040_0000;

/// Load base for position-independent executables.
pub const DEFAULT_VIRT_BASE: u64 = 0x0000_5555_0000_0000;

/// Top of the initial user stack, growing down.
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_0000;

/// Initial user stack reservation in bytes.
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// Base of the mmap placement region for interpreter and anonymous maps.
pub const USER_MMAP_BASE: u64 = 0x0000_6000_0000_0000;

/// `uname` system name.
pub const UNAME_SYSNAME: &str = "Linux";

/// `uname` release; userspace libcs parse the leading version triple.
pub const UNAME_RELEASE: &str = "6.6.0-boson";

/// `uname` version string.
pub const UNAME_VERSION: &str = concat!("#1 SMP boson ", env!("CARGO_PKG_VERSION"));

/// `uname` machine name.
pub const UNAME_MACHINE: &str = "x86_64";
