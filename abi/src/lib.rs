//! Shared ABI between the messaging driver and user processes.
//!
//! Everything in this crate is visible from user space: the 64-byte event
//! records and their exact byte layout, the user-mapped driver and endpoint
//! descriptors, the command parameter blocks of the control surface, the
//! per-interface counter indices, and the ring geometry constants that size
//! the user-mapped queues.
//!
//! The driver crate re-exports what it needs; user-side code (the library,
//! or tests standing in for it) should depend on this crate alone.

#![forbid(unsafe_code)]

pub mod cmd;
pub mod counters;
pub mod desc;
pub mod events;

/// Driver ABI version; the high byte is the major version.
///
/// Bumped whenever a command block, an event record, or a user-mapped
/// descriptor changes.
pub const DRIVER_ABI_VERSION: u32 = 0x20f;

/// ABI config bit: the driver was built wire-compatible with MX.
pub const ABI_CONFIG_WIRECOMPAT: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// Ring geometry
// ---------------------------------------------------------------------------

/// Number of entries in the send queue ring.
pub const SENDQ_ENTRY_NR: u32 = 1024;
/// Number of entries in the receive queue ring.
pub const RECVQ_ENTRY_NR: u32 = 1024;

/// log2 of the sendq/recvq entry size.
///
/// The power of two above-or-equal to the medium fragment maximum, for both
/// wire profiles currently supported.
pub const SENDQ_ENTRY_SHIFT: u32 = 12;
pub const RECVQ_ENTRY_SHIFT: u32 = 12;

pub const SENDQ_ENTRY_SIZE: u32 = 1 << SENDQ_ENTRY_SHIFT;
pub const RECVQ_ENTRY_SIZE: u32 = 1 << RECVQ_ENTRY_SHIFT;

pub const SENDQ_SIZE: u32 = SENDQ_ENTRY_NR << SENDQ_ENTRY_SHIFT;
pub const RECVQ_SIZE: u32 = RECVQ_ENTRY_NR << RECVQ_ENTRY_SHIFT;

/// Event records are 64 bytes.
pub const EVENTQ_ENTRY_SIZE: u32 = 64;
pub const EXP_EVENTQ_ENTRY_NR: u32 = 1024;
pub const UNEXP_EVENTQ_ENTRY_NR: u32 = 1024;

/// Released indices advance by one quarter of the ring at a time.
pub const EXP_RELEASE_SLOTS_BATCH_NR: u32 = EXP_EVENTQ_ENTRY_NR / 4;
pub const UNEXP_RELEASE_SLOTS_BATCH_NR: u32 = UNEXP_EVENTQ_ENTRY_NR / 4;

/// Event ids go from 1 to [`EVENT_ID_MAX`], 0 means not filled yet.
///
/// The id of slot `index` is `1 + (index % EVENT_ID_MAX)`, so the same ring
/// slot never carries the same id on two consecutive laps.
pub const EVENT_ID_MAX: u32 = 255;

// ---------------------------------------------------------------------------
// Message size limits
// ---------------------------------------------------------------------------

pub const TINY_MSG_LENGTH_MAX: usize = 32;
pub const SMALL_MSG_LENGTH_MAX: usize = 128;

// ---------------------------------------------------------------------------
// Misc limits
// ---------------------------------------------------------------------------

pub const USER_REGION_MAX: usize = 256;
pub const HOSTNAMELEN_MAX: usize = 80;
pub const IF_NAMESIZE: usize = 16;
pub const DRIVER_NAMESIZE: usize = 16;
pub const COMMAND_LEN_MAX: usize = 32;

/// Fake mmap file offsets of the six user-mappable surfaces.
pub const SENDQ_FILE_OFFSET: u64 = 0;
pub const RECVQ_FILE_OFFSET: u64 = 1024 * 1024;
pub const EXP_EVENTQ_FILE_OFFSET: u64 = 2 * 1024 * 1024;
pub const UNEXP_EVENTQ_FILE_OFFSET: u64 = 3 * 1024 * 1024;
pub const DRIVER_DESC_FILE_OFFSET: u64 = 4 * 1024 * 1024;
pub const ENDPOINT_DESC_FILE_OFFSET: u64 = 5 * 1024 * 1024;

/// Connect status codes carried in connect replies.
pub const CONNECT_STATUS_SUCCESS: u8 = 0;
pub const CONNECT_STATUS_BAD_KEY: u8 = 11;
