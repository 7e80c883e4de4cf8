//! Delayed relocation processing and error propagation for an ELF dynamic
//! loader.
//!
//! This crate implements the two subsystems at the heart of a dynamic
//! loader's relocation engine:
//!
//! * The exception/catch mechanism ([`catch`]): loader operations that can
//!   fail signal an error through [`signal_error`] or [`signal_exception`],
//!   and any caller that can meaningfully recover wraps the operation in
//!   [`catch_exception`]. An error with no enclosing catch frame is fatal
//!   and terminates the process with a one-line diagnostic.
//!
//! * The delayed relocation ledger ([`delayed`]): relocations whose result
//!   depends on not-yet-performed relocations in another object (IFUNC
//!   resolvers, copy relocation sources) are recorded in an append-only
//!   ledger during the relocation walk and replayed, in exact recording
//!   order, once the whole dependency graph has been processed.
//!
//! The [`context::Context`] ties these together: it owns the library
//! dependency graph and drives relocation in dependency order, initializing
//! the ledger before the walk, applying it on success, and discarding it on
//! failure.

pub use elf;

pub mod arch;
pub mod arena;
pub mod catch;
pub mod context;
pub mod debug;
pub mod delayed;
pub mod error;
pub mod library;
pub mod symbol;

pub use catch::{
    catch_exception, no_catch, receive_errors, signal_cerror, signal_cexception, signal_error,
    signal_exception, switch_to_thread_frames, Exception, OpResult, Throw,
};
pub use context::Context;
pub use debug::{set_debug_mask, DebugFlags};
pub use error::{CaughtError, DlErrorKind};
pub use library::{Library, LibraryId};
