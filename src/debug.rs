//! Process-wide debug mask, the moral equivalent of `LD_DEBUG`.

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Categories of debug output. Trace lines are emitted through
    /// `tracing` only when the corresponding bit is set in the global mask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        /// Symbol binding and relocation application.
        const BINDINGS = 1 << 0;
        /// Runtime statistics summaries.
        const STATISTICS = 1 << 1;
    }
}

static DEBUG_MASK: AtomicU32 = AtomicU32::new(0);

/// Set the global debug mask. Affects all threads.
pub fn set_debug_mask(flags: DebugFlags) {
    DEBUG_MASK.store(flags.bits(), Ordering::Relaxed);
}

pub(crate) fn debug_mask() -> DebugFlags {
    DebugFlags::from_bits_truncate(DEBUG_MASK.load(Ordering::Relaxed))
}
