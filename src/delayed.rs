//! Delayed relocation processing.
//!
//! Some relocations cannot be applied at the point they are encountered:
//! an IFUNC resolver in an object that is not fully relocated may read
//! data whose relocations have not been performed yet, and a copy
//! relocation whose source object has pending deferrals would copy stale
//! bytes. Such relocations are recorded here and replayed, in recording
//! order, once the whole load operation has been relocated.

use std::sync::atomic::{AtomicBool, Ordering};

use elf::relocation::Rela;
use tracing::debug;

use crate::arch;
use crate::arena::PageArena;
use crate::catch::{signal_error, OpResult, Throw};
use crate::context::Context;
use crate::debug::{debug_mask, DebugFlags};
use crate::library::LibraryId;
use crate::symbol::SymbolDef;

const ALLOC_FAILURE: &str = "cannot allocate IFUNC resolver information";

pub(crate) fn alloc_failure() -> Throw {
    signal_error(libc::ENOMEM, "", None, ALLOC_FAILURE)
}

/// One relocation whose application has been deferred.
pub(crate) struct DelayedReloc {
    /// The object containing the relocation.
    pub map: LibraryId,
    /// The symbol table entry the relocation references, if any.
    pub refsym: Option<SymbolDef>,
    /// The relocation entry itself.
    pub rela: Rela,
    /// Address the relocation applies to.
    pub reloc_addr: *mut u64,
    /// The resolved target symbol (IFUNC definition or copy source).
    /// `None` for relative IFUNC relocations.
    pub sym: Option<SymbolDef>,
    /// The object defining `sym`.
    pub sym_map: Option<LibraryId>,
}

/// Only one load operation may collect deferrals at a time.
static LEDGER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Append-only log of deferred relocations for one load operation.
pub(crate) struct DelayedRelocations {
    records: PageArena<DelayedReloc>,
}

impl DelayedRelocations {
    fn init() -> Self {
        assert!(
            !LEDGER_ACTIVE.swap(true, Ordering::AcqRel),
            "delayed relocation ledger already active"
        );
        Self {
            records: PageArena::new(),
        }
    }

    fn record(&mut self, dr: DelayedReloc) -> OpResult<()> {
        self.records.push(dr).map_err(|_| alloc_failure())
    }

    fn iter(&self) -> impl Iterator<Item = &DelayedReloc> {
        self.records.iter()
    }
}

impl Drop for DelayedRelocations {
    fn drop(&mut self) {
        LEDGER_ACTIVE.store(false, Ordering::Release);
    }
}

impl Context {
    /// Prepare for relocation processing. Must be paired with a later call
    /// to [`Context::apply_delayed`] or [`Context::clear_delayed`].
    pub fn init_delayed(&mut self) {
        assert!(
            self.delayed.is_none(),
            "delayed relocation ledger already active"
        );
        self.delayed = Some(DelayedRelocations::init());
    }

    /// Record one deferred relocation and flag the owning object.
    pub(crate) fn record_delayed(&mut self, dr: DelayedReloc) -> OpResult<()> {
        let map = dr.map;
        self.delayed
            .as_mut()
            .expect("delayed relocation ledger not initialized")
            .record(dr)?;
        self.library_mut(map).delayed_relocations = true;
        Ok(())
    }

    /// Apply all pending delayed relocations in recording order, then
    /// deallocate the ledger.
    pub fn apply_delayed(&mut self) {
        let ledger = self
            .delayed
            .take()
            .expect("delayed relocation ledger not initialized");
        let bindings = debug_mask().contains(DebugFlags::BINDINGS);
        let mut current_map: Option<LibraryId> = None;
        let mut count: u64 = 0;
        for dr in ledger.iter() {
            if bindings {
                self.report_delayed(&mut current_map, dr);
            }
            unsafe { arch::apply_delayed(self, dr) };
            // Mark the object as fully relocated, for subsequent load
            // operations. Only the state after the last record for each
            // object matters.
            self.library_mut(dr.map).delayed_relocations = false;
            count += 1;
        }
        if bindings {
            debug!("{} delayed relocations performed", count);
        }
    }

    /// Discard pending delayed relocations without applying them; used
    /// when a load operation fails. Harmless when no ledger was
    /// initialized for this attempt.
    pub fn clear_delayed(&mut self) {
        drop(self.delayed.take());
    }

    fn report_delayed(&self, current_map: &mut Option<LibraryId>, dr: &DelayedReloc) {
        if *current_map != Some(dr.map) {
            *current_map = Some(dr.map);
            debug!("applying delayed relocations for {}", self.library(dr.map));
        }
        match (&dr.sym, dr.sym_map) {
            (Some(sym), Some(sym_map)) => {
                let def = self.library(sym_map);
                if def.name.is_empty() {
                    debug!("delayed relocation of symbol {}", sym.name);
                } else {
                    debug!("delayed relocation of symbol {} in {}", sym.name, def.name);
                }
            }
            _ => debug!("delayed relative relocation at {:#x}", dr.reloc_addr as usize),
        }
    }
}
