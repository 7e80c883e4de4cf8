use petgraph::visit::Bfs;
use tracing::trace;

use super::Context;
use crate::catch::{signal_error, OpResult};
use crate::error::DlErrorKind;
use crate::library::LibraryId;
use crate::symbol::{LookupFlags, RelocatedSymbol};

impl Context {
    /// Search for a symbol, starting from a given library.
    ///
    /// The search proceeds in three stages, each of which can be skipped
    /// via `flags`: the starting library itself, a breadth-first walk of
    /// its dependencies, and finally all loaded libraries.
    pub fn lookup_symbol(
        &self,
        start: LibraryId,
        name: &str,
        flags: LookupFlags,
    ) -> OpResult<RelocatedSymbol> {
        if !flags.contains(LookupFlags::SKIP_SELF) {
            let lib = self.library(start);
            if let Some(sym) = lib.lookup_symbol(name) {
                return Ok(RelocatedSymbol::new(sym.clone(), start, lib.base_addr()));
            }
        }

        if !flags.contains(LookupFlags::SKIP_DEPS) {
            let mut visit = Bfs::new(&self.library_deps, start.0);
            while let Some(idx) = visit.next(&self.library_deps) {
                if idx == start.0 {
                    continue;
                }
                let lib = &self.library_deps[idx];
                if let Some(sym) = lib.lookup_symbol(name) {
                    return Ok(RelocatedSymbol::new(
                        sym.clone(),
                        LibraryId(idx),
                        lib.base_addr(),
                    ));
                }
            }
        }

        if !flags.contains(LookupFlags::SKIP_GLOBAL) {
            trace!("falling back to global search for {}", name);
            for idx in self.library_deps.node_indices() {
                let lib = &self.library_deps[idx];
                if let Some(sym) = lib.lookup_symbol(name) {
                    return Ok(RelocatedSymbol::new(
                        sym.clone(),
                        LibraryId(idx),
                        lib.base_addr(),
                    ));
                }
            }
        }

        Err(signal_error(
            0,
            &self.library(start).name,
            None,
            DlErrorKind::SymbolLookupFail {
                symname: name.to_string(),
            }
            .to_string(),
        ))
    }
}
