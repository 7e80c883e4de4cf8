//! Relocation processing, including deferral of relocations whose result
//! depends on relocations not yet performed elsewhere.

use elf::relocation::Rela;
use petgraph::visit::DfsPostOrder;
use tracing::{debug, trace};

use super::Context;
use crate::arch::{
    self, REL_COPY, REL_GOT, REL_IRELATIVE, REL_PLT, REL_RELATIVE, REL_SYMBOLIC,
};
use crate::catch::{catch_exception, signal_error, OpResult};
use crate::delayed::DelayedReloc;
use crate::error::{CaughtError, DlErrorKind};
use crate::library::{LibraryId, RelocState};
use crate::symbol::{LookupFlags, RelocatedSymbol};

impl Context {
    /// Relocate `root` and everything it depends on.
    ///
    /// Dependencies are processed before their dependents. Relocations
    /// that cannot be applied yet are deferred and replayed once the walk
    /// completes; on failure the speculative deferrals are discarded and
    /// the caught error is returned.
    pub fn relocate_all(&mut self, root: LibraryId) -> Result<(), CaughtError> {
        self.init_delayed();
        match catch_exception(|| self.relocate_tree(root)) {
            Ok(()) => {
                self.apply_delayed();
                Ok(())
            }
            Err(err) => {
                self.clear_delayed();
                Err(err)
            }
        }
    }

    fn relocate_tree(&mut self, root: LibraryId) -> OpResult<()> {
        let mut order = Vec::new();
        let mut visit = DfsPostOrder::new(&self.library_deps, root.0);
        while let Some(idx) = visit.next(&self.library_deps) {
            order.push(idx);
        }
        for idx in order {
            self.relocate_single(LibraryId(idx))?;
        }
        Ok(())
    }

    fn relocate_single(&mut self, id: LibraryId) -> OpResult<()> {
        match self.library(id).reloc_state {
            RelocState::Relocated => {
                trace!("{}: already relocated", self.library(id));
                return Ok(());
            }
            RelocState::PartialRelocation => {
                return Err(signal_error(
                    0,
                    &self.library(id).name,
                    None,
                    DlErrorKind::RelocationStateFail {
                        library: self.library(id).to_string(),
                    }
                    .to_string(),
                ));
            }
            RelocState::Unrelocated => {}
        }
        debug!("{}: relocating library", self.library(id));
        self.library_mut(id).reloc_state = RelocState::PartialRelocation;
        for index in 0..self.library(id).relas.len() {
            self.do_reloc(id, index)?;
        }
        self.library_mut(id).reloc_state = RelocState::Relocated;
        Ok(())
    }

    fn do_reloc(&mut self, id: LibraryId, index: usize) -> OpResult<()> {
        let lib = self.library(id);
        let rela = &lib.relas[index];
        let (r_offset, r_sym, r_type, r_addend) =
            (rela.r_offset, rela.r_sym, rela.r_type, rela.r_addend);
        let base = lib.base_addr() as u64;
        let target: *mut u64 = lib.laddr_mut(r_offset);
        let own_delayed = lib.delayed_relocations;

        match r_type {
            REL_RELATIVE => unsafe {
                *target = base.wrapping_add_signed(r_addend);
            },
            REL_IRELATIVE => {
                if own_delayed {
                    // The resolver may depend on other relocations in this
                    // object that have themselves been deferred.
                    self.defer(id, index, None)?;
                } else {
                    let value =
                        unsafe { arch::call_ifunc_resolver(base.wrapping_add_signed(r_addend)) };
                    unsafe {
                        *target = value;
                    }
                }
            }
            REL_SYMBOLIC | REL_GOT | REL_PLT => {
                let resolved = self.resolve(id, r_sym, LookupFlags::empty())?;
                let def_lib = self.library(resolved.lib);
                if resolved.sym.is_ifunc()
                    && (!def_lib.is_relocated() || def_lib.delayed_relocations)
                {
                    // The defining object is not fully relocated, so the
                    // resolver cannot run yet.
                    self.defer(id, index, Some(resolved))?;
                } else {
                    let mut value = if resolved.sym.is_ifunc() {
                        unsafe { arch::call_ifunc_resolver(resolved.reloc_value()) }
                    } else {
                        resolved.reloc_value()
                    };
                    if r_type == REL_SYMBOLIC {
                        value = value.wrapping_add_signed(r_addend);
                    }
                    unsafe {
                        *target = value;
                    }
                }
            }
            REL_COPY => {
                // Copy relocations bind to a definition outside the
                // requesting object.
                let resolved =
                    self.resolve(id, r_sym, LookupFlags::SKIP_SELF | LookupFlags::SKIP_GLOBAL)?;
                if self.library(resolved.lib).delayed_relocations {
                    // The source bytes may still change when the source
                    // object's deferred relocations are applied.
                    self.defer(id, index, Some(resolved))?;
                } else {
                    let size = self
                        .library(id)
                        .refsym(r_sym)
                        .map(|refsym| refsym.size)
                        .unwrap_or(resolved.size())
                        .min(resolved.size());
                    let src: *const u8 = self.library(resolved.lib).laddr(resolved.raw_value());
                    unsafe {
                        std::ptr::copy_nonoverlapping(src, target as *mut u8, size as usize);
                    }
                }
            }
            other => {
                return Err(signal_error(
                    0,
                    &self.library(id).name,
                    None,
                    DlErrorKind::UnsupportedReloc { reloc: other }.to_string(),
                ));
            }
        }
        Ok(())
    }

    fn defer(
        &mut self,
        id: LibraryId,
        index: usize,
        resolved: Option<RelocatedSymbol>,
    ) -> OpResult<()> {
        let lib = self.library(id);
        let rela = &lib.relas[index];
        let record = DelayedReloc {
            map: id,
            refsym: lib.refsym(rela.r_sym).cloned(),
            rela: Rela {
                r_offset: rela.r_offset,
                r_sym: rela.r_sym,
                r_type: rela.r_type,
                r_addend: rela.r_addend,
            },
            reloc_addr: lib.laddr_mut(rela.r_offset),
            sym: resolved.as_ref().map(|r| r.sym.clone()),
            sym_map: resolved.as_ref().map(|r| r.lib),
        };
        trace!(
            "{}: deferring relocation at {:#x}",
            lib,
            record.reloc_addr as usize
        );
        self.record_delayed(record)
    }

    fn resolve(
        &self,
        id: LibraryId,
        r_sym: u32,
        flags: LookupFlags,
    ) -> OpResult<RelocatedSymbol> {
        let lib = self.library(id);
        let Some(refsym) = lib.refsym(r_sym) else {
            return Err(signal_error(
                0,
                &lib.name,
                None,
                DlErrorKind::MissingSymbolData.to_string(),
            ));
        };
        let name = refsym.name.clone();
        self.lookup_symbol(id, &name, flags)
    }
}
