//! Management of the loader context.

use elf::relocation::Rela;
use petgraph::stable_graph::StableDiGraph;

use crate::delayed::DelayedRelocations;
use crate::error::DlErrorKind;
use crate::library::{Backing, Library, LibraryId};
use crate::symbol::SymbolDef;

mod relocate;
mod syms;

/// A loading context, tracking loaded libraries, the dependencies between
/// them, and any in-progress delayed relocation ledger.
pub struct Context {
    /// The dependency graph. An edge from A to B means A depends on B.
    pub(crate) library_deps: StableDiGraph<Library, ()>,
    /// The ledger for the load operation in progress, if any.
    pub(crate) delayed: Option<DelayedRelocations>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            library_deps: StableDiGraph::new(),
            delayed: None,
        }
    }

    /// Register a loaded object. `dynsyms` must include the reserved null
    /// entry at index 0; relocation symbol indices refer into it.
    pub fn add_library(
        &mut self,
        name: impl ToString,
        image: Backing,
        dynsyms: Vec<SymbolDef>,
        relas: Vec<Rela>,
    ) -> LibraryId {
        let lib = Library::new(name.to_string(), image, dynsyms, relas);
        let idx = self.library_deps.add_node(lib);
        self.library_deps[idx].idx = idx;
        LibraryId(idx)
    }

    /// Record that `parent` depends on `dep`.
    pub fn add_dep(&mut self, parent: LibraryId, dep: LibraryId) {
        self.library_deps.add_edge(parent.0, dep.0, ());
    }

    pub fn library(&self, id: LibraryId) -> &Library {
        &self.library_deps[id.0]
    }

    /// Checked variant of [`Context::library`], for IDs of unknown origin.
    pub fn get_library(&self, id: LibraryId) -> Result<&Library, DlErrorKind> {
        self.library_deps
            .node_weight(id.0)
            .ok_or(DlErrorKind::UnknownLibrary)
    }

    pub(crate) fn library_mut(&mut self, id: LibraryId) -> &mut Library {
        &mut self.library_deps[id.0]
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
