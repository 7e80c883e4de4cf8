//! Symbol definitions and lookup results.

use crate::library::LibraryId;

/// ELF symbol type for indirect functions whose final address is computed
/// by a resolver at load time. Not in the `elf` crate's abi tables.
pub const STT_GNU_IFUNC: u8 = 10;

bitflags::bitflags! {
    /// Options for symbol lookup across the dependency graph.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Skip the definitions of the object the lookup starts from.
        const SKIP_SELF = 1 << 0;
        /// Skip the transitive dependencies of the starting object.
        const SKIP_DEPS = 1 << 1;
        /// Skip the global fallback search over all loaded objects.
        const SKIP_GLOBAL = 1 << 2;
    }
}

/// One entry in a library's dynamic symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolDef {
    pub name: String,
    /// Value relative to the defining object's load base.
    pub value: u64,
    pub size: u64,
    /// ELF symbol type (`STT_*`).
    pub symtype: u8,
    /// Defining section index; `SHN_UNDEF` (0) marks a reference to a
    /// definition in some other object.
    pub shndx: u16,
}

impl SymbolDef {
    pub fn new(name: impl Into<String>, value: u64, size: u64, symtype: u8) -> Self {
        Self {
            name: name.into(),
            value,
            size,
            symtype,
            shndx: 1,
        }
    }

    /// An undefined reference, to be satisfied by another object.
    pub fn undefined(name: impl Into<String>) -> Self {
        Self {
            shndx: 0,
            ..Self::new(name, 0, 0, 0)
        }
    }

    /// The reserved null entry at symbol table index 0.
    pub fn null() -> Self {
        Self {
            shndx: 0,
            ..Self::new("", 0, 0, 0)
        }
    }

    pub fn is_undefined(&self) -> bool {
        self.shndx == 0
    }

    pub fn is_ifunc(&self) -> bool {
        self.symtype == STT_GNU_IFUNC
    }
}

/// A symbol resolved against a loaded library.
#[derive(Debug, Clone)]
pub struct RelocatedSymbol {
    pub sym: SymbolDef,
    /// The defining library.
    pub lib: LibraryId,
    pub(crate) base: usize,
}

impl RelocatedSymbol {
    pub(crate) fn new(sym: SymbolDef, lib: LibraryId, base: usize) -> Self {
        Self { sym, lib, base }
    }

    /// The symbol's runtime address.
    pub fn reloc_value(&self) -> u64 {
        (self.base as u64).wrapping_add(self.sym.value)
    }

    /// The symbol's value before adjusting for the load base.
    pub fn raw_value(&self) -> u64 {
        self.sym.value
    }

    pub fn size(&self) -> u64 {
        self.sym.size
    }
}
