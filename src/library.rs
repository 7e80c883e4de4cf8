//! Management of individual libraries.

use std::fmt::{Debug, Display};
use std::io;

use elf::relocation::Rela;
use memmap2::MmapMut;
use petgraph::stable_graph::NodeIndex;

use crate::symbol::SymbolDef;

/// The ID type for a loaded library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LibraryId(pub(crate) NodeIndex);

impl Display for LibraryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.index())
    }
}

/// State of relocation processing for a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RelocState {
    /// The library has not been relocated.
    #[default]
    Unrelocated,
    /// The library is in the process of being relocated, or that process
    /// failed partway through.
    PartialRelocation,
    /// The library is relocated.
    Relocated,
}

/// Anonymous memory backing a loaded object's image.
///
/// The mapping's address is captured once at creation; all later access to
/// the image goes through that raw pointer, so relocation targets can be
/// written while the rest of the object is borrowed elsewhere.
pub struct Backing {
    _map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

impl Backing {
    pub fn new(len: usize) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(len)?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            ptr,
            len,
        })
    }

    /// The load base of the image.
    pub fn load_addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store a word at `offset` bytes into the image.
    pub fn write_word(&mut self, offset: u64, value: u64) {
        assert!(offset as usize + 8 <= self.len);
        unsafe {
            (self.ptr.add(offset as usize) as *mut u64).write_unaligned(value);
        }
    }

    /// Load a word from `offset` bytes into the image.
    pub fn read_word(&self, offset: u64) -> u64 {
        assert!(offset as usize + 8 <= self.len);
        unsafe { (self.ptr.add(offset as usize) as *const u64).read_unaligned() }
    }
}

/// An individual loaded library.
pub struct Library {
    /// Name of this library. Empty for the main executable.
    pub name: String,
    /// The node index in the context's dependency graph.
    pub(crate) idx: NodeIndex,
    /// The memory image of the object.
    image: Backing,
    /// Dynamic symbol table, including the reserved null entry at index 0.
    dynsyms: Vec<SymbolDef>,
    /// Relocation entries for this object.
    pub(crate) relas: Vec<Rela>,
    pub(crate) reloc_state: RelocState,
    /// The object has recorded delayed relocations that have not been
    /// applied yet.
    pub(crate) delayed_relocations: bool,
}

impl Library {
    pub(crate) fn new(
        name: String,
        image: Backing,
        dynsyms: Vec<SymbolDef>,
        relas: Vec<Rela>,
    ) -> Self {
        Self {
            name,
            idx: NodeIndex::end(),
            image,
            dynsyms,
            relas,
            reloc_state: RelocState::default(),
            delayed_relocations: false,
        }
    }

    pub fn id(&self) -> LibraryId {
        LibraryId(self.idx)
    }

    /// The load base of this library's image.
    pub fn base_addr(&self) -> usize {
        self.image.load_addr()
    }

    /// Compute an address within the image from a base-relative value.
    pub fn laddr<T>(&self, val: u64) -> *const T {
        (self.base_addr() as u64).wrapping_add(val) as usize as *const T
    }

    /// Compute a mutable address within the image from a base-relative value.
    pub fn laddr_mut<T>(&self, val: u64) -> *mut T {
        (self.base_addr() as u64).wrapping_add(val) as usize as *mut T
    }

    pub fn is_relocated(&self) -> bool {
        self.reloc_state == RelocState::Relocated
    }

    /// Whether this object still has delayed relocations pending.
    pub fn has_delayed_relocations(&self) -> bool {
        self.delayed_relocations
    }

    /// Load a word from `offset` bytes into the image.
    pub fn read_word(&self, offset: u64) -> u64 {
        self.image.read_word(offset)
    }

    pub(crate) fn lookup_symbol(&self, name: &str) -> Option<&SymbolDef> {
        self.dynsyms
            .iter()
            .skip(1)
            .find(|sym| !sym.is_undefined() && sym.name == name)
    }

    /// The symbol table entry referenced by a relocation, if any.
    pub(crate) fn refsym(&self, r_sym: u32) -> Option<&SymbolDef> {
        if r_sym == 0 {
            None
        } else {
            self.dynsyms.get(r_sym as usize)
        }
    }
}

impl Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "<executable>")
        } else {
            write!(f, "{}", self.name)
        }
    }
}

impl Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("idx", &self.idx)
            .field("base", &self.base_addr())
            .field("reloc_state", &self.reloc_state)
            .field("delayed_relocations", &self.delayed_relocations)
            .finish()
    }
}
