//! Page-granular append-only storage.
//!
//! The ledger for delayed relocations must be able to grow without touching
//! the ordinary heap, which may not be usable at the point relocations are
//! recorded. [`PageArena`] stores records in page-sized anonymous mappings,
//! appending a fresh page only when the current one is full, and iterates
//! in strict insertion order.

use std::io;
use std::marker::PhantomData;
use std::mem;

use memmap2::MmapMut;

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

struct Page<T> {
    map: MmapMut,
    len: usize,
    _records: PhantomData<T>,
}

impl<T> Page<T> {
    fn base(&self) -> *const T {
        self.map.as_ptr() as *const T
    }
}

impl<T> Drop for Page<T> {
    fn drop(&mut self) {
        let base = self.map.as_mut_ptr() as *mut T;
        for i in 0..self.len {
            unsafe { base.add(i).drop_in_place() };
        }
    }
}

/// An append-only arena of `T` backed by page-sized anonymous mappings.
pub struct PageArena<T> {
    pages: Vec<Page<T>>,
    /// Records per page, computed once from the system page size.
    per_page: usize,
    page_size: usize,
}

impl<T> PageArena<T> {
    pub fn new() -> Self {
        let page_size = page_size();
        let per_page = page_size / mem::size_of::<T>();
        assert!(per_page > 0, "record type larger than a page");
        assert!(mem::align_of::<T>() <= page_size);
        Self {
            pages: Vec::new(),
            per_page,
            page_size,
        }
    }

    /// Append one record. Mapping a new page is the only failure path.
    pub fn push(&mut self, value: T) -> io::Result<()> {
        if self.pages.last().map_or(true, |p| p.len == self.per_page) {
            let map = MmapMut::map_anon(self.page_size)?;
            self.pages.push(Page {
                map,
                len: 0,
                _records: PhantomData,
            });
        }
        let page = self.pages.last_mut().unwrap();
        unsafe {
            let base = page.map.as_mut_ptr() as *mut T;
            base.add(page.len).write(value);
        }
        page.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.len == 0)
    }

    /// Visit records in insertion order, across page boundaries.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|p| {
            let base = p.base();
            (0..p.len).map(move |i| unsafe { &*base.add(i) })
        })
    }
}

impl<T> Default for PageArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
