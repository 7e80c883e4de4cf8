//! Architecture-specific relocation handling.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported target architecture");

use crate::context::Context;
use crate::delayed::DelayedReloc;

/// Invoke an IFUNC resolver at `addr` and return the address it selects.
///
/// # Safety
/// `addr` must be the entry point of a function with the IFUNC resolver
/// ABI, and the object defining it must be fully relocated.
pub(crate) unsafe fn call_ifunc_resolver(addr: u64) -> u64 {
    let resolver: extern "C" fn() -> u64 = core::mem::transmute(addr as usize);
    resolver()
}

/// Apply one previously deferred relocation.
///
/// # Safety
/// The record's target address and any resolver it names must still be
/// valid; the objects involved must have had their immediate relocations
/// performed.
pub(crate) unsafe fn apply_delayed(ctx: &Context, dr: &DelayedReloc) {
    let base = ctx.library(dr.map).base_addr() as u64;
    match dr.rela.r_type {
        REL_IRELATIVE => {
            let value = call_ifunc_resolver(base.wrapping_add_signed(dr.rela.r_addend));
            dr.reloc_addr.write(value);
        }
        REL_COPY => {
            let sym = dr
                .sym
                .as_ref()
                .expect("copy relocation record without a source symbol");
            let sym_map = dr
                .sym_map
                .expect("copy relocation record without a source object");
            let size = dr
                .refsym
                .as_ref()
                .map(|refsym| refsym.size)
                .unwrap_or(sym.size)
                .min(sym.size);
            let src: *const u8 = ctx.library(sym_map).laddr(sym.value);
            core::ptr::copy_nonoverlapping(src, dr.reloc_addr as *mut u8, size as usize);
        }
        _ => {
            // A GOT, PLT, or data relocation bound to an IFUNC definition.
            let sym = dr
                .sym
                .as_ref()
                .expect("deferred symbol relocation without a resolved symbol");
            let sym_map = dr
                .sym_map
                .expect("deferred symbol relocation without a defining object");
            let resolver = (ctx.library(sym_map).base_addr() as u64).wrapping_add(sym.value);
            let mut value = call_ifunc_resolver(resolver);
            if dr.rela.r_type == REL_SYMBOLIC {
                value = value.wrapping_add_signed(dr.rela.r_addend);
            }
            dr.reloc_addr.write(value);
        }
    }
}
