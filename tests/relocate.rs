//! End-to-end relocation scenarios, driving real IFUNC resolver functions
//! through the deferral machinery.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use dlcore::arch::{REL_COPY, REL_GOT, REL_IRELATIVE, REL_RELATIVE};
use dlcore::elf::relocation::Rela;
use dlcore::library::Backing;
use dlcore::symbol::{LookupFlags, SymbolDef, STT_GNU_IFUNC};
use dlcore::{catch_exception, switch_to_thread_frames, Context, DebugFlags};

// The delayed relocation ledger and the resolver-side statics are
// process-global, so these tests must not overlap.
fn serialize() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    switch_to_thread_frames();
    LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

fn rela(offset: u64, sym: u32, rtype: u32, addend: i64) -> Rela {
    Rela {
        r_offset: offset,
        r_sym: sym,
        r_type: rtype,
        r_addend: addend,
    }
}

/// Symbol value that makes `base + value` equal the given function.
fn fn_value(base: usize, f: extern "C" fn() -> u64) -> u64 {
    (f as usize as u64).wrapping_sub(base as u64)
}

extern "C" fn pick_fixed() -> u64 {
    0x42
}

static CELL_ADDR: AtomicUsize = AtomicUsize::new(0);

extern "C" fn pick_reads_cell() -> u64 {
    unsafe { *(CELL_ADDR.load(Ordering::SeqCst) as *const u64) }
}

static SEQ: AtomicU64 = AtomicU64::new(0);

extern "C" fn pick_sequence() -> u64 {
    SEQ.fetch_add(1, Ordering::SeqCst)
}

extern "C" fn pick_feed() -> u64 {
    0xfeed
}

#[test]
fn relative_relocations_apply_immediately() {
    let _guard = serialize();
    let mut ctx = Context::new();
    let image = Backing::new(64).unwrap();
    let base = image.load_addr() as u64;
    let lib = ctx.add_library(
        "libdata.so",
        image,
        vec![SymbolDef::null()],
        vec![rela(0, 0, REL_RELATIVE, 0x10)],
    );
    ctx.relocate_all(lib).unwrap();
    assert_eq!(ctx.library(lib).read_word(0), base + 0x10);
    assert!(ctx.library(lib).is_relocated());
    assert!(!ctx.library(lib).has_delayed_relocations());
}

#[test]
fn ifunc_in_relocated_dependency_binds_immediately() {
    let _guard = serialize();
    let mut ctx = Context::new();

    let dep_image = Backing::new(64).unwrap();
    let dep_syms = vec![
        SymbolDef::null(),
        SymbolDef::new(
            "pick",
            fn_value(dep_image.load_addr(), pick_fixed),
            0,
            STT_GNU_IFUNC,
        ),
    ];
    let dep = ctx.add_library("libpick.so", dep_image, dep_syms, vec![]);

    let main_image = Backing::new(64).unwrap();
    let main_syms = vec![SymbolDef::null(), SymbolDef::undefined("pick")];
    let main = ctx.add_library("", main_image, main_syms, vec![rela(0, 1, REL_GOT, 0)]);
    ctx.add_dep(main, dep);

    ctx.relocate_all(main).unwrap();
    // The dependency was fully relocated first, so the resolver ran at the
    // binding site and nothing was deferred.
    assert_eq!(ctx.library(main).read_word(0), 0x42);
    assert!(!ctx.library(main).has_delayed_relocations());
    assert!(!ctx.library(dep).has_delayed_relocations());
}

#[test]
fn resolver_in_unrelocated_object_runs_after_its_relocations() {
    let _guard = serialize();
    let mut ctx = Context::new();

    // A defines an IFUNC whose resolver reads a cell that A's own relative
    // relocation initializes.
    let a_image = Backing::new(64).unwrap();
    let a_base = a_image.load_addr();
    CELL_ADDR.store(a_base + 8, Ordering::SeqCst);
    let a_syms = vec![
        SymbolDef::null(),
        SymbolDef::new("pick", fn_value(a_base, pick_reads_cell), 0, STT_GNU_IFUNC),
    ];
    let a = ctx.add_library(
        "liba.so",
        a_image,
        a_syms,
        vec![rela(8, 0, REL_RELATIVE, 0x10)],
    );

    // B binds to the IFUNC while A is not yet relocated.
    let b_image = Backing::new(64).unwrap();
    let b_syms = vec![SymbolDef::null(), SymbolDef::undefined("pick")];
    let b = ctx.add_library("libb.so", b_image, b_syms, vec![rela(0, 1, REL_GOT, 0)]);

    ctx.add_dep(a, b);
    ctx.add_dep(b, a);

    ctx.relocate_all(a).unwrap();
    // The binding was deferred, so the resolver observed the relocated cell.
    assert_eq!(ctx.library(b).read_word(0), a_base as u64 + 0x10);
    assert!(!ctx.library(a).has_delayed_relocations());
    assert!(!ctx.library(b).has_delayed_relocations());
    assert!(ctx.library(a).is_relocated());
    assert!(ctx.library(b).is_relocated());
}

#[test]
fn deferred_relative_ifuncs_replay_in_recording_order() {
    let _guard = serialize();
    const SLOTS: u64 = 200;
    SEQ.store(100, Ordering::SeqCst);
    let mut ctx = Context::new();

    let a_image = Backing::new(64).unwrap();
    let a_base = a_image.load_addr();
    let a_syms = vec![
        SymbolDef::null(),
        SymbolDef::new("pick", fn_value(a_base, pick_fixed), 0, STT_GNU_IFUNC),
    ];
    let a = ctx.add_library("liba.so", a_image, a_syms, vec![]);

    // The first relocation in B is deferred because A is unrelocated; every
    // relative IFUNC after it is then deferred as well, and enough of them
    // are recorded to spill the ledger across several pages.
    let b_image = Backing::new(((SLOTS + 2) * 8) as usize).unwrap();
    let b_base = b_image.load_addr();
    let b_syms = vec![SymbolDef::null(), SymbolDef::undefined("pick")];
    let mut b_relas = vec![rela(0, 1, REL_GOT, 0)];
    for slot in 0..SLOTS {
        b_relas.push(rela(
            8 + slot * 8,
            0,
            REL_IRELATIVE,
            fn_value(b_base, pick_sequence) as i64,
        ));
    }
    let b = ctx.add_library("libb.so", b_image, b_syms, b_relas);

    ctx.add_dep(a, b);
    ctx.add_dep(b, a);

    // Exercise the binding report alongside the replay.
    let subscriber = tracing_subscriber::fmt().with_test_writer().finish();
    dlcore::set_debug_mask(DebugFlags::BINDINGS);
    let result = tracing::subscriber::with_default(subscriber, || ctx.relocate_all(a));
    dlcore::set_debug_mask(DebugFlags::empty());
    result.unwrap();

    assert_eq!(ctx.library(b).read_word(0), 0x42);
    for slot in 0..SLOTS {
        assert_eq!(ctx.library(b).read_word(8 + slot * 8), 100 + slot);
    }
    assert!(!ctx.library(b).has_delayed_relocations());
}

#[test]
fn copy_relocation_waits_for_the_source_object() {
    let _guard = serialize();
    let mut ctx = Context::new();

    let a_image = Backing::new(64).unwrap();
    let a_base = a_image.load_addr();
    let a_syms = vec![
        SymbolDef::null(),
        SymbolDef::new("pick", fn_value(a_base, pick_fixed), 0, STT_GNU_IFUNC),
    ];
    let a = ctx.add_library("liba.so", a_image, a_syms, vec![]);

    // B's data symbol is finalized by a deferred relative IFUNC, so the
    // executable's copy relocation must not read it early.
    let b_image = Backing::new(64).unwrap();
    let b_base = b_image.load_addr();
    let b_syms = vec![
        SymbolDef::null(),
        SymbolDef::undefined("pick"),
        SymbolDef::new("shared_val", 16, 8, 0),
    ];
    let b_relas = vec![
        rela(0, 1, REL_GOT, 0),
        rela(16, 0, REL_IRELATIVE, fn_value(b_base, pick_feed) as i64),
    ];
    let b = ctx.add_library("libb.so", b_image, b_syms, b_relas);

    ctx.add_dep(a, b);
    ctx.add_dep(b, a);

    let main_image = Backing::new(64).unwrap();
    let main_syms = vec![SymbolDef::null(), SymbolDef::new("shared_val", 0, 8, 0)];
    let main = ctx.add_library("", main_image, main_syms, vec![rela(0, 1, REL_COPY, 0)]);
    ctx.add_dep(main, a);

    ctx.relocate_all(main).unwrap();
    assert_eq!(ctx.library(b).read_word(16), 0xfeed);
    assert_eq!(ctx.library(main).read_word(0), 0xfeed);
    assert!(!ctx.library(main).has_delayed_relocations());
    assert!(!ctx.library(b).has_delayed_relocations());
}

#[test]
fn missing_symbol_is_caught_and_ledger_discarded() {
    let _guard = serialize();
    let mut ctx = Context::new();

    let image = Backing::new(64).unwrap();
    let syms = vec![SymbolDef::null(), SymbolDef::undefined("nosuch")];
    let lib = ctx.add_library("libbroken.so", image, syms, vec![rela(0, 1, REL_GOT, 0)]);

    let caught = ctx.relocate_all(lib).unwrap_err();
    assert_eq!(caught.code, 0);
    assert_eq!(caught.exception.object_name, "libbroken.so");
    assert_eq!(caught.exception.message(), "undefined symbol: nosuch");

    // The failed walk left the library partially relocated; a retry reports
    // that instead of silently continuing.
    let again = ctx.relocate_all(lib).unwrap_err();
    assert!(again
        .exception
        .message()
        .contains("inconsistent relocation state"));

    // The discarded ledger released the active-collection guard.
    let mut fresh = Context::new();
    let ok_image = Backing::new(64).unwrap();
    let ok = fresh.add_library("libok.so", ok_image, vec![SymbolDef::null()], vec![]);
    fresh.relocate_all(ok).unwrap();
}

#[test]
fn relocating_twice_is_a_noop() {
    let _guard = serialize();
    let mut ctx = Context::new();
    let image = Backing::new(64).unwrap();
    let base = image.load_addr() as u64;
    let lib = ctx.add_library(
        "libdata.so",
        image,
        vec![SymbolDef::null()],
        vec![rela(0, 0, REL_RELATIVE, 8)],
    );
    ctx.relocate_all(lib).unwrap();
    ctx.relocate_all(lib).unwrap();
    assert_eq!(ctx.library(lib).read_word(0), base + 8);
}

#[test]
fn lookup_walks_dependencies_then_the_global_scope() {
    let _guard = serialize();
    let mut ctx = Context::new();

    let dep_image = Backing::new(64).unwrap();
    let dep_base = dep_image.load_addr() as u64;
    let dep_syms = vec![SymbolDef::null(), SymbolDef::new("answer", 0x20, 8, 0)];
    let dep = ctx.add_library("libdep.so", dep_image, dep_syms, vec![]);

    let main_image = Backing::new(64).unwrap();
    let main = ctx.add_library("", main_image, vec![SymbolDef::null()], vec![]);
    ctx.add_dep(main, dep);

    let orphan_image = Backing::new(64).unwrap();
    let orphan_syms = vec![SymbolDef::null(), SymbolDef::new("orphan", 0x8, 8, 0)];
    ctx.add_library("liborphan.so", orphan_image, orphan_syms, vec![]);

    let found = catch_exception(|| {
        ctx.lookup_symbol(main, "answer", LookupFlags::empty())
            .map(|sym| sym.reloc_value())
    })
    .unwrap();
    assert_eq!(found, dep_base + 0x20);

    // Not reachable through dependencies, but found by the global fallback.
    catch_exception(|| ctx.lookup_symbol(main, "orphan", LookupFlags::empty()).map(|_| ()))
        .unwrap();
    let caught = catch_exception(|| {
        ctx.lookup_symbol(main, "orphan", LookupFlags::SKIP_GLOBAL)
            .map(|_| ())
    })
    .unwrap_err();
    assert_eq!(caught.exception.message(), "undefined symbol: orphan");
}
