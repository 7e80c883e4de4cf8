pub use elf::abi::{
    R_AARCH64_ABS64 as REL_SYMBOLIC, R_AARCH64_COPY as REL_COPY,
    R_AARCH64_GLOB_DAT as REL_GOT, R_AARCH64_JUMP_SLOT as REL_PLT,
    R_AARCH64_RELATIVE as REL_RELATIVE,
};

/// R_AARCH64_IRELATIVE, not in the `elf` crate's abi tables.
pub const REL_IRELATIVE: u32 = 1032;
