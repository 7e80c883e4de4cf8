pub use elf::abi::{
    R_X86_64_64 as REL_SYMBOLIC, R_X86_64_COPY as REL_COPY, R_X86_64_GLOB_DAT as REL_GOT,
    R_X86_64_JUMP_SLOT as REL_PLT, R_X86_64_RELATIVE as REL_RELATIVE,
};

/// R_X86_64_IRELATIVE, not in the `elf` crate's abi tables.
pub const REL_IRELATIVE: u32 = 37;
