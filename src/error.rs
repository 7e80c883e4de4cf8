//! Definitions for errors for the dynamic loader.

use miette::Diagnostic;
use thiserror::Error;

use crate::catch::Exception;

/// An error caught by [`crate::catch_exception`]: the raw error code plus
/// the exception record populated at the signal site.
#[derive(Debug, Error, Diagnostic)]
#[error("{exception}")]
pub struct CaughtError {
    /// An errno-like error code, or 0 if none was supplied.
    pub code: i32,
    pub exception: Exception,
}

/// Structured failure kinds produced by the relocation engine. These render
/// the diagnostic text that ends up in an [`Exception`].
#[derive(Debug, Error, Diagnostic)]
pub enum DlErrorKind {
    #[error("undefined symbol: {symname}")]
    SymbolLookupFail { symname: String },
    #[error("unsupported relocation type {reloc}")]
    UnsupportedReloc { reloc: u32 },
    #[error("invalid relocation, no symbol data")]
    MissingSymbolData,
    #[error("library {library} is in an inconsistent relocation state")]
    RelocationStateFail { library: String },
    #[error("unknown library id")]
    UnknownLibrary,
}
