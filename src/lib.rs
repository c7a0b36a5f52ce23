//! `dwpack` is a post-link analysis tool that reads
//! [DWARF](https://dwarfstd.org/) debugging information from an object file,
//! reconstructs the in-memory layout of every struct/class it describes,
//! finds the padding holes alignment has introduced, and proposes a member
//! ordering with a smaller `sizeof`.
//!
//! The crate is split into a boundary layer and a core. The boundary
//! ([`dwarf`]) maps an ELF file into the flat DIE index defined by [`die`];
//! everything downstream ([`parse`], [`layout`], [`repack`], [`format`])
//! works purely on that index and on the [`types::TypeTable`], so the core
//! can be driven by hand-built trees in tests.

pub mod die;
pub mod dwarf;
pub mod format;
pub mod layout;
pub mod parse;
pub mod repack;
pub mod types;

pub use die::{DieIndex, Die, DieTag, MemberLocation};
pub use dwarf::Dwarf;
pub use types::{TypeTable, TypeId, Type, StructType, Slot};

/// Error type for loading DWARF information and for layout analysis
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load dwarf info from file: {0}")]
    DwarfLoad(String),

    #[error("object failed to parse file")]
    Object(#[from] object::Error),

    #[error("gimli failed to read a dwarf section")]
    Gimli(#[from] gimli::Error),

    // Non fatal, recovered per-struct
    #[error("type is not well defined: {0}")]
    TypeNotWellDefined(String),

    // Non fatal, recovered per-struct
    #[error("unexpected empty base: {0}")]
    Ebo(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Per-struct errors are recovered by skipping the struct; anything
    /// else aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::TypeNotWellDefined(_) | Error::Ebo(_))
    }
}
