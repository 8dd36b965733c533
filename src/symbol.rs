//! The global symbol type. One `Symbol` exists per distinct name; files refer to symbols by
//! `SymbolId` and symbols refer back to their owning file by `FileId`. When an owning file dies
//! the symbol is reset in place, so IDs held elsewhere stay valid and observe the empty state.

use crate::elf;
use crate::input_file::FileId;
use crate::input_file::SectionRef;
use bitflags::bitflags;
use std::fmt::Display;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Visibility {
    #[default]
    Default,
    Internal,
    Hidden,
    Protected,
}

bitflags! {
    /// Requirements recorded while scanning relocations. Consumed, then cleared, by the
    /// dynamic-table allocation step.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u8 {
        const NEEDS_GOT = 1 << 0;
        const NEEDS_PLT = 1 << 1;
        const NEEDS_GOTTP = 1 << 2;
        const NEEDS_TLSGD = 1 << 3;
        const NEEDS_TLSDESC = 1 << 4;
        const NEEDS_TLSLD = 1 << 5;
        const NEEDS_COPYREL = 1 << 6;
    }
}

/// `SymbolFlags` that can be ORed into from multiple threads.
#[derive(Debug, Default)]
pub struct AtomicSymbolFlags(AtomicU8);

impl AtomicSymbolFlags {
    pub fn fetch_or(&self, flags: SymbolFlags) {
        self.0.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> SymbolFlags {
        SymbolFlags::from_bits_retain(self.0.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Strength class used when two files both supply a candidate for the same name. Lower wins.
/// Ties are broken by `(file priority, symbol index)`. Definitions in shared objects and in
/// not-yet-loaded archive members share the deferred classes, so command-line order decides
/// between them; a weak definition in a loaded object still beats both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SymbolRank {
    StrongDefined = 1,
    WeakDefined = 2,
    DeferredStrong = 3,
    DeferredWeak = 4,
    Common = 5,
    /// No definition: either never seen or reset when the owner died.
    Unresolved = 6,
}

/// Per-dynamic-symbol offsets into the auxiliary tables. A row is allocated the first time a
/// symbol needs any slot; unused columns stay `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolAux {
    pub got_idx: Option<u32>,
    pub gottp_idx: Option<u32>,
    pub tlsgd_idx: Option<u32>,
    pub tlsdesc_idx: Option<u32>,
    pub plt_idx: Option<u32>,
    pub pltgot_idx: Option<u32>,
    pub dynsym_idx: Option<u32>,
}

#[derive(Debug)]
pub struct Symbol<'data> {
    pub name: &'data [u8],

    /// The file currently supplying this symbol's definition, if any.
    pub file: Option<FileId>,
    /// Index of the defining entry in the owner's ELF symbol table.
    pub esym_index: u32,
    pub rank: SymbolRank,

    pub value: u64,
    /// Output section index, fixed late for linker-synthesized symbols. Zero means absolute or
    /// not yet assigned.
    pub shndx: u32,
    pub origin_section: Option<SectionRef>,
    pub sym_type: u8,
    pub visibility: Visibility,

    pub ver_idx: AtomicU16,
    /// Index into `Context::symbol_aux`; `None` iff no GOT/PLT/dynsym slot is reserved.
    pub aux_idx: Option<u32>,

    pub flags: AtomicSymbolFlags,
    pub is_imported: AtomicBool,
    pub is_exported: AtomicBool,
    pub is_weak: AtomicBool,
    pub has_copyrel: bool,
    pub copyrel_readonly: bool,

    /// Serializes the rare multi-field updates performed from parallel passes.
    lock: Mutex<()>,
}

impl<'data> Symbol<'data> {
    pub fn new(name: &'data [u8]) -> Self {
        Symbol {
            name,
            file: None,
            esym_index: 0,
            rank: SymbolRank::Unresolved,
            value: 0,
            shndx: 0,
            origin_section: None,
            sym_type: elf::STT_NOTYPE,
            visibility: Visibility::Default,
            ver_idx: AtomicU16::new(elf::VER_NDX_GLOBAL),
            aux_idx: None,
            flags: AtomicSymbolFlags::default(),
            is_imported: AtomicBool::new(false),
            is_exported: AtomicBool::new(false),
            is_weak: AtomicBool::new(false),
            has_copyrel: false,
            copyrel_readonly: false,
            lock: Mutex::new(()),
        }
    }

    /// Re-initializes the symbol to its empty state, preserving only the name. Used when the
    /// owning file is dropped from the link so that other holders of the ID see "undefined"
    /// rather than stale state.
    pub fn reset(&mut self) {
        *self = Symbol::new(self.name);
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("symbol lock poisoned")
    }

    pub fn is_defined(&self) -> bool {
        self.file.is_some() && self.rank < SymbolRank::Unresolved
    }

    pub fn is_ifunc(&self) -> bool {
        self.sym_type == elf::STT_GNU_IFUNC
    }

    pub fn is_func(&self) -> bool {
        self.sym_type == elf::STT_FUNC || self.sym_type == elf::STT_GNU_IFUNC
    }

    pub fn is_tls(&self) -> bool {
        self.sym_type == elf::STT_TLS
    }

    pub fn ver_idx(&self) -> u16 {
        self.ver_idx.load(Ordering::Relaxed)
    }

    pub fn imported(&self) -> bool {
        self.is_imported.load(Ordering::Relaxed)
    }

    pub fn exported(&self) -> bool {
        self.is_exported.load(Ordering::Relaxed)
    }
}

impl Display for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.name), f)
    }
}
