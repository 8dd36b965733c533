//! Input file representations: relocatable objects and shared objects, as delivered by the
//! upstream parser. Files own their sections and ELF symbol arrays and hold `SymbolId`s into the
//! global table for their globals.

use crate::chunk::ChunkId;
use crate::elf::InputSymbol;
use crate::elf::SectionHeader;
use crate::merged_section::FragmentRef;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use smallvec::SmallVec;
use std::fmt::Display;
use std::ops::Range;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Identifies an input file. The high bit distinguishes shared objects from relocatable objects;
/// the rest indexes into `Context::objs` or `Context::dsos`. IDs stay valid for the whole link,
/// including for files that get dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

const DSO_BIT: u32 = 1 << 31;

impl FileId {
    pub fn object(index: usize) -> Self {
        FileId(u32::try_from(index).expect("file IDs overflowed"))
    }

    pub fn shared(index: usize) -> Self {
        FileId(u32::try_from(index).expect("file IDs overflowed") | DSO_BIT)
    }

    pub fn is_dso(self) -> bool {
        self.0 & DSO_BIT != 0
    }

    pub fn index(self) -> usize {
        (self.0 & !DSO_BIT) as usize
    }
}

/// Points at one input section of one object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRef {
    pub file: FileId,
    pub section: u32,
}

/// Architecture-neutral classification of a relocation, produced by the upstream decoder. The
/// scanner maps these to symbol requirements; actual relocation application is the writer's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// A pointer-sized absolute address is stored.
    Absolute,
    /// A PC-relative reference to code or data.
    PcRelative,
    /// A call or jump that may go through the PLT.
    PltCall,
    /// The address is loaded from the GOT.
    GotLoad,
    /// The thread-pointer offset is loaded from the GOT.
    GotTpOff,
    /// General-dynamic TLS model: module + offset pair in the GOT.
    TlsGd,
    /// TLS descriptor in the GOT.
    TlsDesc,
    /// Local-dynamic TLS model: the per-module GOT slot.
    TlsLd,
}

#[derive(Debug, Clone, Copy)]
pub struct InputReloc {
    pub offset: u64,
    pub kind: RelocKind,
    /// Index into the file's ELF symbol table.
    pub sym_index: u32,
    pub addend: i64,
}

/// A section owned by an object file. `output_section` is the forward edge established at load
/// time; the reverse edges are built by section binning.
#[derive(Debug)]
pub struct InputSection<'data> {
    pub name: &'data [u8],
    pub shdr: SectionHeader,
    pub data: &'data [u8],
    pub relocs: Vec<InputReloc>,
    pub output_section: Option<ChunkId>,
    offset: AtomicU64,
    alive: AtomicBool,
}

impl<'data> InputSection<'data> {
    pub fn new(name: &'data [u8], shdr: SectionHeader, data: &'data [u8]) -> Self {
        InputSection {
            name,
            shdr,
            data,
            relocs: Vec::new(),
            output_section: None,
            offset: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

/// A COMDAT group: a signature key plus the indices of the member sections. Exactly one group
/// survives per key across the whole link.
#[derive(Debug)]
pub struct ComdatGroup<'data> {
    pub key: &'data [u8],
    pub members: Vec<u32>,
}

#[derive(Debug)]
pub struct ObjectFile<'data> {
    pub name: &'data str,
    /// Name of the containing archive, if the object came out of one.
    pub archive_name: Option<&'data str>,
    /// Insertion order; lower wins symbol-resolution ties.
    pub priority: u32,

    pub elf_syms: Vec<InputSymbol<'data>>,
    pub first_global: usize,
    /// Global-table IDs, parallel to `elf_syms[first_global..]`.
    pub symbols: Vec<SymbolId>,

    pub sections: Vec<InputSection<'data>>,
    pub comdat_groups: Vec<ComdatGroup<'data>>,
    pub fragments: Vec<FragmentRef>,
    /// Per-global version request strings (from `.symver` directives), parallel to `symbols`.
    pub symvers: Vec<Option<&'data str>>,

    /// `.note.gnu.property` feature bits.
    pub features: u32,
    /// Archive members start out dead and only join the link when a definition is needed.
    pub is_in_lib: bool,
    pub exclude_libs: bool,

    alive: AtomicBool,
}

impl<'data> ObjectFile<'data> {
    pub fn new(name: &'data str, archive_name: Option<&'data str>) -> Self {
        let is_in_lib = archive_name.is_some();
        ObjectFile {
            name,
            archive_name,
            priority: 0,
            elf_syms: Vec::new(),
            first_global: 0,
            symbols: Vec::new(),
            sections: Vec::new(),
            comdat_groups: Vec::new(),
            fragments: Vec::new(),
            symvers: Vec::new(),
            features: 0,
            is_in_lib,
            exclude_libs: false,
            alive: AtomicBool::new(!is_in_lib),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Marks the file live. Returns true if this call was the one that brought it to life, which
    /// gives at-most-once enqueue during liveness propagation.
    pub fn mark_alive(&self) -> bool {
        !self.alive.swap(true, Ordering::SeqCst)
    }

    /// Iterates the file's global symbols as (symbol-table index, entry, global-table ID).
    pub fn global_symbols(
        &self,
    ) -> impl Iterator<Item = (usize, &InputSymbol<'data>, SymbolId)> + '_ {
        self.elf_syms[self.first_global..]
            .iter()
            .zip(&self.symbols)
            .enumerate()
            .map(|(offset, (esym, id))| (self.first_global + offset, esym, *id))
    }

    /// The global-table ID for the symbol at `esym_index`, if it is a global.
    pub fn symbol_id(&self, esym_index: usize) -> Option<SymbolId> {
        esym_index
            .checked_sub(self.first_global)
            .and_then(|offset| self.symbols.get(offset).copied())
    }

    pub fn section(&self, index: u32) -> &InputSection<'data> {
        &self.sections[index as usize]
    }
}

impl Display for ObjectFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.archive_name {
            Some(archive) => write!(f, "{}({})", archive, self.name),
            None => Display::fmt(self.name, f),
        }
    }
}

#[derive(Debug)]
pub struct SharedFile<'data> {
    pub name: &'data str,
    pub soname: &'data str,
    pub priority: u32,

    /// Exported globals only.
    pub elf_syms: Vec<InputSymbol<'data>>,
    pub symbols: Vec<SymbolId>,

    /// Address ranges mapped read-only at runtime; used to pick the COPYREL destination.
    pub ro_ranges: Vec<Range<u64>>,

    alive: AtomicBool,
}

impl<'data> SharedFile<'data> {
    pub fn new(name: &'data str, soname: &'data str) -> Self {
        SharedFile {
            name,
            soname,
            priority: 0,
            elf_syms: Vec::new(),
            symbols: Vec::new(),
            ro_ranges: Vec::new(),
            alive: AtomicBool::new(false),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn mark_alive(&self) -> bool {
        !self.alive.swap(true, Ordering::SeqCst)
    }

    pub fn is_readonly(&self, addr: u64) -> bool {
        self.ro_ranges.iter().any(|range| range.contains(&addr))
    }

    /// Other globals of this file defined at the same address as `sym`. The dynamic linker must
    /// resolve all of them to the copied location, so they travel together through COPYREL.
    pub fn find_aliases(&self, db: &SymbolDb<'_>, of: SymbolId) -> SmallVec<[SymbolId; 2]> {
        let value = db.symbol(of).value;
        self.symbols
            .iter()
            .zip(&self.elf_syms)
            .filter(|(id, esym)| **id != of && esym.is_defined() && esym.value == value)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Display for SharedFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.name, f)
    }
}
