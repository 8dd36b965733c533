//! Output chunks. Every unit the writer emits — header pseudo-chunks, regular output sections,
//! merged sections and the synthetic dynamic-linking tables — is one `Chunk` in the context's
//! arena, addressed by `ChunkId`. `Context::chunks` holds the final emission order.

use crate::arch::Architecture;
use crate::args::CompressKind;
use crate::elf::SectionHeader;
use crate::input_file::SectionRef;
use crate::merged_section::MergedSection;
use crate::symbol_db::SymbolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u32);

impl ChunkId {
    pub fn from_usize(raw: usize) -> Self {
        ChunkId(u32::try_from(raw).expect("chunk IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// ELF header, program headers, section headers.
    Header,
    /// An output section built from input sections or merged fragments.
    Regular,
    /// A linker-generated table.
    Synthetic,
}

pub struct Chunk<'data> {
    pub name: &'data [u8],
    pub kind: ChunkKind,
    pub shdr: SectionHeader,
    /// Output section index, assigned once the chunk order is final. Zero for header chunks.
    pub shndx: u32,
    pub payload: ChunkPayload<'data>,
}

impl<'data> Chunk<'data> {
    pub fn new(
        name: &'data [u8],
        kind: ChunkKind,
        shdr: SectionHeader,
        payload: ChunkPayload<'data>,
    ) -> Self {
        Chunk {
            name,
            kind,
            shdr,
            shndx: 0,
            payload,
        }
    }

    pub fn output_section(&self) -> Option<&OutputSection> {
        match &self.payload {
            ChunkPayload::Output(osec) => Some(osec),
            _ => None,
        }
    }

    pub fn merged_section(&self) -> Option<&MergedSection<'data>> {
        match &self.payload {
            ChunkPayload::Merged(sec) => Some(sec),
            _ => None,
        }
    }

    pub fn merged_section_mut(&mut self) -> Option<&mut MergedSection<'data>> {
        match &mut self.payload {
            ChunkPayload::Merged(sec) => Some(sec),
            _ => None,
        }
    }
}

pub enum ChunkPayload<'data> {
    /// No structured contents tracked by the layout core (headers, string tables, notes, ...).
    Plain,
    Output(OutputSection),
    Merged(MergedSection<'data>),
    Got(GotSection),
    Plt(PltSection),
    PltGot(PltGotSection),
    RelDyn(RelDynSection),
    Dynsym(DynsymSection),
    Dynstr(StringTable),
    Dynbss(DynbssSection),
    Compressed(CompressedSection),
}

/// A regular output section: an ordered collection of input sections. `members` is reserved to
/// its final size and then filled shard by shard, so the order never depends on scheduling.
#[derive(Default)]
pub struct OutputSection {
    /// Position of this chunk in `Context::output_sections`; used to index shard-local buckets
    /// during binning.
    pub index: u32,
    pub members: Vec<SectionRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotEntryKind {
    /// An address slot: GLOB_DAT for imports, RELATIVE under PIC, IRELATIVE for ifuncs.
    Address,
    /// Offset from the thread pointer.
    TpOff,
    /// General-dynamic module/offset pair (two slots).
    TlsGd,
    /// TLS descriptor (two slots).
    TlsDesc,
}

impl GotEntryKind {
    pub fn num_slots(self) -> u64 {
        match self {
            GotEntryKind::Address | GotEntryKind::TpOff => 1,
            GotEntryKind::TlsGd | GotEntryKind::TlsDesc => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GotEntry {
    pub sym: SymbolId,
    pub kind: GotEntryKind,
}

#[derive(Default)]
pub struct GotSection {
    pub entries: Vec<GotEntry>,
    /// Slot index of the shared local-dynamic TLS module entry, allocated at most once.
    pub tlsld_slot: Option<u64>,
    next_slot: u64,
}

impl GotSection {
    pub fn add_entry(&mut self, sym: SymbolId, kind: GotEntryKind) -> u64 {
        let slot = self.next_slot;
        self.entries.push(GotEntry { sym, kind });
        self.next_slot += kind.num_slots();
        slot
    }

    pub fn add_tlsld(&mut self) -> u64 {
        if let Some(slot) = self.tlsld_slot {
            return slot;
        }
        let slot = self.next_slot;
        self.next_slot += 2;
        self.tlsld_slot = Some(slot);
        slot
    }

    pub fn num_slots(&self) -> u64 {
        self.next_slot
    }
}

#[derive(Default)]
pub struct PltSection {
    pub symbols: Vec<SymbolId>,
}

#[derive(Default)]
pub struct PltGotSection {
    pub symbols: Vec<SymbolId>,
}

/// Relocation counts for `.rel[a].dyn`. The writer materializes the records; the layout core
/// only needs their number for sizing and for `__rel_iplt_end`.
#[derive(Default)]
pub struct RelDynSection {
    pub num_relative: u64,
    pub num_general: u64,
}

#[derive(Default)]
pub struct DynsymSection {
    /// Entry zero (the null symbol) is implicit.
    pub symbols: Vec<SymbolId>,
}

/// A string table that grows as names are added. Offset zero is the empty string.
pub struct StringTable {
    size: u64,
}

impl Default for StringTable {
    fn default() -> Self {
        StringTable { size: 1 }
    }
}

impl StringTable {
    /// Reserves room for `name` plus its NUL terminator and returns its offset.
    pub fn add(&mut self, name: &[u8]) -> u64 {
        let offset = self.size;
        self.size += name.len() as u64 + 1;
        offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// `.bss`-like landing zone for copy relocations. Each symbol reserves a block at its natural
/// 64-byte-capped alignment; the symbol's `value` becomes its offset in the section.
#[derive(Default)]
pub struct DynbssSection {
    pub symbols: Vec<SymbolId>,
}

/// Replacement contents for a debug chunk after compression.
pub struct CompressedSection {
    pub format: CompressKind,
    pub uncompressed_size: u64,
    pub data: Vec<u8>,
}

/// Fixed entry sizes of dynamic-table records.
pub fn dynamic_entry_size(arch: Architecture) -> u64 {
    if arch.is_64() { 16 } else { 8 }
}
