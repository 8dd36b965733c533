//! The process-wide link state. One `Context` is threaded through every pass; each pass reads
//! and writes a documented slice of it and later passes never revisit earlier decisions.

use crate::arch::Architecture;
use crate::args::Args;
use crate::chunk::Chunk;
use crate::chunk::ChunkId;
use crate::chunk::ChunkPayload;
use crate::chunk::DynsymSection;
use crate::chunk::GotEntryKind;
use crate::chunk::GotSection;
use crate::chunk::PltGotSection;
use crate::chunk::PltSection;
use crate::chunk::RelDynSection;
use crate::chunk::StringTable;
use crate::error::Error;
use crate::error::Result;
use crate::input_file::FileId;
use crate::input_file::ObjectFile;
use crate::input_file::SectionRef;
use crate::input_file::SharedFile;
use crate::input_file::InputSection;
use crate::symbol::SymbolAux;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::bail;
use crossbeam_queue::SegQueue;
use itertools::Itertools;
use std::sync::atomic::AtomicU64;

/// Handles to the linker-synthesized symbols, populated by internal-file creation and given
/// their values once the chunk layout is final.
#[derive(Default)]
pub struct SyntheticSymbols {
    pub ehdr_start: Option<SymbolId>,
    pub executable_start: Option<SymbolId>,
    pub init_array_start: Option<SymbolId>,
    pub init_array_end: Option<SymbolId>,
    pub fini_array_start: Option<SymbolId>,
    pub fini_array_end: Option<SymbolId>,
    pub preinit_array_start: Option<SymbolId>,
    pub preinit_array_end: Option<SymbolId>,
    pub dynamic: Option<SymbolId>,
    pub global_offset_table: Option<SymbolId>,
    pub bss_start: Option<SymbolId>,
    pub end: Option<SymbolId>,
    pub etext: Option<SymbolId>,
    pub edata: Option<SymbolId>,
    pub end_unprefixed: Option<SymbolId>,
    pub etext_unprefixed: Option<SymbolId>,
    pub edata_unprefixed: Option<SymbolId>,
    pub rel_iplt_start: Option<SymbolId>,
    pub rel_iplt_end: Option<SymbolId>,
    pub gnu_eh_frame_hdr: Option<SymbolId>,
    /// `(chunk, __start_<name>, __stop_<name>)` for every output chunk whose name is a valid C
    /// identifier.
    pub start_stop: Vec<(ChunkId, SymbolId, SymbolId)>,
}

pub struct Context<'data> {
    pub args: Args,
    pub arch: Architecture,
    pub image_base: u64,
    pub page_size: u64,

    pub objs: Vec<ObjectFile<'data>>,
    pub dsos: Vec<SharedFile<'data>>,
    pub symbol_db: SymbolDb<'data>,

    /// Chunk arena. Never shrinks; `chunks` carries the emission order.
    pub chunk_pool: Vec<Chunk<'data>>,
    pub chunks: Vec<ChunkId>,
    pub output_sections: Vec<ChunkId>,
    pub merged_sections: Vec<ChunkId>,

    // Fixed synthetic chunks, created by synthetic-section initialization. The optional ones
    // stay `None` when the configuration doesn't call for them.
    pub ehdr: Option<ChunkId>,
    pub phdr: Option<ChunkId>,
    pub shdr: Option<ChunkId>,
    pub got: Option<ChunkId>,
    pub gotplt: Option<ChunkId>,
    pub plt: Option<ChunkId>,
    pub pltgot: Option<ChunkId>,
    pub reldyn: Option<ChunkId>,
    pub relplt: Option<ChunkId>,
    pub dynsym: Option<ChunkId>,
    pub dynstr: Option<ChunkId>,
    pub dynamic: Option<ChunkId>,
    pub strtab: Option<ChunkId>,
    pub shstrtab: Option<ChunkId>,
    pub symtab: Option<ChunkId>,
    pub eh_frame: Option<ChunkId>,
    pub eh_frame_hdr: Option<ChunkId>,
    pub interp: Option<ChunkId>,
    pub buildid: Option<ChunkId>,
    pub hash: Option<ChunkId>,
    pub gnu_hash: Option<ChunkId>,
    pub verdef: Option<ChunkId>,
    pub versym: Option<ChunkId>,
    pub verneed: Option<ChunkId>,
    pub dynbss: Option<ChunkId>,
    pub dynbss_relro: Option<ChunkId>,
    pub note_property: Option<ChunkId>,
    pub repro: Option<ChunkId>,

    pub synthetic_syms: SyntheticSymbols,
    pub internal_file: Option<FileId>,

    /// One row per dynamic symbol; indexed by `Symbol::aux_idx`.
    pub symbol_aux: Vec<SymbolAux>,

    /// Counts of data dynamic relocations discovered while scanning, folded into `.rel[a].dyn`
    /// during slot allocation.
    pub num_dynrel_relative: AtomicU64,
    pub num_dynrel_general: AtomicU64,

    /// Set when slim LTO bitcode was detected among the inputs.
    pub gcc_lto: bool,

    /// Arena for names the linker constructs itself (`__start_*`, `.comment` strings).
    names: &'data bumpalo_herd::Herd,

    errors: SegQueue<Error>,
}

impl<'data> Context<'data> {
    pub fn new(args: Args, arch: Architecture, names: &'data bumpalo_herd::Herd) -> Self {
        let image_base = args.image_base;
        let page_size = if args.page_size == 0 {
            arch.default_page_size()
        } else {
            args.page_size
        };
        Context {
            args,
            arch,
            image_base,
            page_size,
            objs: Vec::new(),
            dsos: Vec::new(),
            symbol_db: SymbolDb::default(),
            chunk_pool: Vec::new(),
            chunks: Vec::new(),
            output_sections: Vec::new(),
            merged_sections: Vec::new(),
            ehdr: None,
            phdr: None,
            shdr: None,
            got: None,
            gotplt: None,
            plt: None,
            pltgot: None,
            reldyn: None,
            relplt: None,
            dynsym: None,
            dynstr: None,
            dynamic: None,
            strtab: None,
            shstrtab: None,
            symtab: None,
            eh_frame: None,
            eh_frame_hdr: None,
            interp: None,
            buildid: None,
            hash: None,
            gnu_hash: None,
            verdef: None,
            versym: None,
            verneed: None,
            dynbss: None,
            dynbss_relro: None,
            note_property: None,
            repro: None,
            synthetic_syms: SyntheticSymbols::default(),
            internal_file: None,
            symbol_aux: Vec::new(),
            num_dynrel_relative: AtomicU64::new(0),
            num_dynrel_general: AtomicU64::new(0),
            gcc_lto: false,
            names,
            errors: SegQueue::new(),
        }
    }

    /// Attaches an object file, interning its global symbol names. Files must be added in
    /// command-line order; the assigned priority breaks symbol-resolution ties.
    pub fn add_object(&mut self, mut file: ObjectFile<'data>) -> FileId {
        let id = FileId::object(self.objs.len());
        file.priority = self.next_priority();
        file.symbols = file.elf_syms[file.first_global..]
            .iter()
            .map(|esym| self.symbol_db.get_or_create(esym.name))
            .collect();
        if file.symvers.is_empty() {
            file.symvers = vec![None; file.symbols.len()];
        }
        self.objs.push(file);
        id
    }

    pub fn add_shared(&mut self, mut file: SharedFile<'data>) -> FileId {
        let id = FileId::shared(self.dsos.len());
        file.priority = self.next_priority();
        file.symbols = file
            .elf_syms
            .iter()
            .map(|esym| self.symbol_db.get_or_create(esym.name))
            .collect();
        self.dsos.push(file);
        id
    }

    fn next_priority(&self) -> u32 {
        u32::try_from(self.objs.len() + self.dsos.len() + 1).expect("too many input files")
    }

    pub fn obj(&self, id: FileId) -> &ObjectFile<'data> {
        debug_assert!(!id.is_dso());
        &self.objs[id.index()]
    }

    pub fn obj_mut(&mut self, id: FileId) -> &mut ObjectFile<'data> {
        debug_assert!(!id.is_dso());
        &mut self.objs[id.index()]
    }

    pub fn dso(&self, id: FileId) -> &SharedFile<'data> {
        debug_assert!(id.is_dso());
        &self.dsos[id.index()]
    }

    /// Live objects in command-line order. Dead files stay in `objs` so that `FileId`s remain
    /// stable, but no pass past symbol resolution may observe them.
    pub fn live_objects(&self) -> impl Iterator<Item = (FileId, &ObjectFile<'data>)> {
        self.objs
            .iter()
            .enumerate()
            .filter(|(_, obj)| obj.is_alive())
            .map(|(index, obj)| (FileId::object(index), obj))
    }

    pub fn live_dsos(&self) -> impl Iterator<Item = (FileId, &SharedFile<'data>)> {
        self.dsos
            .iter()
            .enumerate()
            .filter(|(_, dso)| dso.is_alive())
            .map(|(index, dso)| (FileId::shared(index), dso))
    }

    pub fn section(&self, sec_ref: SectionRef) -> &InputSection<'data> {
        self.obj(sec_ref.file).section(sec_ref.section)
    }

    pub fn add_chunk(&mut self, chunk: Chunk<'data>) -> ChunkId {
        let id = ChunkId::from_usize(self.chunk_pool.len());
        self.chunk_pool.push(chunk);
        id
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk<'data> {
        &self.chunk_pool[id.as_usize()]
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk<'data> {
        &mut self.chunk_pool[id.as_usize()]
    }

    pub fn got_section(&self) -> &GotSection {
        let id = self.got.expect("synthetic sections not initialized");
        match &self.chunk(id).payload {
            ChunkPayload::Got(got) => got,
            _ => unreachable!(),
        }
    }

    pub fn got_section_mut(&mut self) -> &mut GotSection {
        let id = self.got.expect("synthetic sections not initialized");
        match &mut self.chunk_mut(id).payload {
            ChunkPayload::Got(got) => got,
            _ => unreachable!(),
        }
    }

    pub fn plt_section_mut(&mut self) -> &mut PltSection {
        let id = self.plt.expect("synthetic sections not initialized");
        match &mut self.chunk_mut(id).payload {
            ChunkPayload::Plt(plt) => plt,
            _ => unreachable!(),
        }
    }

    pub fn pltgot_section_mut(&mut self) -> &mut PltGotSection {
        let id = self.pltgot.expect("synthetic sections not initialized");
        match &mut self.chunk_mut(id).payload {
            ChunkPayload::PltGot(pltgot) => pltgot,
            _ => unreachable!(),
        }
    }

    pub fn dynsym_section(&self) -> &DynsymSection {
        let id = self.dynsym.expect("synthetic sections not initialized");
        match &self.chunk(id).payload {
            ChunkPayload::Dynsym(dynsym) => dynsym,
            _ => unreachable!(),
        }
    }

    pub fn dynsym_section_mut(&mut self) -> &mut DynsymSection {
        let id = self.dynsym.expect("synthetic sections not initialized");
        match &mut self.chunk_mut(id).payload {
            ChunkPayload::Dynsym(dynsym) => dynsym,
            _ => unreachable!(),
        }
    }

    pub fn dynstr_table_mut(&mut self) -> &mut StringTable {
        let id = self.dynstr.expect("synthetic sections not initialized");
        match &mut self.chunk_mut(id).payload {
            ChunkPayload::Dynstr(table) => table,
            _ => unreachable!(),
        }
    }

    pub fn reldyn_section(&self) -> &RelDynSection {
        let id = self.reldyn.expect("synthetic sections not initialized");
        match &self.chunk(id).payload {
            ChunkPayload::RelDyn(reldyn) => reldyn,
            _ => unreachable!(),
        }
    }

    pub fn reldyn_section_mut(&mut self) -> &mut RelDynSection {
        let id = self.reldyn.expect("synthetic sections not initialized");
        match &mut self.chunk_mut(id).payload {
            ChunkPayload::RelDyn(reldyn) => reldyn,
            _ => unreachable!(),
        }
    }

    /// Reserves space in the chosen copy-relocation section and returns the symbol's offset
    /// within it. COPYREL blocks use a 64-byte alignment cap, matching common practice.
    pub fn add_dynbss_symbol(&mut self, sym: SymbolId, readonly: bool, size: u64, align: u64) -> u64 {
        let id = if readonly { self.dynbss_relro } else { self.dynbss };
        let id = id.expect("synthetic sections not initialized");
        let chunk = self.chunk_mut(id);
        let align = align.clamp(1, 64).next_power_of_two();
        let offset = chunk.shdr.sh_size.next_multiple_of(align);
        chunk.shdr.sh_size = offset + size;
        chunk.shdr.sh_addralign = chunk.shdr.sh_addralign.max(align);
        match &mut chunk.payload {
            ChunkPayload::Dynbss(sec) => sec.symbols.push(sym),
            _ => unreachable!(),
        }
        offset
    }

    /// Allocates an auxiliary-table row for `sym` if it doesn't have one yet.
    pub fn add_aux(&mut self, sym: SymbolId) -> u32 {
        if let Some(aux_idx) = self.symbol_db.symbol(sym).aux_idx {
            return aux_idx;
        }
        let aux_idx = u32::try_from(self.symbol_aux.len()).expect("aux table overflow");
        self.symbol_aux.push(SymbolAux::default());
        self.symbol_db.symbol_mut(sym).aux_idx = Some(aux_idx);
        aux_idx
    }

    pub fn aux(&self, sym: SymbolId) -> Option<&SymbolAux> {
        self.symbol_db
            .symbol(sym)
            .aux_idx
            .map(|aux_idx| &self.symbol_aux[aux_idx as usize])
    }

    /// Adds `sym` to the dynamic symbol table, reserving its name in `.dynstr`. Idempotent.
    pub fn add_dynsym(&mut self, sym: SymbolId) {
        let aux_idx = self.add_aux(sym);
        if self.symbol_aux[aux_idx as usize].dynsym_idx.is_some() {
            return;
        }
        let name = self.symbol_db.symbol(sym).name;
        self.dynstr_table_mut().add(name);
        let dynsym = self.dynsym_section_mut();
        dynsym.symbols.push(sym);
        let index = u32::try_from(dynsym.symbols.len()).expect("dynsym overflow");
        self.symbol_aux[aux_idx as usize].dynsym_idx = Some(index);
    }

    /// Adds a GOT entry for `sym` and records it in the symbol's aux row.
    pub fn add_got_entry(&mut self, sym: SymbolId, kind: GotEntryKind) {
        let aux_idx = self.add_aux(sym) as usize;
        let aux = &self.symbol_aux[aux_idx];
        let taken = match kind {
            GotEntryKind::Address => aux.got_idx,
            GotEntryKind::TpOff => aux.gottp_idx,
            GotEntryKind::TlsGd => aux.tlsgd_idx,
            GotEntryKind::TlsDesc => aux.tlsdesc_idx,
        };
        if taken.is_some() {
            return;
        }
        let slot = self.got_section_mut().add_entry(sym, kind);
        let slot = u32::try_from(slot).expect("GOT overflow");
        let aux = &mut self.symbol_aux[aux_idx];
        match kind {
            GotEntryKind::Address => aux.got_idx = Some(slot),
            GotEntryKind::TpOff => aux.gottp_idx = Some(slot),
            GotEntryKind::TlsGd => aux.tlsgd_idx = Some(slot),
            GotEntryKind::TlsDesc => aux.tlsdesc_idx = Some(slot),
        }
    }

    pub fn save_bytes(&self, bytes: &[u8]) -> &'data [u8] {
        self.names.get().alloc_slice_copy(bytes)
    }

    pub fn save_name(&self, prefix: &[u8], rest: &[u8]) -> &'data [u8] {
        let mut combined = Vec::with_capacity(prefix.len() + rest.len());
        combined.extend_from_slice(prefix);
        combined.extend_from_slice(rest);
        self.save_bytes(&combined)
    }

    /// Records an error for the next checkpoint. Related diagnostics batch up rather than the
    /// first one aborting the link.
    pub fn record_error(&self, error: Error) {
        self.errors.push(error);
    }

    /// Fails if any errors accumulated since the previous checkpoint.
    pub fn checkpoint(&mut self) -> Result {
        if self.errors.is_empty() {
            return Ok(());
        }
        let mut messages = Vec::new();
        while let Some(error) = self.errors.pop() {
            messages.push(format!("{error:#}"));
        }
        messages.sort();
        bail!(
            "link failed with {} error(s):\n{}",
            messages.len(),
            messages.iter().join("\n")
        );
    }
}
