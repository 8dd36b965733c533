//! Creation of the fixed synthetic chunks and of the internal file that owns every
//! linker-synthesized symbol.

use crate::chunk::Chunk;
use crate::chunk::ChunkId;
use crate::chunk::ChunkKind;
use crate::chunk::ChunkPayload;
use crate::chunk::DynbssSection;
use crate::chunk::DynsymSection;
use crate::chunk::GotSection;
use crate::chunk::PltGotSection;
use crate::chunk::PltSection;
use crate::chunk::RelDynSection;
use crate::chunk::StringTable;
use crate::context::Context;
use crate::context::SyntheticSymbols;
use crate::elf;
use crate::elf::is_c_identifier;
use crate::elf::SectionHeader;
use crate::args::BuildIdKind;
use crate::input_file::FileId;
use crate::input_file::ObjectFile;
use crate::symbol::SymbolRank;
use crate::symbol::Visibility;
use crate::symbol_db::SymbolId;

fn shdr(sh_type: u32, sh_flags: u32, sh_addralign: u64, sh_entsize: u64) -> SectionHeader {
    SectionHeader {
        sh_type,
        sh_flags: u64::from(sh_flags),
        sh_addralign,
        sh_entsize,
        ..Default::default()
    }
}

/// Creates the fixed set of output chunks and records their handles in the context. The chunks
/// join `Context::chunks` immediately; ordering happens much later.
#[tracing::instrument(skip_all)]
pub fn create_synthetic_sections(ctx: &mut Context<'_>) {
    let rel_size = ctx.arch.rel_entry_size();
    let sym_size = ctx.arch.symtab_entry_size();
    let word = ctx.arch.ptr_size();
    let is_rel = ctx.arch.is_rel();
    let dynamic_entsize = crate::chunk::dynamic_entry_size(ctx.arch);

    fn add<'data>(ctx: &mut Context<'data>, chunk: Chunk<'data>) -> ChunkId {
        let id = ctx.add_chunk(chunk);
        ctx.chunks.push(id);
        id
    }

    let ehdr_size = if ctx.arch.is_64() { 64 } else { 52 };
    let mut ehdr_shdr = shdr(elf::SHT_NULL, elf::SHF_ALLOC, 8, 0);
    ehdr_shdr.sh_size = ehdr_size;
    ctx.ehdr = Some(add(ctx, Chunk::new(b"", ChunkKind::Header, ehdr_shdr, ChunkPayload::Plain)));
    ctx.phdr = Some(add(
        ctx,
        Chunk::new(b"", ChunkKind::Header, shdr(elf::SHT_NULL, elf::SHF_ALLOC, 8, 0), ChunkPayload::Plain),
    ));
    ctx.shdr = Some(add(
        ctx,
        Chunk::new(b"", ChunkKind::Header, shdr(elf::SHT_NULL, 0, 8, 0), ChunkPayload::Plain),
    ));

    ctx.got = Some(add(
        ctx,
        Chunk::new(
            b".got",
            ChunkKind::Synthetic,
            shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE, word, word),
            ChunkPayload::Got(GotSection::default()),
        ),
    ));
    ctx.gotplt = Some(add(
        ctx,
        Chunk::new(
            b".got.plt",
            ChunkKind::Synthetic,
            shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_WRITE, word, word),
            ChunkPayload::Plain,
        ),
    ));
    let (reldyn_name, relplt_name): (&[u8], &[u8]) = if is_rel {
        (b".rel.dyn", b".rel.plt")
    } else {
        (b".rela.dyn", b".rela.plt")
    };
    let rel_type = if is_rel { elf::SHT_REL } else { elf::SHT_RELA };
    ctx.reldyn = Some(add(
        ctx,
        Chunk::new(
            reldyn_name,
            ChunkKind::Synthetic,
            shdr(rel_type, elf::SHF_ALLOC, word, rel_size),
            ChunkPayload::RelDyn(RelDynSection::default()),
        ),
    ));
    ctx.relplt = Some(add(
        ctx,
        Chunk::new(
            relplt_name,
            ChunkKind::Synthetic,
            shdr(rel_type, elf::SHF_ALLOC, word, rel_size),
            ChunkPayload::Plain,
        ),
    ));
    ctx.strtab = Some(add(
        ctx,
        Chunk::new(
            b".strtab",
            ChunkKind::Synthetic,
            shdr(elf::SHT_STRTAB, 0, 1, 0),
            ChunkPayload::Plain,
        ),
    ));
    ctx.shstrtab = Some(add(
        ctx,
        Chunk::new(
            b".shstrtab",
            ChunkKind::Synthetic,
            shdr(elf::SHT_STRTAB, 0, 1, 0),
            ChunkPayload::Plain,
        ),
    ));
    ctx.plt = Some(add(
        ctx,
        Chunk::new(
            b".plt",
            ChunkKind::Synthetic,
            shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR, 16, 16),
            ChunkPayload::Plt(PltSection::default()),
        ),
    ));
    ctx.pltgot = Some(add(
        ctx,
        Chunk::new(
            b".plt.got",
            ChunkKind::Synthetic,
            shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC | elf::SHF_EXECINSTR, 8, 8),
            ChunkPayload::PltGot(PltGotSection::default()),
        ),
    ));
    ctx.symtab = Some(add(
        ctx,
        Chunk::new(
            b".symtab",
            ChunkKind::Synthetic,
            shdr(elf::SHT_SYMTAB, 0, word, sym_size),
            ChunkPayload::Plain,
        ),
    ));
    ctx.dynsym = Some(add(
        ctx,
        Chunk::new(
            b".dynsym",
            ChunkKind::Synthetic,
            shdr(elf::SHT_DYNSYM, elf::SHF_ALLOC, word, sym_size),
            ChunkPayload::Dynsym(DynsymSection::default()),
        ),
    ));
    ctx.dynstr = Some(add(
        ctx,
        Chunk::new(
            b".dynstr",
            ChunkKind::Synthetic,
            shdr(elf::SHT_STRTAB, elf::SHF_ALLOC, 1, 0),
            ChunkPayload::Dynstr(StringTable::default()),
        ),
    ));
    ctx.eh_frame = Some(add(
        ctx,
        Chunk::new(
            b".eh_frame",
            ChunkKind::Synthetic,
            shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC, word, 0),
            ChunkPayload::Plain,
        ),
    ));
    ctx.dynbss = Some(add(
        ctx,
        Chunk::new(
            b".dynbss",
            ChunkKind::Synthetic,
            shdr(elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE, 1, 0),
            ChunkPayload::Dynbss(DynbssSection::default()),
        ),
    ));
    ctx.dynbss_relro = Some(add(
        ctx,
        Chunk::new(
            b".dynbss.rel.ro",
            ChunkKind::Synthetic,
            shdr(elf::SHT_NOBITS, elf::SHF_ALLOC | elf::SHF_WRITE, 1, 0),
            ChunkPayload::Dynbss(DynbssSection::default()),
        ),
    ));

    if ctx.args.dynamic_linker.is_some() {
        ctx.interp = Some(add(
            ctx,
            Chunk::new(
                b".interp",
                ChunkKind::Synthetic,
                shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC, 1, 0),
                ChunkPayload::Plain,
            ),
        ));
    }
    if ctx.args.build_id != BuildIdKind::None {
        ctx.buildid = Some(add(
            ctx,
            Chunk::new(
                b".note.gnu.build-id",
                ChunkKind::Synthetic,
                shdr(elf::SHT_NOTE, elf::SHF_ALLOC, 4, 0),
                ChunkPayload::Plain,
            ),
        ));
    }
    if ctx.args.eh_frame_hdr {
        ctx.eh_frame_hdr = Some(add(
            ctx,
            Chunk::new(
                b".eh_frame_hdr",
                ChunkKind::Synthetic,
                shdr(elf::SHT_PROGBITS, elf::SHF_ALLOC, 4, 0),
                ChunkPayload::Plain,
            ),
        ));
    }
    if ctx.args.hash_style_sysv {
        ctx.hash = Some(add(
            ctx,
            Chunk::new(
                b".hash",
                ChunkKind::Synthetic,
                shdr(elf::SHT_HASH, elf::SHF_ALLOC, 4, 4),
                ChunkPayload::Plain,
            ),
        ));
    }
    if ctx.args.hash_style_gnu {
        ctx.gnu_hash = Some(add(
            ctx,
            Chunk::new(
                b".gnu.hash",
                ChunkKind::Synthetic,
                shdr(elf::SHT_GNU_HASH, elf::SHF_ALLOC, word, 0),
                ChunkPayload::Plain,
            ),
        ));
    }
    if !ctx.args.version_definitions.is_empty() {
        ctx.verdef = Some(add(
            ctx,
            Chunk::new(
                b".gnu.version_d",
                ChunkKind::Synthetic,
                shdr(elf::SHT_GNU_VERDEF, elf::SHF_ALLOC, word, 0),
                ChunkPayload::Plain,
            ),
        ));
    }

    ctx.dynamic = Some(add(
        ctx,
        Chunk::new(
            b".dynamic",
            ChunkKind::Synthetic,
            shdr(elf::SHT_DYNAMIC, elf::SHF_ALLOC | elf::SHF_WRITE, word, dynamic_entsize),
            ChunkPayload::Plain,
        ),
    ));
    ctx.versym = Some(add(
        ctx,
        Chunk::new(
            b".gnu.version",
            ChunkKind::Synthetic,
            shdr(elf::SHT_GNU_VERSYM, elf::SHF_ALLOC, 2, 2),
            ChunkPayload::Plain,
        ),
    ));
    ctx.verneed = Some(add(
        ctx,
        Chunk::new(
            b".gnu.version_r",
            ChunkKind::Synthetic,
            shdr(elf::SHT_GNU_VERNEED, elf::SHF_ALLOC, word, 0),
            ChunkPayload::Plain,
        ),
    ));
    ctx.note_property = Some(add(
        ctx,
        Chunk::new(
            b".note.gnu.property",
            ChunkKind::Synthetic,
            shdr(elf::SHT_NOTE, elf::SHF_ALLOC, word, 0),
            ChunkPayload::Plain,
        ),
    ));
    if ctx.args.repro {
        ctx.repro = Some(add(
            ctx,
            Chunk::new(
                b".repro",
                ChunkKind::Synthetic,
                shdr(elf::SHT_PROGBITS, 0, 1, 0),
                ChunkPayload::Plain,
            ),
        ));
    }
}

/// Interns `name` and makes the internal file its owner, unless `only_if_undefined` is set and
/// another file already supplies a definition.
fn define_internal<'data>(
    ctx: &mut Context<'data>,
    internal: FileId,
    name: &'data [u8],
    visibility: Visibility,
    only_if_undefined: bool,
) -> Option<SymbolId> {
    let id = ctx.symbol_db.get_or_create(name);
    let sym = ctx.symbol_db.symbol_mut(id);
    if only_if_undefined && sym.is_defined() {
        return None;
    }
    sym.file = Some(internal);
    sym.rank = SymbolRank::StrongDefined;
    sym.sym_type = elf::STT_NOTYPE;
    sym.visibility = visibility;
    sym.value = 0;
    sym.shndx = 0;
    sym.origin_section = None;

    let esym = crate::elf::InputSymbol {
        name,
        value: 0,
        size: 0,
        shndx: crate::elf::InputShndx::Absolute,
        sym_type: elf::STT_NOTYPE,
        bind: elf::STB_GLOBAL,
        visibility,
    };
    let obj = ctx.obj_mut(internal);
    let index = obj.elf_syms.len();
    obj.elf_syms.push(esym);
    obj.symbols.push(id);
    obj.symvers.push(None);
    ctx.symbol_db.symbol_mut(id).esym_index = index as u32;

    Some(id)
}

/// Creates the file that owns the linker-synthesized symbols: layout anchors like `__bss_start`,
/// `__start_<sec>` / `__stop_<sec>` pairs for custom sections, and `--defsym` targets. Values are
/// assigned once addresses are known.
#[tracing::instrument(skip_all)]
pub fn create_internal_file(ctx: &mut Context<'_>) {
    let mut obj = ObjectFile::new("<internal>", None);
    // The internal file trivially satisfies every GNU property check.
    obj.features = u32::MAX;
    let internal = FileId::object(ctx.objs.len());
    obj.priority = u32::try_from(ctx.objs.len() + ctx.dsos.len() + 1).expect("too many files");
    ctx.objs.push(obj);
    ctx.internal_file = Some(internal);

    let hidden = Visibility::Hidden;
    let mut syms = SyntheticSymbols::default();

    syms.ehdr_start = define_internal(ctx, internal, b"__ehdr_start", hidden, true);
    syms.executable_start = define_internal(ctx, internal, b"__executable_start", hidden, true);
    syms.init_array_start = define_internal(ctx, internal, b"__init_array_start", hidden, true);
    syms.init_array_end = define_internal(ctx, internal, b"__init_array_end", hidden, true);
    syms.fini_array_start = define_internal(ctx, internal, b"__fini_array_start", hidden, true);
    syms.fini_array_end = define_internal(ctx, internal, b"__fini_array_end", hidden, true);
    syms.preinit_array_start =
        define_internal(ctx, internal, b"__preinit_array_start", hidden, true);
    syms.preinit_array_end = define_internal(ctx, internal, b"__preinit_array_end", hidden, true);
    syms.dynamic = define_internal(ctx, internal, b"_DYNAMIC", hidden, true);
    syms.global_offset_table =
        define_internal(ctx, internal, b"_GLOBAL_OFFSET_TABLE_", hidden, true);
    syms.bss_start = define_internal(ctx, internal, b"__bss_start", hidden, true);
    syms.end = define_internal(ctx, internal, b"_end", hidden, true);
    syms.etext = define_internal(ctx, internal, b"_etext", hidden, true);
    syms.edata = define_internal(ctx, internal, b"_edata", hidden, true);

    let rel_iplt_start_name = ctx.arch.rel_iplt_start_name();
    let rel_iplt_end_name = ctx.arch.rel_iplt_end_name();
    syms.rel_iplt_start = define_internal(ctx, internal, rel_iplt_start_name, hidden, true);
    syms.rel_iplt_end = define_internal(ctx, internal, rel_iplt_end_name, hidden, true);

    if ctx.eh_frame_hdr.is_some() {
        syms.gnu_eh_frame_hdr =
            define_internal(ctx, internal, b"__GNU_EH_FRAME_HDR", hidden, true);
    }

    // The traditional unprefixed spellings are only supplied when no input claims them.
    syms.end_unprefixed = define_internal(ctx, internal, b"end", hidden, true);
    syms.etext_unprefixed = define_internal(ctx, internal, b"etext", hidden, true);
    syms.edata_unprefixed = define_internal(ctx, internal, b"edata", hidden, true);

    // __start_ / __stop_ pairs for every output chunk whose name works as a C identifier.
    let named_chunks: Vec<(ChunkId, &[u8])> = ctx
        .chunks
        .iter()
        .map(|id| (*id, ctx.chunk(*id).name))
        .filter(|(_, name)| is_c_identifier(name))
        .collect();
    for (chunk_id, name) in named_chunks {
        let start_name = ctx.save_name(b"__start_", name);
        let stop_name = ctx.save_name(b"__stop_", name);
        let start = define_internal(ctx, internal, start_name, Visibility::Default, true);
        let stop = define_internal(ctx, internal, stop_name, Visibility::Default, true);
        if let (Some(start), Some(stop)) = (start, stop) {
            syms.start_stop.push((chunk_id, start, stop));
        }
    }

    // --defsym targets always belong to the internal file; the values land after layout.
    let defsym_names: Vec<&[u8]> = ctx
        .args
        .defsyms
        .iter()
        .map(|(name, _)| ctx.save_bytes(name.as_bytes()))
        .collect();
    for name in defsym_names {
        define_internal(ctx, internal, name, Visibility::Default, false);
    }

    ctx.synthetic_syms = syms;
}
