//! Layout passes: binning input sections into output sections, ordering chunks, assigning
//! offsets within sections, then virtual addresses and file offsets across the whole output,
//! and finally fixing the values of the linker-synthesized symbols.

use crate::alignment::align_to;
use crate::alignment::align_with_skew;
use crate::args::CompressKind;
use crate::arch::GotAnchor;
use crate::chunk::Chunk;
use crate::chunk::ChunkId;
use crate::chunk::ChunkKind;
use crate::chunk::ChunkPayload;
use crate::chunk::CompressedSection;
use crate::chunk::GotEntryKind;
use crate::chunk::OutputSection;
use crate::context::Context;
use crate::elf;
use crate::elf::DisplayName;
use crate::elf::SectionHeader;
use crate::input_file::FileId;
use crate::input_file::ObjectFile;
use crate::input_file::SectionRef;
use crate::symbol_db::SymbolId;
use anyhow::anyhow;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice;
use std::io::Write as _;

/// Finds or creates the regular output section with the given identity. The flags that matter
/// for placement participate in the match; incidental input flags don't create new sections.
pub fn output_section_instance<'data>(
    ctx: &mut Context<'data>,
    name: &'data [u8],
    sh_type: u32,
    sh_flags: u64,
) -> ChunkId {
    const MATCH_MASK: u64 = (elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_EXECINSTR | elf::SHF_TLS) as u64;

    let existing = ctx.output_sections.iter().copied().find(|id| {
        let chunk = ctx.chunk(*id);
        chunk.name == name
            && chunk.shdr.sh_type == sh_type
            && chunk.shdr.sh_flags & MATCH_MASK == sh_flags & MATCH_MASK
    });
    existing.unwrap_or_else(|| {
        let index = u32::try_from(ctx.output_sections.len()).expect("output section overflow");
        let shdr = SectionHeader {
            sh_type,
            sh_flags: sh_flags & MATCH_MASK,
            sh_addralign: 1,
            ..Default::default()
        };
        let id = ctx.add_chunk(Chunk::new(
            name,
            ChunkKind::Regular,
            shdr,
            ChunkPayload::Output(OutputSection {
                index,
                members: Vec::new(),
            }),
        ));
        ctx.output_sections.push(id);
        id
    })
}

const NUM_BIN_SHARDS: usize = 128;

/// Builds each output section's member list from the forward edges on the input sections.
///
/// Objects are partitioned into a fixed number of shards; each shard builds local per-section
/// lists, a serial reduction computes final capacities and the lists are appended in shard
/// order. The resulting order depends only on the inputs, never on scheduling.
#[tracing::instrument(skip_all)]
pub fn bin_sections(ctx: &mut Context<'_>) {
    let live: Vec<FileId> = ctx.live_objects().map(|(fid, _)| fid).collect();
    if live.is_empty() {
        return;
    }

    let num_osec = ctx.output_sections.len();
    let mut osec_index_by_chunk = vec![None; ctx.chunk_pool.len()];
    for (index, id) in ctx.output_sections.iter().enumerate() {
        osec_index_by_chunk[id.as_usize()] = Some(index);
    }

    let unit = live.len().div_ceil(NUM_BIN_SHARDS);
    let shards: Vec<&[FileId]> = live.chunks(unit).collect();

    let groups: Vec<Vec<Vec<SectionRef>>> = {
        let ctx = &*ctx;
        let osec_index_by_chunk = &osec_index_by_chunk;
        shards
            .par_iter()
            .map(|shard| {
                let mut local = vec![Vec::new(); num_osec];
                for fid in *shard {
                    let obj = ctx.obj(*fid);
                    for (section_index, section) in obj.sections.iter().enumerate() {
                        if !section.is_alive() {
                            continue;
                        }
                        let Some(osec) = section.output_section else {
                            continue;
                        };
                        let Some(index) = osec_index_by_chunk[osec.as_usize()] else {
                            continue;
                        };
                        local[index].push(SectionRef {
                            file: *fid,
                            section: section_index as u32,
                        });
                    }
                }
                local
            })
            .collect()
    };

    let mut sizes = vec![0usize; num_osec];
    for group in &groups {
        for (index, list) in group.iter().enumerate() {
            sizes[index] += list.len();
        }
    }

    let groups = &groups;
    let sizes = &sizes;
    ctx.chunk_pool.par_iter_mut().for_each(|chunk| {
        let ChunkPayload::Output(osec) = &mut chunk.payload else {
            return;
        };
        let index = osec.index as usize;
        osec.members.clear();
        osec.members.reserve_exact(sizes[index]);
        for group in groups {
            osec.members.extend_from_slice(&group[index]);
        }
    });
}

/// Construction priority of an `.init_array.N` / `.fini_array.N` member. Sections without a
/// numeric suffix run last.
fn init_fini_priority(name: &[u8]) -> u32 {
    for prefix in [b".init_array.".as_slice(), b".fini_array.".as_slice()] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if !rest.is_empty() && rest.iter().all(|b| b.is_ascii_digit()) {
                if let Ok(priority) = std::str::from_utf8(rest).unwrap_or("").parse::<u32>() {
                    return priority.min(65535);
                }
            }
        }
    }
    65536
}

/// Orders `.init_array` / `.fini_array` members by their priority suffix. The sort is stable,
/// so members of equal priority keep input order.
#[tracing::instrument(skip_all)]
pub fn sort_init_fini(ctx: &mut Context<'_>) {
    let Context {
        chunk_pool,
        output_sections,
        objs,
        ..
    } = ctx;
    for id in output_sections.iter() {
        let chunk = &mut chunk_pool[id.as_usize()];
        if chunk.name != b".init_array" && chunk.name != b".fini_array" {
            continue;
        }
        let ChunkPayload::Output(osec) = &mut chunk.payload else {
            continue;
        };
        osec.members.sort_by_key(|member| {
            init_fini_priority(objs[member.file.index()].section(member.section).name)
        });
    }
}

/// Appends the non-empty regular and merged sections to the chunk list. Sections were created
/// in arbitrary order, so they are sorted by `(name, type, flags)` first.
#[tracing::instrument(skip_all)]
pub fn collect_output_sections(ctx: &mut Context<'_>) {
    let mut collected: Vec<ChunkId> = Vec::new();
    for id in &ctx.output_sections {
        if ctx
            .chunk(*id)
            .output_section()
            .is_some_and(|osec| !osec.members.is_empty())
        {
            collected.push(*id);
        }
    }
    for id in &ctx.merged_sections {
        if ctx.chunk(*id).shdr.sh_size > 0 {
            collected.push(*id);
        }
    }
    collected.sort_by(|a, b| {
        let ka = ctx.chunk(*a);
        let kb = ctx.chunk(*b);
        (ka.name, ka.shdr.sh_type, ka.shdr.sh_flags).cmp(&(
            kb.name,
            kb.shdr.sh_type,
            kb.shdr.sh_flags,
        ))
    });
    ctx.chunks.extend(collected);
}

const SCAN_BLOCK: usize = 10_000;

/// Lays out `members` back to back, respecting each member's alignment, and returns the total
/// size and alignment. This is a block-decomposed prefix scan: the combine step
/// `(align_to(off_l, align_r) + off_r, max(align_l, align_r))` is associative, so the result is
/// independent of the block size and the thread count.
fn assign_member_offsets(
    objs: &[ObjectFile<'_>],
    members: &[SectionRef],
    block_size: usize,
) -> (u64, u64) {
    if members.is_empty() {
        return (0, 1);
    }

    let summaries: Vec<(u64, u64)> = members
        .par_chunks(block_size)
        .map(|block| {
            let mut offset = 0u64;
            let mut align = 1u64;
            for member in block {
                let shdr = &objs[member.file.index()].section(member.section).shdr;
                let member_align = shdr.sh_addralign.max(1);
                offset = align_to(offset, member_align);
                offset += shdr.sh_size;
                align = align.max(member_align);
            }
            (offset, align)
        })
        .collect();

    let mut starts = Vec::with_capacity(summaries.len());
    let mut offset = 0u64;
    let mut align = 1u64;
    for (block_offset, block_align) in &summaries {
        let start = align_to(offset, *block_align);
        starts.push(start);
        offset = start + block_offset;
        align = align.max(*block_align);
    }

    members
        .par_chunks(block_size)
        .zip(starts.par_iter())
        .for_each(|(block, start)| {
            let mut cursor = *start;
            for member in block {
                let section = objs[member.file.index()].section(member.section);
                let member_align = section.shdr.sh_addralign.max(1);
                cursor = align_to(cursor, member_align);
                section.set_offset(cursor);
                cursor += section.shdr.sh_size;
            }
        });

    (offset, align)
}

/// Gives every input section its offset within its output section and totals each output
/// section's size and alignment.
#[tracing::instrument(skip_all)]
pub fn compute_section_sizes(ctx: &mut Context<'_>) {
    compute_section_sizes_with_block(ctx, SCAN_BLOCK);
}

pub fn compute_section_sizes_with_block(ctx: &mut Context<'_>, block_size: usize) {
    let Context {
        chunk_pool, objs, ..
    } = ctx;
    let objs = &*objs;
    chunk_pool.par_iter_mut().for_each(|chunk| {
        let Some(osec) = chunk.output_section() else {
            return;
        };
        if osec.members.is_empty() {
            return;
        }
        let (size, align) = assign_member_offsets(objs, &osec.members, block_size);
        chunk.shdr.sh_size = size;
        chunk.shdr.sh_addralign = align;
    });
}

/// Whether the chunk lives in the RELRO region: mapped writable for the dynamic linker, then
/// remapped read-only before user code runs.
fn is_relro(ctx: &Context<'_>, id: ChunkId) -> bool {
    if !ctx.args.z_relro {
        return false;
    }
    if Some(id) == ctx.got || Some(id) == ctx.dynamic || Some(id) == ctx.dynbss_relro {
        return true;
    }
    let chunk = ctx.chunk(id);
    matches!(
        chunk.shdr.sh_type,
        elf::SHT_INIT_ARRAY | elf::SHT_FINI_ARRAY | elf::SHT_PREINIT_ARRAY
    ) || chunk.name == b".ctors"
        || chunk.name == b".dtors"
        || chunk.name == b".data.rel.ro"
        || chunk.name.starts_with(b".data.rel.ro.")
}

/// Ranks a chunk for output ordering: headers first, then `.interp`, allocated notes by
/// alignment, allocated chunks grouped by `(writable, executable, tls, relro, bss)`, non-alloc
/// chunks, and the section header table last.
pub fn get_section_rank(ctx: &Context<'_>, id: ChunkId) -> u64 {
    if Some(id) == ctx.ehdr {
        return 0;
    }
    if Some(id) == ctx.phdr {
        return 1;
    }
    if Some(id) == ctx.interp {
        return 2;
    }

    let chunk = ctx.chunk(id);
    if chunk.shdr.sh_type == elf::SHT_NOTE && chunk.shdr.is_alloc() {
        return (1 << 10) + chunk.shdr.sh_addralign;
    }
    if Some(id) == ctx.shdr {
        return 1 << 30;
    }
    if !chunk.shdr.is_alloc() {
        return (1 << 30) - 1;
    }

    let writable = u64::from(chunk.shdr.is_writable());
    let exec = u64::from(chunk.shdr.is_executable());
    let tls = u64::from(chunk.shdr.is_tls());
    let relro = u64::from(is_relro(ctx, id));
    let is_bss = u64::from(chunk.shdr.is_nobits());

    (1 << 20)
        | (writable << 19)
        | (exec << 18)
        | ((1 - tls) << 17)
        | ((1 - relro) << 16)
        | (is_bss << 15)
}

/// Sorts the chunk list into the canonical segment order and assigns section indexes.
#[tracing::instrument(skip_all)]
pub fn order_chunks(ctx: &mut Context<'_>) {
    let mut chunks = std::mem::take(&mut ctx.chunks);
    // Stable sort: chunks of equal rank keep insertion order.
    chunks.sort_by_key(|id| get_section_rank(ctx, *id));
    ctx.chunks = chunks;

    let mut shndx = 1u32;
    for id in ctx.chunks.clone() {
        let chunk = ctx.chunk_mut(id);
        if chunk.kind == ChunkKind::Header {
            continue;
        }
        chunk.shndx = shndx;
        shndx += 1;
    }
}

fn set_chunk_size(ctx: &mut Context<'_>, id: Option<ChunkId>, size: u64) {
    if let Some(id) = id {
        ctx.chunk_mut(id).shdr.sh_size = size;
    }
}

fn set_chunk_link(ctx: &mut Context<'_>, id: Option<ChunkId>, link: Option<ChunkId>) {
    if let (Some(id), Some(link)) = (id, link) {
        let shndx = ctx.chunk(link).shndx;
        ctx.chunk_mut(id).shdr.sh_link = shndx;
    }
}

fn count_program_headers(ctx: &Context<'_>) -> u64 {
    let mut count = 1; // PT_PHDR
    if ctx.interp.is_some() {
        count += 1;
    }

    // One PT_LOAD per maximal run of allocated chunks with equal access flags.
    let mut prev_access: Option<(bool, bool)> = None;
    let mut has_tls = false;
    let mut has_relro = false;
    let mut prev_was_note = false;
    for id in &ctx.chunks {
        let chunk = ctx.chunk(*id);
        if !chunk.shdr.is_alloc() {
            prev_was_note = false;
            continue;
        }
        let access = (chunk.shdr.is_writable(), chunk.shdr.is_executable());
        if prev_access != Some(access) {
            count += 1;
            prev_access = Some(access);
        }
        has_tls |= chunk.shdr.is_tls();
        has_relro |= is_relro(ctx, *id);
        let is_note = chunk.shdr.sh_type == elf::SHT_NOTE;
        if is_note && !prev_was_note {
            count += 1; // PT_NOTE
        }
        prev_was_note = is_note;
    }

    if has_tls {
        count += 1;
    }
    if has_relro {
        count += 1;
    }
    if ctx.dynamic.is_some() && ctx.args.output_is_dynamic() {
        count += 1;
    }
    if ctx.eh_frame_hdr.is_some() {
        count += 1;
    }
    count += 1; // PT_GNU_STACK
    count
}

fn update_shstrtab_size(ctx: &mut Context<'_>) {
    let shstrtab = ctx.shstrtab;
    let mut size = 1u64;
    for id in &ctx.chunks {
        let name = ctx.chunk(*id).name;
        if !name.is_empty() {
            size += name.len() as u64 + 1;
        }
    }
    set_chunk_size(ctx, shstrtab, size);
}

/// Computes the header sizes of every synthetic chunk from its accumulated contents. Runs after
/// chunk ordering (the program-header estimate needs the final order) and before address
/// assignment.
#[tracing::instrument(skip_all)]
pub fn update_synthetic_sizes(ctx: &mut Context<'_>) {
    let word = ctx.arch.ptr_size();
    let rel_size = ctx.arch.rel_entry_size();
    let sym_size = ctx.arch.symtab_entry_size();
    let (got, gotplt, plt, pltgot, relplt, reldyn) =
        (ctx.got, ctx.gotplt, ctx.plt, ctx.pltgot, ctx.relplt, ctx.reldyn);
    let (dynsym, dynstr, versym, verdef, verneed) =
        (ctx.dynsym, ctx.dynstr, ctx.versym, ctx.verdef, ctx.verneed);
    let (hash, gnu_hash, dynamic, interp) = (ctx.hash, ctx.gnu_hash, ctx.dynamic, ctx.interp);
    let (note_property, buildid, symtab, strtab) =
        (ctx.note_property, ctx.buildid, ctx.symtab, ctx.strtab);
    let (phdr, shdr) = (ctx.phdr, ctx.shdr);

    // .got
    let got_slots = ctx.got_section().num_slots();
    set_chunk_size(ctx, got, got_slots * word);

    // .plt and .got.plt: three reserved slots, then one per PLT entry.
    let num_plt = match &ctx.chunk(plt.expect("synthetic sections not initialized")).payload {
        ChunkPayload::Plt(plt) => plt.symbols.len() as u64,
        _ => unreachable!(),
    };
    let plt_size = if num_plt == 0 {
        0
    } else {
        ctx.arch.plt_header_size() + num_plt * ctx.arch.plt_entry_size()
    };
    set_chunk_size(ctx, plt, plt_size);
    set_chunk_size(ctx, gotplt, (3 + num_plt) * word);
    set_chunk_size(ctx, relplt, num_plt * rel_size);

    let num_pltgot = match &ctx
        .chunk(pltgot.expect("synthetic sections not initialized"))
        .payload
    {
        ChunkPayload::PltGot(section) => section.symbols.len() as u64,
        _ => unreachable!(),
    };
    let pltgot_entry = ctx.arch.pltgot_entry_size();
    set_chunk_size(ctx, pltgot, num_pltgot * pltgot_entry);

    // .rel[a].dyn: data relocations found while scanning, GOT-derived relocations and one copy
    // relocation per COPYREL base symbol.
    let num_relative = ctx
        .num_dynrel_relative
        .load(std::sync::atomic::Ordering::Relaxed);
    let mut num_general = ctx
        .num_dynrel_general
        .load(std::sync::atomic::Ordering::Relaxed);
    {
        let got = ctx.got_section();
        for entry in &got.entries {
            let sym = ctx.symbol_db.symbol(entry.sym);
            match entry.kind {
                GotEntryKind::Address => {
                    if sym.is_ifunc() || sym.imported() || ctx.args.pic {
                        num_general += 1;
                    }
                }
                GotEntryKind::TpOff => {
                    if sym.imported() {
                        num_general += 1;
                    }
                }
                GotEntryKind::TlsGd => num_general += 2,
                GotEntryKind::TlsDesc => num_general += 1,
            }
        }
        if got.tlsld_slot.is_some() {
            num_general += 1;
        }
    }
    for id in [ctx.dynbss, ctx.dynbss_relro].into_iter().flatten() {
        if let ChunkPayload::Dynbss(sec) = &ctx.chunk(id).payload {
            num_general += sec.symbols.len() as u64;
        }
    }
    {
        let section = ctx.reldyn_section_mut();
        section.num_relative = num_relative;
        section.num_general = num_general;
    }
    set_chunk_size(ctx, reldyn, (num_relative + num_general) * rel_size);

    // .dynsym / .dynstr
    let num_dynsym = ctx.dynsym_section().symbols.len() as u64;
    set_chunk_size(ctx, dynsym, (1 + num_dynsym) * sym_size);
    if let Some(id) = dynsym {
        ctx.chunk_mut(id).shdr.sh_info = 1;
    }
    let sonames: Vec<&[u8]> = ctx
        .live_dsos()
        .map(|(_, dso)| dso.soname.as_bytes())
        .collect();
    let num_needed = sonames.len() as u64;
    for soname in sonames {
        ctx.dynstr_table_mut().add(soname);
    }
    let verdef_names: Vec<String> = ctx.args.version_definitions.clone();
    for name in &verdef_names {
        ctx.dynstr_table_mut().add(name.as_bytes());
    }
    let dynstr_size = ctx.dynstr_table_mut().size();
    set_chunk_size(ctx, dynstr, dynstr_size);

    // Version tables. Version requirements are the writer's department; the verneed chunk stays
    // empty here.
    let num_verdef = verdef_names.len() as u64;
    if verdef.is_some() {
        set_chunk_size(ctx, verdef, (1 + num_verdef) * 28);
        if let Some(id) = verdef {
            ctx.chunk_mut(id).shdr.sh_info = (1 + num_verdef) as u32;
        }
        set_chunk_size(ctx, versym, (1 + num_dynsym) * 2);
    }

    // Hash tables.
    if hash.is_some() {
        let nchain = 1 + num_dynsym;
        set_chunk_size(ctx, hash, (2 + nchain * 2) * 4);
    }
    if gnu_hash.is_some() {
        let num_exported = ctx
            .dynsym_section()
            .symbols
            .iter()
            .filter(|id| ctx.symbol_db.symbol(**id).exported())
            .count() as u64;
        let num_buckets = num_exported.div_ceil(4).max(1);
        set_chunk_size(ctx, gnu_hash, 16 + word + num_buckets * 4 + num_exported * 4);
    }

    // .dynamic: DT_NEEDED per shared object plus a bounded set of fixed tags.
    let fixed_tags = 24u64;
    let dynamic_entsize = crate::chunk::dynamic_entry_size(ctx.arch);
    set_chunk_size(ctx, dynamic, (num_needed + fixed_tags) * dynamic_entsize);

    // .interp
    if let Some(linker) = ctx.args.dynamic_linker.clone() {
        set_chunk_size(ctx, interp, linker.len() as u64 + 1);
    }

    // .note.gnu.property carries the AND of every object's feature bits.
    let mut features = u32::MAX;
    for (_, obj) in ctx.live_objects() {
        features &= obj.features;
    }
    let property_size = if features == 0 || features == u32::MAX {
        0
    } else if ctx.arch.is_64() {
        0x20
    } else {
        0x1c
    };
    set_chunk_size(ctx, note_property, property_size);

    // Build ID note: note header, "GNU\0" and the digest.
    let digest_len: u64 = match ctx.args.build_id {
        crate::args::BuildIdKind::None => 0,
        crate::args::BuildIdKind::Uuid | crate::args::BuildIdKind::Md5 => 16,
        crate::args::BuildIdKind::Sha1 => 20,
        crate::args::BuildIdKind::Hex(len) => len as u64,
    };
    if digest_len > 0 {
        set_chunk_size(ctx, buildid, 16 + digest_len);
    }

    // .symtab / .strtab over every live object's symbols.
    let mut num_syms = 1u64;
    let mut strtab_size = 1u64;
    for (_, obj) in ctx.live_objects() {
        for esym in &obj.elf_syms {
            if esym.name.is_empty() {
                continue;
            }
            num_syms += 1;
            strtab_size += esym.name.len() as u64 + 1;
        }
    }
    set_chunk_size(ctx, symtab, num_syms * sym_size);
    set_chunk_size(ctx, strtab, strtab_size);

    update_shstrtab_size(ctx);

    // Header chunks.
    let phdr_entry: u64 = if ctx.arch.is_64() { 56 } else { 32 };
    let phdr_size = count_program_headers(ctx) * phdr_entry;
    set_chunk_size(ctx, phdr, phdr_size);
    let shdr_entry: u64 = if ctx.arch.is_64() { 64 } else { 40 };
    let num_sections = ctx
        .chunks
        .iter()
        .filter(|id| ctx.chunk(**id).kind != ChunkKind::Header)
        .count() as u64;
    set_chunk_size(ctx, shdr, (1 + num_sections) * shdr_entry);

    // sh_link wiring for the writer.
    set_chunk_link(ctx, dynsym, dynstr);
    set_chunk_link(ctx, symtab, strtab);
    set_chunk_link(ctx, reldyn, dynsym);
    set_chunk_link(ctx, relplt, dynsym);
    set_chunk_link(ctx, hash, dynsym);
    set_chunk_link(ctx, gnu_hash, dynsym);
    set_chunk_link(ctx, versym, dynsym);
    set_chunk_link(ctx, verdef, dynstr);
    set_chunk_link(ctx, verneed, dynstr);
    set_chunk_link(ctx, dynamic, dynstr);
}

/// Whether a page boundary must separate two adjacent allocated chunks: any change of segment
/// access flags, a RELRO boundary or a TLS boundary.
fn separate_page(ctx: &Context<'_>, prev: ChunkId, next: ChunkId) -> bool {
    let key = |id: ChunkId| {
        let shdr = &ctx.chunk(id).shdr;
        (
            shdr.is_writable(),
            shdr.is_executable(),
            shdr.is_tls(),
            is_relro(ctx, id),
        )
    };
    key(prev) != key(next)
}

/// Assigns virtual addresses and file offsets to all chunks and returns the output file size.
///
/// TBSS chunks receive the current address but don't advance it: the TLS template's zero part
/// overlaps whatever follows, which saves a PT_LOAD. A fixup pass afterwards spreads
/// consecutive TBSS chunks monotonically inside the overlap region.
#[tracing::instrument(skip_all)]
pub fn set_osec_offsets(ctx: &mut Context<'_>) -> u64 {
    let ids = ctx.chunks.clone();

    let mut addr = ctx.image_base;
    let mut prev: Option<ChunkId> = None;
    for id in &ids {
        if !ctx.chunk(*id).shdr.is_alloc() {
            continue;
        }
        if let Some(prev) = prev {
            if separate_page(ctx, prev, *id) {
                addr = align_to(addr, ctx.page_size);
            }
        }
        prev = Some(*id);

        if ctx.chunk(*id).shdr.is_tbss() {
            ctx.chunk_mut(*id).shdr.sh_addr = addr;
            continue;
        }

        let align = ctx.chunk(*id).shdr.sh_addralign.max(1);
        addr = align_to(addr, align);
        let chunk = ctx.chunk_mut(*id);
        chunk.shdr.sh_addr = addr;
        addr += chunk.shdr.sh_size;
    }

    // Spread TBSS runs inside the overlap region.
    let mut index = 0;
    while index < ids.len() {
        if !ctx.chunk(ids[index]).shdr.is_tbss() {
            index += 1;
            continue;
        }
        let mut tbss_addr = ctx.chunk(ids[index]).shdr.sh_addr;
        while index < ids.len() && ctx.chunk(ids[index]).shdr.is_tbss() {
            let chunk = ctx.chunk_mut(ids[index]);
            tbss_addr = align_to(tbss_addr, chunk.shdr.sh_addralign.max(1));
            chunk.shdr.sh_addr = tbss_addr;
            tbss_addr += chunk.shdr.sh_size;
            index += 1;
        }
    }

    // File offsets: NOBITS chunks take the cursor without advancing it; everything else lands
    // at the smallest offset congruent to its address modulo the page size.
    let page_size = ctx.page_size;
    let mut fileoff = 0u64;
    for id in &ids {
        let chunk = ctx.chunk_mut(*id);
        if chunk.shdr.is_nobits() {
            chunk.shdr.sh_offset = fileoff;
        } else {
            fileoff = align_with_skew(fileoff, page_size, chunk.shdr.sh_addr);
            chunk.shdr.sh_offset = fileoff;
            fileoff += chunk.shdr.sh_size;
        }
    }
    fileoff
}

/// The final virtual address of a symbol, once chunk addresses are known.
pub fn symbol_address(ctx: &Context<'_>, id: SymbolId) -> u64 {
    let sym = ctx.symbol_db.symbol(id);
    if sym.has_copyrel {
        let chunk = if sym.copyrel_readonly {
            ctx.dynbss_relro
        } else {
            ctx.dynbss
        };
        return chunk.map_or(0, |chunk| ctx.chunk(chunk).shdr.sh_addr) + sym.value;
    }
    if let Some(origin) = sym.origin_section {
        let section = ctx.section(origin);
        if let Some(osec) = section.output_section {
            return ctx.chunk(osec).shdr.sh_addr + section.offset() + sym.value;
        }
    }
    sym.value
}

fn set_symbol(ctx: &mut Context<'_>, id: Option<SymbolId>, shndx: u32, value: u64) {
    if let Some(id) = id {
        let sym = ctx.symbol_db.symbol_mut(id);
        sym.shndx = shndx;
        sym.value = value;
    }
}

fn chunk_start(ctx: &Context<'_>, id: Option<ChunkId>) -> Option<(u32, u64)> {
    id.map(|id| {
        let chunk = ctx.chunk(id);
        (chunk.shndx, chunk.shdr.sh_addr)
    })
}

/// Computes the values of all linker-synthesized symbols from the finalized chunk list.
#[tracing::instrument(skip_all)]
pub fn fix_synthetic_symbols(ctx: &mut Context<'_>) {
    let ids = ctx.chunks.clone();
    let syms = std::mem::take(&mut ctx.synthetic_syms);

    // __bss_start: start of the first regular .bss chunk.
    let bss = ids
        .iter()
        .copied()
        .find(|id| ctx.chunk(*id).kind == ChunkKind::Regular && ctx.chunk(*id).name == b".bss");
    if let Some((shndx, addr)) = chunk_start(ctx, bss) {
        set_symbol(ctx, syms.bss_start, shndx, addr);
    }

    // __ehdr_start and __executable_start both name the load base.
    if let Some(ehdr) = ctx.ehdr {
        let addr = ctx.chunk(ehdr).shdr.sh_addr;
        set_symbol(ctx, syms.ehdr_start, 1, addr);
        set_symbol(ctx, syms.executable_start, 1, addr);
    }

    // __rel_iplt_start / __rel_iplt_end bound the IRELATIVE records at the front of .rel[a].dyn.
    if let Some((shndx, addr)) = chunk_start(ctx, ctx.reldyn) {
        set_symbol(ctx, syms.rel_iplt_start, shndx, addr);
        let num_irelative = ctx
            .got_section()
            .entries
            .iter()
            .filter(|entry| {
                entry.kind == GotEntryKind::Address
                    && ctx.symbol_db.symbol(entry.sym).is_ifunc()
            })
            .count() as u64;
        let end = addr + num_irelative * ctx.arch.rel_entry_size();
        set_symbol(ctx, syms.rel_iplt_end, shndx, end);
    }

    // Init/fini array bounds.
    for id in &ids {
        let chunk = ctx.chunk(*id);
        let sh_type = chunk.shdr.sh_type;
        let (shndx, start) = (chunk.shndx, chunk.shdr.sh_addr);
        let stop = start + chunk.shdr.sh_size;
        match sh_type {
            elf::SHT_INIT_ARRAY => {
                set_symbol(ctx, syms.init_array_start, shndx, start);
                set_symbol(ctx, syms.init_array_end, shndx, stop);
            }
            elf::SHT_FINI_ARRAY => {
                set_symbol(ctx, syms.fini_array_start, shndx, start);
                set_symbol(ctx, syms.fini_array_end, shndx, stop);
            }
            _ => {}
        }
    }

    // _end, _etext, _edata: ends of the last allocated / executable / non-bss chunks.
    for id in &ids {
        let chunk = ctx.chunk(*id);
        if chunk.kind == ChunkKind::Header {
            continue;
        }
        let shndx = chunk.shndx;
        let stop = chunk.shdr.sh_addr + chunk.shdr.sh_size;
        let (alloc, exec, nobits) = (
            chunk.shdr.is_alloc(),
            chunk.shdr.is_executable(),
            chunk.shdr.is_nobits(),
        );
        if alloc {
            set_symbol(ctx, syms.end, shndx, stop);
            set_symbol(ctx, syms.end_unprefixed, shndx, stop);
        }
        if exec {
            set_symbol(ctx, syms.etext, shndx, stop);
            set_symbol(ctx, syms.etext_unprefixed, shndx, stop);
        }
        if alloc && !nobits {
            set_symbol(ctx, syms.edata, shndx, stop);
            set_symbol(ctx, syms.edata_unprefixed, shndx, stop);
        }
    }

    if let Some((shndx, addr)) = chunk_start(ctx, ctx.dynamic) {
        set_symbol(ctx, syms.dynamic, shndx, addr);
    }

    let got_anchor = match ctx.arch.got_anchor() {
        GotAnchor::GotPlt => ctx.gotplt,
        GotAnchor::Got => ctx.got,
    };
    if let Some((shndx, addr)) = chunk_start(ctx, got_anchor) {
        set_symbol(ctx, syms.global_offset_table, shndx, addr);
    }

    if let Some((shndx, addr)) = chunk_start(ctx, ctx.eh_frame_hdr) {
        set_symbol(ctx, syms.gnu_eh_frame_hdr, shndx, addr);
    }

    // __start_<name> / __stop_<name> for chunks with C-identifier names.
    for (chunk_id, start_sym, stop_sym) in &syms.start_stop {
        let chunk = ctx.chunk(*chunk_id);
        let (shndx, addr, size) = (chunk.shndx, chunk.shdr.sh_addr, chunk.shdr.sh_size);
        set_symbol(ctx, Some(*start_sym), shndx, addr);
        set_symbol(ctx, Some(*stop_sym), shndx, addr + size);
    }

    ctx.synthetic_syms = syms;

    // --defsym targets resolve last so they can alias other synthesized symbols.
    let defsyms = ctx.args.defsyms.clone();
    for (name, value) in defsyms {
        let Some(id) = ctx.symbol_db.lookup(name.as_bytes()) else {
            continue;
        };
        ctx.symbol_db.symbol_mut(id).origin_section = None;
        match value {
            crate::args::DefsymValue::Address(addr) => {
                let sym = ctx.symbol_db.symbol_mut(id);
                sym.value = addr;
                sym.shndx = 0;
            }
            crate::args::DefsymValue::Symbol(target) => {
                let Some(target_id) = ctx
                    .symbol_db
                    .lookup(target.as_bytes())
                    .filter(|target_id| ctx.symbol_db.symbol(*target_id).file.is_some())
                else {
                    ctx.record_error(anyhow!(
                        "--defsym: undefined symbol: {}",
                        DisplayName(target.as_bytes())
                    ));
                    continue;
                };
                let addr = symbol_address(ctx, target_id);
                let target_sym = ctx.symbol_db.symbol(target_id);
                let visibility = target_sym.visibility;
                let shndx = target_sym
                    .origin_section
                    .and_then(|origin| ctx.section(origin).output_section)
                    .map_or(target_sym.shndx, |osec| ctx.chunk(osec).shndx);
                let sym = ctx.symbol_db.symbol_mut(id);
                sym.value = addr;
                sym.visibility = visibility;
                sym.shndx = shndx;
            }
        }
    }
}

/// Concatenated contents of a chunk, padding included, as the writer would emit them.
fn chunk_image(ctx: &Context<'_>, id: ChunkId) -> Vec<u8> {
    let chunk = ctx.chunk(id);
    let mut image = vec![0u8; chunk.shdr.sh_size as usize];
    match &chunk.payload {
        ChunkPayload::Output(osec) => {
            for member in &osec.members {
                let section = ctx.section(*member);
                if section.shdr.is_nobits() {
                    continue;
                }
                let offset = section.offset() as usize;
                image[offset..offset + section.data.len()].copy_from_slice(section.data);
            }
        }
        ChunkPayload::Merged(sec) => {
            for fragment in &sec.fragments {
                if !fragment.is_alive() {
                    continue;
                }
                let offset = fragment.offset as usize;
                image[offset..offset + fragment.data.len()].copy_from_slice(fragment.data);
            }
        }
        _ => {}
    }
    image
}

fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory write cannot fail");
    encoder.finish().expect("in-memory write cannot fail")
}

/// Replaces non-allocated `.debug*` chunks with compressed wrappers, then refreshes the headers
/// whose sizes changed.
#[tracing::instrument(skip_all)]
pub fn compress_debug_sections(ctx: &mut Context<'_>) {
    let format = ctx.args.compress_debug_sections;
    if format == CompressKind::None {
        return;
    }

    let candidates: Vec<ChunkId> = ctx
        .chunks
        .iter()
        .copied()
        .filter(|id| {
            let chunk = ctx.chunk(*id);
            !chunk.shdr.is_alloc() && chunk.shdr.sh_size > 0 && chunk.name.starts_with(b".debug")
        })
        .collect();

    let compressed: Vec<(ChunkId, u64, Vec<u8>)> = {
        let ctx = &*ctx;
        candidates
            .par_iter()
            .map(|id| {
                let image = chunk_image(ctx, *id);
                (*id, image.len() as u64, zlib_compress(&image))
            })
            .collect()
    };

    // Appending replacement chunks must serialize; the parallel part above only computed bytes.
    for (id, uncompressed_size, data) in compressed {
        let header_size: u64 = match format {
            CompressKind::Gabi => {
                if ctx.arch.is_64() {
                    24
                } else {
                    12
                }
            }
            CompressKind::Gnu => 12, // "ZLIB" magic plus a big-endian 64-bit size
            CompressKind::None => unreachable!(),
        };
        let new_size = header_size + data.len() as u64;
        if format == CompressKind::Gnu {
            // GNU-style compression renames the section: .debug_info becomes .zdebug_info.
            let new_name = ctx.save_name(b".z", &ctx.chunk(id).name[1..]);
            ctx.chunk_mut(id).name = new_name;
        }
        let chunk = ctx.chunk_mut(id);
        if format == CompressKind::Gabi {
            chunk.shdr.sh_flags |= u64::from(elf::SHF_COMPRESSED);
        }
        chunk.shdr.sh_size = new_size;
        chunk.payload = ChunkPayload::Compressed(CompressedSection {
            format,
            uncompressed_size,
            data,
        });
    }

    update_shstrtab_size(ctx);
}

/// Zeroes the gaps between adjacent non-NOBITS chunks in the output buffer so identical inputs
/// produce byte-identical outputs.
pub fn clear_padding(ctx: &Context<'_>, buf: &mut [u8], filesize: u64) {
    let mut spans: Vec<(u64, u64)> = ctx
        .chunks
        .iter()
        .map(|id| &ctx.chunk(*id).shdr)
        .filter(|shdr| !shdr.is_nobits())
        .map(|shdr| (shdr.sh_offset, shdr.sh_offset + shdr.sh_size))
        .collect();
    spans.sort_unstable();

    let mut pos = 0u64;
    for (start, end) in spans {
        if start > pos {
            buf[pos as usize..start as usize].fill(0);
        }
        pos = pos.max(end);
    }
    if filesize > pos {
        buf[pos as usize..filesize as usize].fill(0);
    }
}
