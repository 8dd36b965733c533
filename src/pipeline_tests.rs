//! End-to-end tests that drive the pass pipeline over synthetic inputs, the way the upstream
//! parser would populate them.

use crate::arch::Architecture;
use crate::args::Args;
use crate::args::DefsymValue;
use crate::args::UnresolvedPolicy;
use crate::args::VersionPattern;
use crate::chunk::ChunkId;
use crate::chunk::ChunkKind;
use crate::compute_layout;
use crate::context::Context;
use crate::elf;
use crate::elf::InputShndx;
use crate::elf::InputSymbol;
use crate::elf::SectionHeader;
use crate::input_file::FileId;
use crate::input_file::InputReloc;
use crate::input_file::InputSection;
use crate::input_file::ObjectFile;
use crate::input_file::RelocKind;
use crate::input_file::SharedFile;
use crate::layout;
use crate::layout::output_section_instance;
use crate::layout::symbol_address;
use crate::resolution;
use crate::symbol::Visibility;
use crate::symbol_db::SymbolId;
use bumpalo_herd::Herd;

fn make_ctx(args: Args, herd: &Herd) -> Context<'_> {
    // Make RUST_LOG work when debugging a single test.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Context::new(args, Architecture::X86_64, herd)
}

fn make_shdr(sh_type: u32, sh_flags: u32, size: u64, align: u64) -> SectionHeader {
    SectionHeader {
        sh_type,
        sh_flags: u64::from(sh_flags),
        sh_size: size,
        sh_addralign: align,
        ..Default::default()
    }
}

fn make_section<'data>(
    ctx: &mut Context<'data>,
    name: &'data [u8],
    out_name: &'data [u8],
    sh_type: u32,
    sh_flags: u32,
    size: u64,
    align: u64,
) -> InputSection<'data> {
    let osec = output_section_instance(ctx, out_name, sh_type, u64::from(sh_flags));
    let mut section = InputSection::new(name, make_shdr(sh_type, sh_flags, size, align), &[]);
    section.output_section = Some(osec);
    section
}

fn defined<'data>(
    name: &'data [u8],
    section: u32,
    sym_type: u8,
    value: u64,
    size: u64,
) -> InputSymbol<'data> {
    InputSymbol {
        name,
        value,
        size,
        shndx: InputShndx::Section(section),
        sym_type,
        bind: elf::STB_GLOBAL,
        visibility: Visibility::Default,
    }
}

fn undef(name: &[u8]) -> InputSymbol<'_> {
    InputSymbol {
        name,
        value: 0,
        size: 0,
        shndx: InputShndx::Undefined,
        sym_type: elf::STT_NOTYPE,
        bind: elf::STB_GLOBAL,
        visibility: Visibility::Default,
    }
}

fn sym_id(ctx: &Context<'_>, name: &[u8]) -> SymbolId {
    ctx.symbol_db.lookup(name).expect("symbol interned")
}

fn chunk_by_name(ctx: &Context<'_>, name: &[u8]) -> ChunkId {
    ctx.chunks
        .iter()
        .copied()
        .find(|id| ctx.chunk(*id).name == name)
        .expect("chunk present")
}

#[test]
fn two_object_link() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut a = ObjectFile::new("a.o", None);
    let text_a = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x20,
        16,
    );
    a.sections = vec![text_a];
    a.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 0x20), undef(b"f")];
    ctx.add_object(a);

    let mut b = ObjectFile::new("b.o", None);
    let text_b = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x10,
        16,
    );
    let bss_b = make_section(
        &mut ctx,
        b".bss",
        b".bss",
        elf::SHT_NOBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        8,
        8,
    );
    b.sections = vec![text_b, bss_b];
    b.elf_syms = vec![defined(b"f", 0, elf::STT_FUNC, 0, 0x10)];
    ctx.add_object(b);

    compute_layout(&mut ctx).unwrap();

    let text = chunk_by_name(&ctx, b".text");
    let text_chunk = ctx.chunk(text);
    assert_eq!(text_chunk.output_section().unwrap().members.len(), 2);
    assert_eq!(text_chunk.shdr.sh_size, 0x30);

    // main is at the start of .text, f right behind it at its alignment.
    let main_addr = symbol_address(&ctx, sym_id(&ctx, b"main"));
    let f_addr = symbol_address(&ctx, sym_id(&ctx, b"f"));
    assert_eq!(main_addr, text_chunk.shdr.sh_addr);
    assert_eq!(f_addr, main_addr + 0x20);
    assert!(main_addr >= ctx.image_base + 64);

    let bss_chunk = ctx.chunk(chunk_by_name(&ctx, b".bss"));
    let sym_value = |id: Option<SymbolId>| ctx.symbol_db.symbol(id.unwrap()).value;
    assert_eq!(
        sym_value(ctx.synthetic_syms.bss_start),
        bss_chunk.shdr.sh_addr
    );
    assert_eq!(
        sym_value(ctx.synthetic_syms.etext),
        text_chunk.shdr.sh_addr + text_chunk.shdr.sh_size
    );
    assert_eq!(
        sym_value(ctx.synthetic_syms.end),
        bss_chunk.shdr.sh_addr + bss_chunk.shdr.sh_size
    );
    // No NOBITS data past .bss, so _end is also where the zero-fill starts.
    assert!(sym_value(ctx.synthetic_syms.edata) <= sym_value(ctx.synthetic_syms.end));
}

#[test]
fn archive_selection() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut a = ObjectFile::new("a.o", None);
    a.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 8), undef(b"g")];
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    a.sections = vec![text];
    ctx.add_object(a);

    let mut x1 = ObjectFile::new("x1.o", Some("libx.a"));
    x1.elf_syms = vec![defined(b"g", 0, elf::STT_FUNC, 0, 8)];
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    x1.sections = vec![text];
    ctx.add_object(x1);

    let mut x2 = ObjectFile::new("x2.o", Some("libx.a"));
    x2.elf_syms = vec![defined(b"h", 0, elf::STT_FUNC, 0, 8)];
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    x2.sections = vec![text];
    ctx.add_object(x2);

    resolution::resolve_symbols(&mut ctx);

    let live: Vec<&str> = ctx.live_objects().map(|(_, obj)| obj.name).collect();
    assert_eq!(live, vec!["a.o", "x1.o"]);

    // g resolved into the loaded member; h observed the empty re-init.
    let g = ctx.symbol_db.symbol(sym_id(&ctx, b"g"));
    assert_eq!(g.file, Some(FileId::object(1)));
    assert!(g.is_defined());
    let h = ctx.symbol_db.symbol(sym_id(&ctx, b"h"));
    assert_eq!(h.file, None);
    assert!(!h.is_defined());
}

#[test]
fn comdat_dedup() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    for name in ["a.o", "b.o"] {
        let mut obj = ObjectFile::new(name, None);
        let text = make_section(
            &mut ctx,
            b".text._ZN1XIiEE4funcEv",
            b".text",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            0x10,
            1,
        );
        obj.sections = vec![text];
        obj.comdat_groups
            .push(crate::input_file::ComdatGroup {
                key: b"_ZN1XIiEE",
                members: vec![0],
            });
        ctx.add_object(obj);
    }

    resolution::resolve_symbols(&mut ctx);
    resolution::eliminate_comdats(&mut ctx);

    assert!(ctx.objs[0].section(0).is_alive());
    assert!(!ctx.objs[1].section(0).is_alive());

    layout::bin_sections(&mut ctx);
    let text = ctx.output_sections[0];
    let members = &ctx.chunk(text).output_section().unwrap().members;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].file, FileId::object(0));
}

#[test]
fn copyrel_with_aliases() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut a = ObjectFile::new("a.o", None);
    let mut text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x10,
        1,
    );
    text.relocs.push(InputReloc {
        offset: 0,
        kind: RelocKind::Absolute,
        sym_index: 1,
        addend: 0,
    });
    a.sections = vec![text];
    a.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 0x10), undef(b"stdout")];
    ctx.add_object(a);

    let mut libc = SharedFile::new("libc.so", "libc.so.6");
    libc.elf_syms = vec![
        InputSymbol {
            name: b"stdout",
            value: 0x40,
            size: 8,
            shndx: InputShndx::Section(1),
            sym_type: elf::STT_OBJECT,
            bind: elf::STB_GLOBAL,
            visibility: Visibility::Default,
        },
        InputSymbol {
            name: b"stdout_glibc",
            value: 0x40,
            size: 8,
            shndx: InputShndx::Section(1),
            sym_type: elf::STT_OBJECT,
            bind: elf::STB_GLOBAL,
            visibility: Visibility::Default,
        },
    ];
    libc.ro_ranges = vec![0x0..0x1000];
    ctx.add_shared(libc);

    compute_layout(&mut ctx).unwrap();

    let stdout = ctx.symbol_db.symbol(sym_id(&ctx, b"stdout"));
    let alias = ctx.symbol_db.symbol(sym_id(&ctx, b"stdout_glibc"));
    for sym in [stdout, alias] {
        assert!(sym.imported());
        assert!(sym.exported());
        assert!(sym.has_copyrel);
        assert!(sym.copyrel_readonly);
        assert!(sym.aux_idx.is_some());
    }
    assert_eq!(stdout.value, alias.value);
    assert_ne!(stdout.aux_idx, alias.aux_idx);

    let dynsym = ctx.dynsym_section();
    assert!(dynsym.symbols.contains(&sym_id(&ctx, b"stdout")));
    assert!(dynsym.symbols.contains(&sym_id(&ctx, b"stdout_glibc")));

    // The reservation went into the read-only flavor, exactly once for both names.
    let relro = ctx.chunk(ctx.dynbss_relro.unwrap());
    assert_eq!(relro.shdr.sh_size, 8);
    assert_eq!(ctx.chunk(ctx.dynbss.unwrap()).shdr.sh_size, 0);
}

#[test]
fn init_array_ordering() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    for (file_name, section_name) in [
        ("a.o", b".init_array.100".as_slice()),
        ("b.o", b".init_array.5".as_slice()),
        ("c.o", b".init_array".as_slice()),
    ] {
        let mut obj = ObjectFile::new(file_name, None);
        let section = make_section(
            &mut ctx,
            section_name,
            b".init_array",
            elf::SHT_INIT_ARRAY,
            elf::SHF_ALLOC | elf::SHF_WRITE,
            8,
            8,
        );
        obj.sections = vec![section];
        ctx.add_object(obj);
    }

    resolution::resolve_symbols(&mut ctx);
    layout::bin_sections(&mut ctx);
    layout::sort_init_fini(&mut ctx);

    let init_array = ctx.output_sections[0];
    let members = &ctx.chunk(init_array).output_section().unwrap().members;
    let order: Vec<usize> = members.iter().map(|member| member.file.index()).collect();
    // Priority 5 first, then 100, then the no-priority catch-all.
    assert_eq!(order, vec![1, 0, 2]);
}

#[test]
fn rel_iplt_end_counts_ifuncs() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut a = ObjectFile::new("a.o", None);
    let mut text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x40,
        16,
    );
    for sym_index in 1..=3 {
        text.relocs.push(InputReloc {
            offset: sym_index as u64 * 8,
            kind: RelocKind::PltCall,
            sym_index,
            addend: -4,
        });
    }
    a.sections = vec![text];
    a.elf_syms = vec![
        defined(b"main", 0, elf::STT_FUNC, 0, 0x10),
        defined(b"i1", 0, elf::STT_GNU_IFUNC, 0x10, 0x10),
        defined(b"i2", 0, elf::STT_GNU_IFUNC, 0x20, 0x10),
        defined(b"i3", 0, elf::STT_GNU_IFUNC, 0x30, 0x10),
    ];
    ctx.add_object(a);

    compute_layout(&mut ctx).unwrap();

    let reldyn = ctx.chunk(ctx.reldyn.unwrap());
    let end = ctx
        .symbol_db
        .symbol(ctx.synthetic_syms.rel_iplt_end.unwrap());
    assert_eq!(end.value, reldyn.shdr.sh_addr + 3 * 24);
    let start = ctx
        .symbol_db
        .symbol(ctx.synthetic_syms.rel_iplt_start.unwrap());
    assert_eq!(start.value, reldyn.shdr.sh_addr);
}

#[test]
fn canonical_plt_gets_both_slots() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut a = ObjectFile::new("a.o", None);
    let mut text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x10,
        1,
    );
    text.relocs.push(InputReloc {
        offset: 0,
        kind: RelocKind::PltCall,
        sym_index: 1,
        addend: -4,
    });
    text.relocs.push(InputReloc {
        offset: 8,
        kind: RelocKind::GotLoad,
        sym_index: 1,
        addend: -4,
    });
    a.sections = vec![text];
    a.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 0x10), undef(b"qux")];
    ctx.add_object(a);

    let mut libq = SharedFile::new("libq.so", "libq.so.1");
    libq.elf_syms = vec![defined(b"qux", 0, elf::STT_FUNC, 0x100, 0x10)];
    ctx.add_shared(libq);

    compute_layout(&mut ctx).unwrap();

    // Non-PIC import: the canonical PLT entry goes to .plt, keeps its GOT slot and forces the
    // symbol exported.
    let qux = sym_id(&ctx, b"qux");
    let aux = ctx.aux(qux).unwrap();
    assert!(aux.plt_idx.is_some());
    assert!(aux.pltgot_idx.is_none());
    assert!(aux.got_idx.is_some());
    assert!(ctx.symbol_db.symbol(qux).exported());
}

#[test]
fn pic_import_uses_plt_got() {
    let herd = Herd::new();
    let mut args = Args::default();
    args.pic = true;
    let mut ctx = make_ctx(args, &herd);

    let mut a = ObjectFile::new("a.o", None);
    let mut text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x10,
        1,
    );
    text.relocs.push(InputReloc {
        offset: 0,
        kind: RelocKind::PltCall,
        sym_index: 1,
        addend: -4,
    });
    text.relocs.push(InputReloc {
        offset: 8,
        kind: RelocKind::GotLoad,
        sym_index: 1,
        addend: -4,
    });
    a.sections = vec![text];
    a.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 0x10), undef(b"qux")];
    ctx.add_object(a);

    let mut libq = SharedFile::new("libq.so", "libq.so.1");
    libq.elf_syms = vec![defined(b"qux", 0, elf::STT_FUNC, 0x100, 0x10)];
    ctx.add_shared(libq);

    compute_layout(&mut ctx).unwrap();

    let aux = ctx.aux(sym_id(&ctx, b"qux")).unwrap();
    assert!(aux.pltgot_idx.is_some());
    assert!(aux.plt_idx.is_none());
    assert!(aux.got_idx.is_some());
}

#[test]
fn offsets_are_block_size_independent() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let mut sections = Vec::new();
    for index in 0..100u64 {
        let align = 1 << (index % 5);
        let section = make_section(
            &mut ctx,
            b".data",
            b".data",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
            (index % 7) + 1,
            align,
        );
        sections.push(section);
    }
    obj.sections = sections;
    ctx.add_object(obj);

    resolution::resolve_symbols(&mut ctx);
    layout::bin_sections(&mut ctx);

    layout::compute_section_sizes_with_block(&mut ctx, 3);
    let with_small_blocks: Vec<u64> = ctx.objs[0].sections.iter().map(|s| s.offset()).collect();
    let small_size = ctx.chunk(ctx.output_sections[0]).shdr.sh_size;

    layout::compute_section_sizes_with_block(&mut ctx, 10_000);
    let with_one_block: Vec<u64> = ctx.objs[0].sections.iter().map(|s| s.offset()).collect();
    let big_size = ctx.chunk(ctx.output_sections[0]).shdr.sh_size;

    assert_eq!(with_small_blocks, with_one_block);
    assert_eq!(small_size, big_size);

    // Offset monotonicity and alignment.
    let members = &ctx.chunk(ctx.output_sections[0]).output_section().unwrap().members;
    let mut previous_end = 0;
    for member in members {
        let section = ctx.section(*member);
        assert!(section.offset() >= previous_end);
        assert_eq!(section.offset() % section.shdr.sh_addralign, 0);
        previous_end = section.offset() + section.shdr.sh_size;
    }
}

#[test]
fn bin_sections_is_idempotent() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    for name in ["a.o", "b.o", "c.o"] {
        let mut obj = ObjectFile::new(name, None);
        let section = make_section(
            &mut ctx,
            b".data",
            b".data",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
            8,
            4,
        );
        obj.sections = vec![section];
        ctx.add_object(obj);
    }

    resolution::resolve_symbols(&mut ctx);
    layout::bin_sections(&mut ctx);
    let first: Vec<_> = ctx
        .chunk(ctx.output_sections[0])
        .output_section()
        .unwrap()
        .members
        .clone();
    layout::bin_sections(&mut ctx);
    let second = &ctx.chunk(ctx.output_sections[0]).output_section().unwrap().members;
    assert_eq!(&first, second);
}

#[test]
fn chunk_ordering_is_stable_and_page_congruent() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x1234,
        16,
    );
    let rodata = make_section(
        &mut ctx,
        b".rodata",
        b".rodata",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC,
        0x88,
        8,
    );
    let data = make_section(
        &mut ctx,
        b".data",
        b".data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        0x40,
        8,
    );
    let bss = make_section(
        &mut ctx,
        b".bss",
        b".bss",
        elf::SHT_NOBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        0x100,
        8,
    );
    obj.sections = vec![text, rodata, data, bss];
    obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 4)];
    ctx.add_object(obj);

    compute_layout(&mut ctx).unwrap();

    // Sorting again is a no-op: the rank induces a total order with insertion-stable ties.
    let order = ctx.chunks.clone();
    layout::order_chunks(&mut ctx);
    assert_eq!(order, ctx.chunks);

    // Read-only before executable before writable; bss last among writables.
    let pos = |name: &[u8]| order.iter().position(|id| ctx.chunk(*id).name == name).unwrap();
    assert!(pos(b".rodata") < pos(b".text"));
    assert!(pos(b".text") < pos(b".data"));
    assert!(pos(b".data") < pos(b".bss"));

    // mmap congruence for everything that occupies file space.
    for id in &ctx.chunks {
        let shdr = &ctx.chunk(*id).shdr;
        if shdr.is_alloc() && !shdr.is_nobits() {
            assert_eq!(
                shdr.sh_offset % ctx.page_size,
                shdr.sh_addr % ctx.page_size,
                "chunk {} breaks page congruence",
                String::from_utf8_lossy(ctx.chunk(*id).name),
            );
        }
    }
}

#[test]
fn tbss_overlaps_following_chunks() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let tdata = make_section(
        &mut ctx,
        b".tdata",
        b".tdata",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
        0x10,
        8,
    );
    let tbss = make_section(
        &mut ctx,
        b".tbss",
        b".tbss",
        elf::SHT_NOBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
        0x100,
        8,
    );
    let data = make_section(
        &mut ctx,
        b".data",
        b".data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        0x10,
        8,
    );
    obj.sections = vec![tdata, tbss, data];
    obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 4)];
    ctx.add_object(obj);

    let filesize = compute_layout(&mut ctx).unwrap();

    let tdata_chunk = ctx.chunk(chunk_by_name(&ctx, b".tdata"));
    let tbss_chunk = ctx.chunk(chunk_by_name(&ctx, b".tbss"));
    let tdata_end = tdata_chunk.shdr.sh_addr + tdata_chunk.shdr.sh_size;

    // TBSS starts right where the TLS data ends and stays within the TLS template image.
    assert_eq!(tbss_chunk.shdr.sh_addr, tdata_end);

    // TBSS advanced neither the address cursor nor the file cursor: the next allocated chunk
    // begins at the page boundary computed from the end of .tdata, ignoring the 0x100 bytes of
    // TBSS, and TBSS's file offset equals the end of .tdata's extent.
    let tbss_pos = ctx
        .chunks
        .iter()
        .position(|id| ctx.chunk(*id).name == b".tbss")
        .unwrap();
    let next_alloc = ctx.chunks[tbss_pos + 1..]
        .iter()
        .map(|id| ctx.chunk(*id))
        .find(|chunk| chunk.shdr.is_alloc())
        .unwrap();
    assert_eq!(
        next_alloc.shdr.sh_addr,
        crate::alignment::align_to(tdata_end, ctx.page_size)
    );
    assert_eq!(
        tbss_chunk.shdr.sh_offset,
        tdata_chunk.shdr.sh_offset + tdata_chunk.shdr.sh_size
    );
    assert!(filesize > 0);
}

#[test]
fn empty_version_script_changes_nothing() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![defined(b"foo", 0, elf::STT_FUNC, 0, 8)];
    ctx.add_object(obj);

    resolution::resolve_symbols(&mut ctx);
    let before = ctx.symbol_db.symbol(sym_id(&ctx, b"foo")).ver_idx();
    crate::version_script::apply_version_script(&mut ctx);
    assert_eq!(ctx.symbol_db.symbol(sym_id(&ctx, b"foo")).ver_idx(), before);
    assert_eq!(before, elf::VER_NDX_GLOBAL);
}

#[test]
fn version_patterns_assign_and_override() {
    let herd = Herd::new();
    let mut args = Args::default();
    args.version_patterns = vec![
        VersionPattern {
            ver_idx: 2,
            patterns: vec!["foo*".to_owned(), "exact_name".to_owned()],
            cpp_patterns: vec![],
        },
        VersionPattern {
            ver_idx: 3,
            patterns: vec!["foo_special".to_owned()],
            cpp_patterns: vec![],
        },
    ];
    let mut ctx = make_ctx(args, &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![
        defined(b"foo_one", 0, elf::STT_FUNC, 0, 1),
        defined(b"foo_special", 0, elf::STT_FUNC, 1, 1),
        defined(b"exact_name", 0, elf::STT_FUNC, 2, 1),
        defined(b"unrelated", 0, elf::STT_FUNC, 3, 1),
    ];
    ctx.add_object(obj);

    resolution::resolve_symbols(&mut ctx);
    crate::version_script::apply_version_script(&mut ctx);

    let ver = |name: &[u8]| ctx.symbol_db.symbol(sym_id(&ctx, name)).ver_idx();
    assert_eq!(ver(b"foo_one"), 2);
    assert_eq!(ver(b"exact_name"), 2);
    // The later group overrides the earlier glob.
    assert_eq!(ver(b"foo_special"), 3);
    assert_eq!(ver(b"unrelated"), elf::VER_NDX_GLOBAL);
}

#[test]
fn symbol_versions_parse_and_reject_unknown() {
    let herd = Herd::new();
    let mut args = Args::default();
    args.shared = true;
    args.pic = true;
    args.version_definitions = vec!["VERS_1".to_owned()];
    let mut ctx = make_ctx(args, &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![
        defined(b"default_ver", 0, elf::STT_FUNC, 0, 1),
        defined(b"hidden_ver", 0, elf::STT_FUNC, 1, 1),
    ];
    obj.symvers = vec![Some("@VERS_1"), Some("VERS_1")];
    ctx.add_object(obj);

    resolution::resolve_symbols(&mut ctx);
    crate::version_script::parse_symbol_version(&mut ctx);
    ctx.checkpoint().unwrap();

    let ver = |name: &[u8]| ctx.symbol_db.symbol(sym_id(&ctx, name)).ver_idx();
    assert_eq!(ver(b"default_ver"), 2);
    assert_eq!(ver(b"hidden_ver"), 2 | elf::VERSYM_HIDDEN);

    // An unknown version tag is an error, reported at the checkpoint.
    let herd2 = Herd::new();
    let mut args = Args::default();
    args.shared = true;
    args.version_definitions = vec!["VERS_1".to_owned()];
    let mut ctx = make_ctx(args, &herd2);
    let mut obj = ObjectFile::new("b.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![defined(b"sym", 0, elf::STT_FUNC, 0, 1)];
    obj.symvers = vec![Some("NO_SUCH_VERSION")];
    ctx.add_object(obj);

    resolution::resolve_symbols(&mut ctx);
    crate::version_script::parse_symbol_version(&mut ctx);
    let err = ctx.checkpoint().unwrap_err();
    assert!(err.to_string().contains("undefined version"));
}

#[test]
fn unresolved_policy_error_and_ignore() {
    for (policy, expect_err) in [
        (UnresolvedPolicy::Error, true),
        (UnresolvedPolicy::Ignore, false),
    ] {
        let herd = Herd::new();
        let mut args = Args::default();
        args.unresolved_symbols = policy;
        let mut ctx = make_ctx(args, &herd);

        let mut obj = ObjectFile::new("a.o", None);
        let text = make_section(
            &mut ctx,
            b".text",
            b".text",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            8,
            1,
        );
        obj.sections = vec![text];
        obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 8), undef(b"missing")];
        ctx.add_object(obj);

        let result = compute_layout(&mut ctx);
        if expect_err {
            let err = result.unwrap_err();
            assert!(err.to_string().contains("undefined symbol"));
        } else {
            result.unwrap();
            // The claimed stub stays importable in a dynamically-linked output.
            let sym = ctx.symbol_db.symbol(sym_id(&ctx, b"missing"));
            assert_eq!(sym.value, 0);
            assert!(sym.imported());
        }
    }
}

#[test]
fn duplicate_definitions_are_batched_errors() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    for name in ["a.o", "b.o"] {
        let mut obj = ObjectFile::new(name, None);
        let text = make_section(
            &mut ctx,
            b".text",
            b".text",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            8,
            1,
        );
        obj.sections = vec![text];
        obj.elf_syms = vec![defined(b"dup", 0, elf::STT_FUNC, 0, 8)];
        ctx.add_object(obj);
    }

    let err = compute_layout(&mut ctx).unwrap_err();
    assert!(err.to_string().contains("duplicate symbol"));
}

#[test]
fn exclude_libs_blocks_export() {
    let herd = Herd::new();
    let mut args = Args::default();
    args.exclude_libs = vec!["ALL".to_owned()];
    let mut ctx = make_ctx(args, &herd);

    let mut a = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    a.sections = vec![text];
    a.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 8), undef(b"from_lib")];
    ctx.add_object(a);

    let mut member = ObjectFile::new("x.o", Some("libx.a"));
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    member.sections = vec![text];
    member.elf_syms = vec![defined(b"from_lib", 0, elf::STT_FUNC, 0, 8)];
    ctx.add_object(member);

    compute_layout(&mut ctx).unwrap();

    let sym = ctx.symbol_db.symbol(sym_id(&ctx, b"from_lib"));
    assert_eq!(sym.ver_idx(), elf::VER_NDX_LOCAL);
    assert!(!sym.exported());
}

#[test]
fn defsym_numeric_and_symbolic() {
    let herd = Herd::new();
    let mut args = Args::default();
    args.defsyms = vec![
        ("abs_sym".to_owned(), DefsymValue::Address(0xdead000)),
        ("alias_sym".to_owned(), DefsymValue::Symbol("main".to_owned())),
    ];
    let mut ctx = make_ctx(args, &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x10,
        16,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 0x10)];
    ctx.add_object(obj);

    compute_layout(&mut ctx).unwrap();

    let abs_sym = ctx.symbol_db.symbol(sym_id(&ctx, b"abs_sym"));
    assert_eq!(abs_sym.value, 0xdead000);
    assert_eq!(abs_sym.shndx, 0);

    let alias = ctx.symbol_db.symbol(sym_id(&ctx, b"alias_sym"));
    let main_addr = symbol_address(&ctx, sym_id(&ctx, b"main"));
    assert_eq!(alias.value, main_addr);
    assert_ne!(alias.shndx, 0);
}

#[test]
fn comment_section_carries_version_string() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 8)];
    ctx.add_object(obj);

    compute_layout(&mut ctx).unwrap();

    let comment = chunk_by_name(&ctx, b".comment");
    let chunk = ctx.chunk(comment);
    assert!(chunk.shdr.sh_size > 0);
    let merged = chunk.merged_section().unwrap();
    assert!(merged
        .fragments
        .iter()
        .any(|fragment| fragment.is_alive() && fragment.data.starts_with(b"bold ")));
}

#[test]
fn start_stop_symbols_for_custom_sections() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let custom = make_section(
        &mut ctx,
        b"my_custom_data",
        b"my_custom_data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC,
        0x20,
        8,
    );
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![custom, text];
    obj.elf_syms = vec![defined(b"main", 1, elf::STT_FUNC, 0, 8)];
    ctx.add_object(obj);

    compute_layout(&mut ctx).unwrap();

    let chunk = ctx.chunk(chunk_by_name(&ctx, b"my_custom_data"));
    let start = ctx.symbol_db.symbol(sym_id(&ctx, b"__start_my_custom_data"));
    let stop = ctx.symbol_db.symbol(sym_id(&ctx, b"__stop_my_custom_data"));
    assert_eq!(start.value, chunk.shdr.sh_addr);
    assert_eq!(stop.value, chunk.shdr.sh_addr + 0x20);
}

#[test]
fn clear_padding_zeroes_gaps() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);

    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        0x11,
        16,
    );
    let data = make_section(
        &mut ctx,
        b".data",
        b".data",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_WRITE,
        0x8,
        8,
    );
    obj.sections = vec![text, data];
    obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 4)];
    ctx.add_object(obj);

    let filesize = compute_layout(&mut ctx).unwrap();

    let mut buf = vec![0xaau8; filesize as usize];
    layout::clear_padding(&ctx, &mut buf, filesize);

    // Every byte outside a chunk's span is now zero.
    let mut covered = vec![false; filesize as usize];
    for id in &ctx.chunks {
        let shdr = &ctx.chunk(*id).shdr;
        if shdr.is_nobits() {
            continue;
        }
        for flag in covered
            .iter_mut()
            .skip(shdr.sh_offset as usize)
            .take(shdr.sh_size as usize)
        {
            *flag = true;
        }
    }
    for (byte, covered) in buf.iter().zip(&covered) {
        if !covered {
            assert_eq!(*byte, 0);
        }
    }
}

#[test]
fn compress_debug_sections_gabi_and_gnu() {
    for (format, expect_flag) in [
        (crate::args::CompressKind::Gabi, true),
        (crate::args::CompressKind::Gnu, false),
    ] {
        let herd = Herd::new();
        let mut args = Args::default();
        args.compress_debug_sections = format;
        let mut ctx = make_ctx(args, &herd);

        let mut obj = ObjectFile::new("a.o", None);
        let mut debug = make_section(
            &mut ctx,
            b".debug_info",
            b".debug_info",
            elf::SHT_PROGBITS,
            0,
            0x40,
            1,
        );
        debug.data = b"some not very compressible debug bytes".as_slice();
        // Section data shorter than sh_size is fine: the rest is padding.
        debug.shdr.sh_size = debug.data.len() as u64;
        let text = make_section(
            &mut ctx,
            b".text",
            b".text",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            8,
            1,
        );
        obj.sections = vec![debug, text];
        obj.elf_syms = vec![defined(b"main", 1, elf::STT_FUNC, 0, 8)];
        ctx.add_object(obj);

        compute_layout(&mut ctx).unwrap();

        let expected_name: &[u8] = if expect_flag {
            b".debug_info"
        } else {
            b".zdebug_info"
        };
        let id = chunk_by_name(&ctx, expected_name);
        let chunk = ctx.chunk(id);
        let compressed = chunk.shdr.sh_flags & u64::from(elf::SHF_COMPRESSED) != 0;
        assert_eq!(compressed, expect_flag);
        match &chunk.payload {
            crate::chunk::ChunkPayload::Compressed(section) => {
                assert_eq!(section.uncompressed_size, 38);
                assert!(!section.data.is_empty());
            }
            _ => panic!("debug chunk was not compressed"),
        }
    }
}

#[test]
fn chunk_kinds_are_assigned() {
    let herd = Herd::new();
    let mut ctx = make_ctx(Args::default(), &herd);
    let mut obj = ObjectFile::new("a.o", None);
    let text = make_section(
        &mut ctx,
        b".text",
        b".text",
        elf::SHT_PROGBITS,
        elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        8,
        1,
    );
    obj.sections = vec![text];
    obj.elf_syms = vec![defined(b"main", 0, elf::STT_FUNC, 0, 8)];
    ctx.add_object(obj);

    compute_layout(&mut ctx).unwrap();

    assert_eq!(ctx.chunk(ctx.ehdr.unwrap()).kind, ChunkKind::Header);
    assert_eq!(ctx.chunk(ctx.got.unwrap()).kind, ChunkKind::Synthetic);
    assert_eq!(
        ctx.chunk(chunk_by_name(&ctx, b".text")).kind,
        ChunkKind::Regular
    );

    // Section indexes are a contiguous run over the non-header chunks.
    let mut expected = 1;
    for id in &ctx.chunks {
        let chunk = ctx.chunk(*id);
        if chunk.kind == ChunkKind::Header {
            continue;
        }
        assert_eq!(chunk.shndx, expected);
        expected += 1;
    }
}
