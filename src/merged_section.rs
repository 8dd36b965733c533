//! Deduplicating sections for SHF_MERGE input. Fragments are interned at load time; this module
//! decides which fragments are live and where each one lands inside its output section.

use crate::chunk::Chunk;
use crate::chunk::ChunkId;
use crate::chunk::ChunkKind;
use crate::chunk::ChunkPayload;
use crate::context::Context;
use crate::elf;
use crate::elf::SectionHeader;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Points at one fragment of one merged section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub chunk: ChunkId,
    pub fragment: u32,
}

#[derive(Debug)]
pub struct SectionFragment<'data> {
    pub data: &'data [u8],
    pub p2align: u8,
    pub offset: u64,
    alive: AtomicBool,
}

impl SectionFragment<'_> {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct MergedSection<'data> {
    map: PassThroughHashMap<&'data [u8], u32>,
    pub fragments: Vec<SectionFragment<'data>>,
}

impl<'data> MergedSection<'data> {
    /// Interns `data`, returning the index of its fragment. Alignment requests accumulate: the
    /// fragment keeps the largest one seen.
    pub fn insert(&mut self, data: &'data [u8], hash: u64, p2align: u8) -> u32 {
        let key = PreHashed::new(data, hash);
        match self.map.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let index = *entry.get();
                let frag = &mut self.fragments[index as usize];
                frag.p2align = frag.p2align.max(p2align);
                index
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let index = u32::try_from(self.fragments.len()).expect("fragment count overflow");
                self.fragments.push(SectionFragment {
                    data,
                    p2align,
                    offset: 0,
                    alive: AtomicBool::new(false),
                });
                entry.insert(index);
                index
            }
        }
    }

    /// Lays out the live fragments. Hash-map iteration order is not deterministic, so fragments
    /// are processed sorted by contents.
    fn assign_offsets(&mut self) -> (u64, u64) {
        let mut order: Vec<usize> = (0..self.fragments.len())
            .filter(|i| self.fragments[*i].is_alive())
            .collect();
        order.sort_by_key(|i| self.fragments[*i].data);

        let mut offset: u64 = 0;
        let mut max_align = 1u64;
        for i in order {
            let frag = &mut self.fragments[i];
            let align = 1u64 << frag.p2align;
            offset = offset.next_multiple_of(align);
            frag.offset = offset;
            offset += frag.data.len() as u64;
            max_align = max_align.max(align);
        }
        (offset, max_align)
    }
}

/// Finds or creates the merged section with the given identity.
pub fn get_instance<'data>(
    ctx: &mut Context<'data>,
    name: &'data [u8],
    sh_type: u32,
    sh_flags: u64,
) -> ChunkId {
    let existing = ctx.merged_sections.iter().copied().find(|id| {
        let chunk = ctx.chunk(*id);
        chunk.name == name && chunk.shdr.sh_type == sh_type && chunk.shdr.sh_flags == sh_flags
    });
    existing.unwrap_or_else(|| {
        let shdr = SectionHeader {
            sh_type,
            sh_flags,
            sh_addralign: 1,
            ..Default::default()
        };
        let id = ctx.add_chunk(Chunk::new(
            name,
            ChunkKind::Regular,
            shdr,
            ChunkPayload::Merged(MergedSection::default()),
        ));
        ctx.merged_sections.push(id);
        id
    })
}

fn add_comment_string(ctx: &mut Context<'_>, text: String) {
    // The terminating NUL is part of the fragment so distinct strings stay distinct.
    let mut bytes = text.into_bytes();
    bytes.push(0);
    let data = ctx.save_bytes(&bytes);
    let id = get_instance(
        ctx,
        b".comment",
        elf::SHT_PROGBITS,
        u64::from(elf::SHF_MERGE | elf::SHF_STRINGS),
    );
    let hash = crate::hash::hash_bytes(data);
    let sec = ctx
        .chunk_mut(id)
        .merged_section_mut()
        .expect(".comment is a merged section");
    let frag = sec.insert(data, hash, 0);
    sec.fragments[frag as usize].mark_alive();
}

/// Marks live fragments, seeds `.comment` and assigns every live fragment its offset.
#[tracing::instrument(skip_all)]
pub fn compute_merged_section_sizes(ctx: &mut Context<'_>) {
    // Without section GC every fragment referenced by a live object survives. Under GC the
    // external marker has already set the liveness bits.
    if !ctx.args.gc_sections {
        let chunk_pool = &ctx.chunk_pool;
        ctx.objs.par_iter().for_each(|obj| {
            if !obj.is_alive() {
                return;
            }
            for fragment_ref in &obj.fragments {
                if let ChunkPayload::Merged(sec) = &chunk_pool[fragment_ref.chunk.as_usize()].payload
                {
                    sec.fragments[fragment_ref.fragment as usize].mark_alive();
                }
            }
        });
    }

    add_comment_string(ctx, format!("bold {}", env!("CARGO_PKG_VERSION")));

    if std::env::var("BOLD_DEBUG").is_ok_and(|v| !v.is_empty()) {
        let cmdline = ctx.args.cmdline.join(" ");
        add_comment_string(ctx, format!("bold command line: {cmdline}"));
    }

    ctx.chunk_pool.par_iter_mut().for_each(|chunk| {
        if let ChunkPayload::Merged(sec) = &mut chunk.payload {
            let (size, align) = sec.assign_offsets();
            chunk.shdr.sh_size = size;
            chunk.shdr.sh_addralign = align;
        }
    });
}
