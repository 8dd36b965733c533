//! Symbol resolution and the passes that depend directly on it: archive selection via liveness
//! propagation, COMDAT deduplication, common-symbol conversion, claiming of unresolved
//! references and the duplicate-definition check.

use crate::context::Context;
use crate::elf;
use crate::elf::DisplayName;
use crate::elf::InputSymbol;
use crate::elf::SectionHeader;
use crate::error::warning;
use crate::input_file::FileId;
use crate::input_file::InputSection;
use crate::input_file::ObjectFile;
use crate::input_file::SectionRef;
use crate::input_file::SharedFile;
use crate::layout::output_section_instance;
use crate::symbol::SymbolRank;
use crate::symbol::Visibility;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::anyhow;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use rayon::Scope;
use std::path::Path;
use std::sync::atomic::Ordering;

/// Marks archive members whose symbols must not be re-exported, per `--exclude-libs`.
#[tracing::instrument(skip_all)]
pub fn apply_exclude_libs(ctx: &mut Context<'_>) {
    if ctx.args.exclude_libs.is_empty() {
        return;
    }

    let all = ctx.args.exclude_libs.iter().any(|name| name == "ALL");
    let names: Vec<&str> = ctx.args.exclude_libs.iter().map(String::as_str).collect();

    for obj in &mut ctx.objs {
        let Some(archive) = obj.archive_name else {
            continue;
        };
        let basename = Path::new(archive)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if all || names.iter().any(|name| *name == basename) {
            obj.exclude_libs = true;
        }
    }
}

/// One candidate definition during registration.
struct Candidate {
    file: FileId,
    priority: u32,
    esym_index: u32,
    rank: SymbolRank,
    value: u64,
    sym_type: u8,
    visibility: Visibility,
    is_weak: bool,
    origin_section: Option<SectionRef>,
}

fn candidate_rank(esym: &InputSymbol<'_>, deferred: bool) -> Option<SymbolRank> {
    if esym.is_undefined() {
        return None;
    }
    if esym.is_common() {
        return Some(SymbolRank::Common);
    }
    Some(match (deferred, esym.is_weak()) {
        (false, false) => SymbolRank::StrongDefined,
        (false, true) => SymbolRank::WeakDefined,
        (true, false) => SymbolRank::DeferredStrong,
        (true, true) => SymbolRank::DeferredWeak,
    })
}

/// Applies `candidate` to `id` if it beats the current definition. The comparison key is
/// `(rank, owner priority, symbol index)`, which is stable, so registration order doesn't
/// matter.
fn register_candidate(
    db: &mut SymbolDb<'_>,
    current_priority: impl Fn(FileId) -> u32,
    id: SymbolId,
    candidate: Candidate,
) {
    let sym = db.symbol_mut(id);
    let candidate_key = (candidate.rank, candidate.priority, candidate.esym_index);
    let current_key = (
        sym.rank,
        sym.file.map(&current_priority).unwrap_or(u32::MAX),
        sym.esym_index,
    );
    if candidate_key >= current_key {
        return;
    }
    sym.file = Some(candidate.file);
    sym.esym_index = candidate.esym_index;
    sym.rank = candidate.rank;
    sym.value = candidate.value;
    sym.sym_type = candidate.sym_type;
    sym.visibility = candidate.visibility;
    sym.is_weak.store(candidate.is_weak, Ordering::Relaxed);
    sym.origin_section = candidate.origin_section;
    sym.shndx = 0;
}

fn register_object_symbols(ctx: &mut Context<'_>, file_index: usize, deferred: bool) {
    let Context {
        objs,
        dsos,
        symbol_db,
        ..
    } = ctx;
    let priority_of = |id: FileId| {
        if id.is_dso() {
            dsos[id.index()].priority
        } else {
            objs[id.index()].priority
        }
    };
    let obj = &objs[file_index];
    let fid = FileId::object(file_index);
    for (esym_index, esym, id) in obj.global_symbols() {
        let Some(rank) = candidate_rank(esym, deferred) else {
            continue;
        };
        register_candidate(
            symbol_db,
            priority_of,
            id,
            Candidate {
                file: fid,
                priority: obj.priority,
                esym_index: esym_index as u32,
                rank,
                value: esym.value,
                sym_type: esym.sym_type,
                visibility: esym.visibility,
                is_weak: esym.is_weak(),
                origin_section: esym
                    .section_index()
                    .map(|section| SectionRef { file: fid, section }),
            },
        );
    }
}

fn register_dso_symbols(ctx: &mut Context<'_>, file_index: usize) {
    let Context {
        objs,
        dsos,
        symbol_db,
        ..
    } = ctx;
    let priority_of = |id: FileId| {
        if id.is_dso() {
            dsos[id.index()].priority
        } else {
            objs[id.index()].priority
        }
    };
    let dso = &dsos[file_index];
    let fid = FileId::shared(file_index);
    for (esym_index, (esym, id)) in dso.elf_syms.iter().zip(&dso.symbols).enumerate() {
        if !esym.is_defined() || esym.visibility == Visibility::Hidden {
            continue;
        }
        let rank = if esym.is_weak() {
            SymbolRank::DeferredWeak
        } else {
            SymbolRank::DeferredStrong
        };
        register_candidate(
            symbol_db,
            priority_of,
            *id,
            Candidate {
                file: fid,
                priority: dso.priority,
                esym_index: esym_index as u32,
                rank,
                value: esym.value,
                sym_type: esym.sym_type,
                visibility: esym.visibility,
                is_weak: esym.is_weak(),
                origin_section: None,
            },
        );
    }
}

struct LivenessResources<'scope, 'data> {
    objs: &'scope [ObjectFile<'data>],
    dsos: &'scope [SharedFile<'data>],
    symbol_db: &'scope SymbolDb<'data>,
}

/// Walks the undefined strong references of a newly-live object. Any definition sitting in a
/// not-yet-live archive member pulls that member in; the `mark_alive` exchange guarantees each
/// file is enqueued exactly once.
fn mark_live_objects<'scope, 'data: 'scope>(
    res: &'scope LivenessResources<'scope, 'data>,
    file_index: usize,
    scope: &Scope<'scope>,
) {
    let obj = &res.objs[file_index];
    for (_, esym, id) in obj.global_symbols() {
        if !esym.is_undef_strong() {
            continue;
        }
        let Some(owner) = res.symbol_db.symbol(id).file else {
            continue;
        };
        if owner.is_dso() {
            continue;
        }
        let target = owner.index();
        if res.objs[target].mark_alive() {
            scope.spawn(move |scope| mark_live_objects(res, target, scope));
        }
    }
}

fn mark_live_dsos<'scope, 'data: 'scope>(
    res: &'scope LivenessResources<'scope, 'data>,
    file_index: usize,
    scope: &Scope<'scope>,
) {
    let dso = &res.dsos[file_index];
    for id in &dso.symbols {
        let Some(owner) = res.symbol_db.symbol(*id).file else {
            continue;
        };
        if !owner.is_dso() || owner.index() == file_index {
            continue;
        }
        let target = owner.index();
        if res.dsos[target].mark_alive() {
            scope.spawn(move |scope| mark_live_dsos(res, target, scope));
        }
    }
}

/// Binds every referenced name to exactly one defining file and computes the live file set.
///
/// Registration runs single-threaded in priority order; the rank key makes the outcome
/// order-independent anyway, and registration is memory-bound. Liveness propagation is the
/// parallel part.
#[tracing::instrument(skip_all)]
pub fn resolve_symbols(ctx: &mut Context<'_>) {
    // Register candidates: loaded objects with their regular ranks, archive members deferred,
    // then shared objects.
    for index in 0..ctx.objs.len() {
        let deferred = ctx.objs[index].is_in_lib;
        register_object_symbols(ctx, index, deferred);
    }
    for index in 0..ctx.dsos.len() {
        register_dso_symbols(ctx, index);
    }

    // Seed the live set: every non-archive object, plus any file defining a name listed in
    // --undefined or --require-defined.
    let mut initial: Vec<usize> = ctx
        .objs
        .iter()
        .enumerate()
        .filter(|(_, obj)| obj.is_alive())
        .map(|(index, _)| index)
        .collect();

    let forced: Vec<String> = ctx
        .args
        .undefined
        .iter()
        .chain(&ctx.args.require_defined)
        .cloned()
        .collect();
    for name in &forced {
        let Some(id) = ctx.symbol_db.lookup(name.as_bytes()) else {
            continue;
        };
        let Some(owner) = ctx.symbol_db.symbol(id).file else {
            continue;
        };
        if !owner.is_dso() && ctx.objs[owner.index()].mark_alive() {
            initial.push(owner.index());
        }
    }

    {
        let res = LivenessResources {
            objs: &ctx.objs,
            dsos: &ctx.dsos,
            symbol_db: &ctx.symbol_db,
        };
        rayon::in_place_scope(|scope| {
            let res = &res;
            initial.par_iter().for_each(|index| {
                mark_live_objects(res, *index, scope);
            });
        });
    }

    // Loaded archive members supply real definitions now; upgrade their deferred entries.
    for index in 0..ctx.objs.len() {
        if ctx.objs[index].is_in_lib && ctx.objs[index].is_alive() {
            register_object_symbols(ctx, index, false);
        }
    }

    // Reset symbols owned by archive members that never got pulled in. Shared objects are all
    // still unmarked at this point; their turn comes after DSO liveness below.
    reset_dead_object_symbols(ctx);

    // A shared object is live iff some live object makes a strong undefined reference to one of
    // its definitions. The weak bit clears under the symbol lock: a runtime definition is now
    // known to exist.
    {
        let objs = &ctx.objs;
        let dsos = &ctx.dsos;
        let symbol_db = &ctx.symbol_db;
        objs.par_iter().for_each(|obj| {
            if !obj.is_alive() {
                return;
            }
            for (_, esym, id) in obj.global_symbols() {
                if !esym.is_undef_strong() {
                    continue;
                }
                let sym = symbol_db.symbol(id);
                if let Some(owner) = sym.file {
                    if owner.is_dso() {
                        let _guard = sym.lock();
                        dsos[owner.index()].mark_alive();
                        sym.is_weak.store(false, Ordering::Relaxed);
                    }
                }
            }
        });
    }

    // And DSOs referenced by live DSOs are alive transitively.
    {
        let res = LivenessResources {
            objs: &ctx.objs,
            dsos: &ctx.dsos,
            symbol_db: &ctx.symbol_db,
        };
        let initial_dsos: Vec<usize> = ctx
            .dsos
            .iter()
            .enumerate()
            .filter(|(_, dso)| dso.is_alive())
            .map(|(index, _)| index)
            .collect();
        rayon::in_place_scope(|scope| {
            let res = &res;
            initial_dsos.par_iter().for_each(|index| {
                mark_live_dsos(res, *index, scope);
            });
        });
    }

    reset_dead_dso_symbols(ctx);

    if let Some(id) = ctx.symbol_db.lookup(b"__gnu_lto_slim") {
        if let Some(owner) = ctx.symbol_db.symbol(id).file {
            warning(format!(
                "{}: looks like this file contains GCC intermediate code, but LTO is not supported",
                display_file(ctx, owner)
            ));
            ctx.gcc_lto = true;
        }
    }
}

/// Re-initializes in place every symbol owned by a dead object file, so that IDs held by other
/// files observe the empty state rather than a definition that won't be emitted.
fn reset_dead_object_symbols(ctx: &mut Context<'_>) {
    let mut to_reset: Vec<SymbolId> = Vec::new();
    for (index, obj) in ctx.objs.iter().enumerate() {
        if obj.is_alive() {
            continue;
        }
        let fid = FileId::object(index);
        to_reset.extend(
            obj.symbols
                .iter()
                .filter(|id| ctx.symbol_db.symbol(**id).file == Some(fid)),
        );
    }
    for id in to_reset {
        ctx.symbol_db.symbol_mut(id).reset();
    }
}

fn reset_dead_dso_symbols(ctx: &mut Context<'_>) {
    let mut to_reset: Vec<SymbolId> = Vec::new();
    for (index, dso) in ctx.dsos.iter().enumerate() {
        if dso.is_alive() {
            continue;
        }
        let fid = FileId::shared(index);
        to_reset.extend(
            dso.symbols
                .iter()
                .filter(|id| ctx.symbol_db.symbol(**id).file == Some(fid)),
        );
    }
    for id in to_reset {
        ctx.symbol_db.symbol_mut(id).reset();
    }
}

pub fn display_file(ctx: &Context<'_>, id: FileId) -> String {
    if id.is_dso() {
        ctx.dso(id).to_string()
    } else {
        ctx.obj(id).to_string()
    }
}

/// Keeps one COMDAT group per key and deadens the member sections of every losing group.
#[tracing::instrument(skip_all)]
pub fn eliminate_comdats(ctx: &mut Context<'_>) {
    // Winner selection: first live file in priority order. Serial so the map is deterministic;
    // the expensive part is the killing below.
    let mut winners: hashbrown::HashMap<&[u8], FileId> = hashbrown::HashMap::new();
    for (fid, obj) in ctx.live_objects() {
        for group in &obj.comdat_groups {
            winners.entry(group.key).or_insert(fid);
        }
    }

    ctx.objs.par_iter().enumerate().for_each(|(index, obj)| {
        if !obj.is_alive() {
            return;
        }
        let fid = FileId::object(index);
        for group in &obj.comdat_groups {
            if winners.get(group.key) == Some(&fid) {
                continue;
            }
            for member in &group.members {
                obj.section(*member).kill();
            }
        }
    });
}

/// Materializes tentative definitions as real `.bss` contributions. Each surviving common
/// symbol becomes a NOBITS input section attached to the `.bss` output section.
#[tracing::instrument(skip_all)]
pub fn convert_common_symbols(ctx: &mut Context<'_>) {
    struct Conversion {
        file: FileId,
        sym: SymbolId,
        size: u64,
        align: u64,
    }

    let mut conversions = Vec::new();
    for (fid, obj) in ctx.live_objects() {
        for (_, esym, id) in obj.global_symbols() {
            if !esym.is_common() || ctx.symbol_db.symbol(id).file != Some(fid) {
                continue;
            }
            conversions.push(Conversion {
                file: fid,
                sym: id,
                size: esym.size,
                // Commons carry their alignment in the value field.
                align: esym.value.max(1),
            });
        }
    }

    if conversions.is_empty() {
        return;
    }

    let bss = output_section_instance(
        ctx,
        b".bss",
        elf::SHT_NOBITS,
        u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
    );

    for conversion in conversions {
        let shdr = SectionHeader {
            sh_type: elf::SHT_NOBITS,
            sh_flags: u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
            sh_size: conversion.size,
            sh_addralign: conversion.align,
            ..Default::default()
        };
        let obj = ctx.obj_mut(conversion.file);
        let section_index = u32::try_from(obj.sections.len()).expect("section count overflow");
        let mut section = InputSection::new(b".common", shdr, &[]);
        section.output_section = Some(bss);
        obj.sections.push(section);

        let sym = ctx.symbol_db.symbol_mut(conversion.sym);
        sym.origin_section = Some(SectionRef {
            file: conversion.file,
            section: section_index,
        });
        sym.value = 0;
    }
}

/// Deals with references that are still undefined: report per policy, then claim the symbol as
/// an absolute zero so downstream passes see a definition. Under dynamically-linked output a
/// default-visibility claim stays importable so the loader may still bind it.
#[tracing::instrument(skip_all)]
pub fn claim_unresolved_symbols(ctx: &mut Context<'_>) {
    let policy = ctx.args.unresolved_symbols;
    let dynamic = ctx.args.output_is_dynamic();

    struct Claim {
        file: FileId,
        sym: SymbolId,
        esym_index: u32,
        import: bool,
    }

    let mut claims = Vec::new();
    for (fid, obj) in ctx.live_objects() {
        for (esym_index, esym, id) in obj.global_symbols() {
            if !esym.is_undefined() {
                continue;
            }
            let sym = ctx.symbol_db.symbol(id);
            if sym.is_defined() {
                continue;
            }
            if sym.file.is_some() {
                // Already claimed by an earlier file.
                continue;
            }
            if !esym.is_weak() {
                match policy {
                    crate::args::UnresolvedPolicy::Error => ctx.record_error(anyhow!(
                        "undefined symbol: {}: {}",
                        obj,
                        DisplayName(esym.name)
                    )),
                    crate::args::UnresolvedPolicy::Warn => warning(format!(
                        "undefined symbol: {}: {}",
                        obj,
                        DisplayName(esym.name)
                    )),
                    crate::args::UnresolvedPolicy::Ignore => {}
                }
            }
            claims.push(Claim {
                file: fid,
                sym: id,
                esym_index: esym_index as u32,
                import: dynamic && esym.visibility == Visibility::Default,
            });
        }
    }

    for claim in claims {
        let sym = ctx.symbol_db.symbol_mut(claim.sym);
        if sym.file.is_some() {
            continue;
        }
        sym.file = Some(claim.file);
        sym.esym_index = claim.esym_index;
        sym.rank = SymbolRank::WeakDefined;
        sym.value = 0;
        sym.shndx = 0;
        sym.origin_section = None;
        sym.is_imported.store(claim.import, Ordering::Relaxed);
    }
}

/// Reports every name with two live strong definitions. Errors batch up; the caller
/// checkpoints.
#[tracing::instrument(skip_all)]
pub fn check_duplicate_symbols(ctx: &mut Context<'_>) {
    let internal = ctx.internal_file;
    let ctx = &*ctx;
    ctx.objs.par_iter().enumerate().for_each(|(index, obj)| {
        let fid = FileId::object(index);
        if !obj.is_alive() || Some(fid) == internal {
            return;
        }
        for (_, esym, id) in obj.global_symbols() {
            let sym = ctx.symbol_db.symbol(id);
            let Some(owner) = sym.file else {
                continue;
            };
            if owner == fid
                || Some(owner) == internal
                || esym.is_undefined()
                || esym.is_common()
                || esym.is_weak()
            {
                continue;
            }
            // A definition in a dead section lost a COMDAT round; that's not a duplicate.
            if let Some(section) = esym.section_index() {
                if !obj.section(section).is_alive() {
                    continue;
                }
            }
            ctx.record_error(anyhow!(
                "duplicate symbol: {obj}: {}: {}",
                display_file(ctx, owner),
                DisplayName(esym.name)
            ));
        }
    });
}

/// Verifies the CET properties of every object per `-z cet-report`.
#[tracing::instrument(skip_all)]
pub fn check_cet_errors(ctx: &Context<'_>) {
    let report_error = ctx.args.z_cet_report == crate::args::CetReport::Error;

    for (_, obj) in ctx.live_objects() {
        for (bit, what) in [
            (elf::feature::IBT, "GNU_PROPERTY_X86_FEATURE_1_IBT"),
            (elf::feature::SHSTK, "GNU_PROPERTY_X86_FEATURE_1_SHSTK"),
        ] {
            if obj.features & bit != 0 {
                continue;
            }
            if report_error {
                ctx.record_error(anyhow!("{obj}: -cet-report=error: missing {what}"));
            } else {
                warning(format!("{obj}: -cet-report=warning: missing {what}"));
            }
        }
    }
}
