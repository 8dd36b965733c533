//! Population of the dynamic-linking auxiliary tables: import/export computation, relocation
//! scanning and the single-threaded allocation of GOT/PLT/COPYREL/dynsym slots.

use crate::chunk::GotEntryKind;
use crate::context::Context;
use crate::elf;
use crate::elf::DisplayName;
use crate::error::Result;
use crate::input_file::FileId;
use crate::input_file::InputReloc;
use crate::input_file::ObjectFile;
use crate::input_file::RelocKind;
use crate::symbol::SymbolFlags;
use crate::symbol::Visibility;
use crate::symbol_db::SymbolId;
use anyhow::anyhow;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use smallvec::SmallVec;
use std::sync::atomic::Ordering;

/// Finalizes every symbol's `is_imported` / `is_exported`.
///
/// For executables, anything a live shared object references gets exported so the runtime
/// linker can see it. Definitions owned by shared objects are imports; definitions owned by
/// objects are exports, and under `-shared` they are additionally imports (interposable)
/// unless protected visibility, `-Bsymbolic`, or `-Bsymbolic-functions` (for functions) pins
/// them.
#[tracing::instrument(skip_all)]
pub fn compute_import_export(ctx: &mut Context<'_>) {
    let ctx = &*ctx;

    if !ctx.args.shared {
        ctx.dsos.par_iter().for_each(|dso| {
            if !dso.is_alive() {
                return;
            }
            for id in &dso.symbols {
                let sym = ctx.symbol_db.symbol(*id);
                let Some(owner) = sym.file else {
                    continue;
                };
                if !owner.is_dso() && sym.visibility != Visibility::Hidden {
                    let _guard = sym.lock();
                    sym.is_exported.store(true, Ordering::Relaxed);
                }
            }
        });
    }

    ctx.objs.par_iter().enumerate().for_each(|(index, obj)| {
        if !obj.is_alive() {
            return;
        }
        let fid = FileId::object(index);
        for (_, _, id) in obj.global_symbols() {
            let sym = ctx.symbol_db.symbol(id);
            let Some(owner) = sym.file else {
                continue;
            };
            if sym.visibility == Visibility::Hidden || sym.ver_idx() == elf::VER_NDX_LOCAL {
                continue;
            }

            if owner != fid && owner.is_dso() {
                sym.is_imported.store(true, Ordering::Relaxed);
                continue;
            }

            if owner == fid {
                if obj.exclude_libs {
                    // --exclude-libs: definitions from marked archives never leave the output.
                    sym.ver_idx.store(elf::VER_NDX_LOCAL, Ordering::Relaxed);
                    continue;
                }

                sym.is_exported.store(true, Ordering::Relaxed);

                if ctx.args.shared
                    && sym.visibility != Visibility::Protected
                    && !ctx.args.bsymbolic
                    && !(ctx.args.bsymbolic_functions && sym.sym_type == elf::STT_FUNC)
                {
                    sym.is_imported.store(true, Ordering::Relaxed);
                }
            }
        }
    });
}

fn scan_reloc(ctx: &Context<'_>, obj: &ObjectFile<'_>, rel: &InputReloc) {
    let Some(id) = obj.symbol_id(rel.sym_index as usize) else {
        // References to locals resolve at link time; under PIC an absolute slot still needs a
        // RELATIVE dynamic relocation.
        if rel.kind == RelocKind::Absolute && ctx.args.pic {
            ctx.num_dynrel_relative.fetch_add(1, Ordering::Relaxed);
        }
        return;
    };

    let sym = ctx.symbol_db.symbol(id);
    let imported = sym.imported();
    let mut flags = SymbolFlags::empty();

    match rel.kind {
        RelocKind::PltCall => {
            if sym.is_ifunc() {
                flags |= SymbolFlags::NEEDS_PLT | SymbolFlags::NEEDS_GOT;
            } else if imported {
                flags |= SymbolFlags::NEEDS_PLT;
            }
        }
        RelocKind::Absolute => {
            if sym.is_ifunc() {
                flags |= SymbolFlags::NEEDS_GOT | SymbolFlags::NEEDS_PLT;
            } else if imported {
                if sym.is_func() {
                    // The canonical address of an imported function is its PLT entry.
                    flags |= SymbolFlags::NEEDS_PLT;
                } else if !ctx.args.pic {
                    flags |= SymbolFlags::NEEDS_COPYREL;
                } else {
                    ctx.num_dynrel_general.fetch_add(1, Ordering::Relaxed);
                }
            } else if ctx.args.pic {
                ctx.num_dynrel_relative.fetch_add(1, Ordering::Relaxed);
            }
        }
        RelocKind::PcRelative => {
            if imported {
                if sym.is_func() {
                    flags |= SymbolFlags::NEEDS_PLT;
                } else if !ctx.args.pic {
                    flags |= SymbolFlags::NEEDS_COPYREL;
                } else {
                    ctx.record_error(anyhow!(
                        "{obj}: relocation against symbol `{}` cannot be used when making a \
                         shared object; recompile with -fPIC",
                        DisplayName(sym.name)
                    ));
                }
            }
        }
        RelocKind::GotLoad => flags |= SymbolFlags::NEEDS_GOT,
        RelocKind::GotTpOff | RelocKind::TlsGd | RelocKind::TlsDesc | RelocKind::TlsLd => {
            if !sym.is_tls() {
                ctx.record_error(anyhow!(
                    "{obj}: TLS relocation against non-TLS symbol `{}`",
                    DisplayName(sym.name)
                ));
                return;
            }
            flags |= match rel.kind {
                RelocKind::GotTpOff => SymbolFlags::NEEDS_GOTTP,
                RelocKind::TlsGd => SymbolFlags::NEEDS_TLSGD,
                RelocKind::TlsDesc => SymbolFlags::NEEDS_TLSDESC,
                _ => SymbolFlags::NEEDS_TLSLD,
            };
        }
    }

    if !flags.is_empty() {
        sym.flags.fetch_or(flags);
    }
}

/// Walks all relocations, tagging referenced symbols with their requirements, then assigns
/// GOT/PLT/COPYREL/dynsym slots in one deterministic serial sweep.
#[tracing::instrument(skip_all)]
pub fn scan_relocations(ctx: &mut Context<'_>) -> Result {
    {
        let ctx = &*ctx;
        ctx.objs.par_iter().for_each(|obj| {
            if !obj.is_alive() {
                return;
            }
            for section in &obj.sections {
                if !section.is_alive() {
                    continue;
                }
                for rel in &section.relocs {
                    scan_reloc(ctx, obj, rel);
                }
            }
        });
    }

    // A bad relocation invalidates everything that follows, so flush before allocating.
    ctx.checkpoint()?;

    // Aggregate the dynamic symbols in a deterministic order: objects in input order, then
    // shared objects; within a file, symbol-table order. Owner filtering makes each symbol
    // appear exactly once.
    let mut dynamic_syms: Vec<SymbolId> = Vec::new();
    let mut collect = |syms: &mut Vec<SymbolId>, fid: FileId, ids: &[SymbolId]| {
        for id in ids {
            let sym = ctx.symbol_db.symbol(*id);
            if sym.file == Some(fid)
                && (!sym.flags.load().is_empty() || sym.imported() || sym.exported())
            {
                syms.push(*id);
            }
        }
    };
    for (fid, obj) in ctx.live_objects() {
        collect(&mut dynamic_syms, fid, &obj.symbols);
    }
    for (fid, dso) in ctx.live_dsos() {
        collect(&mut dynamic_syms, fid, &dso.symbols);
    }

    for id in dynamic_syms {
        allocate_slots(ctx, id);
        ctx.symbol_db.symbol(id).flags.clear();
    }

    Ok(())
}

fn allocate_slots(ctx: &mut Context<'_>, id: SymbolId) {
    ctx.add_aux(id);

    let sym = ctx.symbol_db.symbol(id);
    let flags = sym.flags.load();
    let imported = sym.imported();

    if imported || sym.exported() {
        ctx.add_dynsym(id);
    }

    if flags.contains(SymbolFlags::NEEDS_GOT) {
        ctx.add_got_entry(id, GotEntryKind::Address);
    }

    if flags.contains(SymbolFlags::NEEDS_PLT) {
        // A canonical PLT entry provides the function's address for pointer identity, which
        // only matters when a non-PIC executable imports the function.
        let is_canonical = !ctx.args.pic && imported;
        if is_canonical {
            ctx.symbol_db
                .symbol(id)
                .is_exported
                .store(true, Ordering::Relaxed);
            ctx.add_dynsym(id);
        }

        if flags.contains(SymbolFlags::NEEDS_GOT) && !is_canonical {
            // A combined .plt.got entry reuses the GOT slot. The canonical case can't: the
            // .plt.got stub and the .got slot would then refer to each other, which never
            // resolves at runtime.
            let aux_idx = ctx.add_aux(id) as usize;
            let pltgot = ctx.pltgot_section_mut();
            let index = u32::try_from(pltgot.symbols.len()).expect("pltgot overflow");
            pltgot.symbols.push(id);
            ctx.symbol_aux[aux_idx].pltgot_idx = Some(index);
        } else {
            let aux_idx = ctx.add_aux(id) as usize;
            let plt = ctx.plt_section_mut();
            let index = u32::try_from(plt.symbols.len()).expect("plt overflow");
            plt.symbols.push(id);
            ctx.symbol_aux[aux_idx].plt_idx = Some(index);
        }
    }

    if flags.contains(SymbolFlags::NEEDS_GOTTP) {
        ctx.add_got_entry(id, GotEntryKind::TpOff);
    }
    if flags.contains(SymbolFlags::NEEDS_TLSGD) {
        ctx.add_got_entry(id, GotEntryKind::TlsGd);
    }
    if flags.contains(SymbolFlags::NEEDS_TLSDESC) {
        ctx.add_got_entry(id, GotEntryKind::TlsDesc);
    }
    if flags.contains(SymbolFlags::NEEDS_TLSLD) {
        ctx.got_section_mut().add_tlsld();
    }

    if flags.contains(SymbolFlags::NEEDS_COPYREL) {
        allocate_copyrel(ctx, id);
    }
}

fn allocate_copyrel(ctx: &mut Context<'_>, id: SymbolId) {
    let sym = ctx.symbol_db.symbol(id);
    let Some(owner) = sym.file else {
        return;
    };
    if !owner.is_dso() {
        ctx.record_error(anyhow!(
            "cannot create a copy relocation for `{}`: not defined by a shared object",
            DisplayName(sym.name)
        ));
        return;
    }

    let dso = ctx.dso(owner);
    let esym = &dso.elf_syms[sym.esym_index as usize];
    let size = esym.size;
    let readonly = dso.is_readonly(sym.value);
    // Only names still resolved to this shared object travel along; an alias overridden by a
    // regular definition keeps that definition.
    let aliases: SmallVec<[SymbolId; 2]> = dso
        .find_aliases(&ctx.symbol_db, id)
        .into_iter()
        .filter(|alias| ctx.symbol_db.symbol(*alias).file == Some(owner))
        .collect();

    let offset = ctx.add_dynbss_symbol(id, readonly, size, 64);

    {
        let sym = ctx.symbol_db.symbol_mut(id);
        sym.value = offset;
        sym.has_copyrel = true;
        sym.copyrel_readonly = readonly;
        // A copied symbol is both the import source and the definition everyone else must see.
        sym.is_exported.store(true, Ordering::Relaxed);
    }
    ctx.add_dynsym(id);

    // Aliases at the same address in the shared object resolve to the copied bytes too, so
    // each gets its own dynsym entry pointing at the same offset.
    for alias in aliases {
        ctx.add_aux(alias);
        {
            let sym = ctx.symbol_db.symbol_mut(alias);
            sym.is_imported.store(true, Ordering::Relaxed);
            sym.is_exported.store(true, Ordering::Relaxed);
            sym.has_copyrel = true;
            sym.value = offset;
            sym.copyrel_readonly = readonly;
        }
        ctx.add_dynsym(alias);
    }
}
