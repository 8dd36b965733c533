//! Symbol versioning: applying pre-parsed version-script pattern groups and resolving
//! per-symbol `.symver` version requests when building a shared library.

use crate::context::Context;
use crate::elf;
use crate::input_file::FileId;
use anyhow::anyhow;
use foldhash::HashMap;
use foldhash::HashMapExt;
use glob::Pattern;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;
use symbolic_demangle::demangle;

fn has_glob_metachars(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Assigns version indices from the version-script pattern groups.
///
/// Literal names resolve with a direct lookup. Glob patterns and demangled patterns are matched
/// against every object's defined globals in parallel; later groups override earlier ones, so
/// the groups themselves run in order.
#[tracing::instrument(skip_all)]
pub fn apply_version_script(ctx: &mut Context<'_>) {
    let groups = ctx.args.version_patterns.clone();

    for group in &groups {
        let mut globs: Vec<Pattern> = Vec::new();
        for pattern in &group.patterns {
            if !has_glob_metachars(pattern) {
                if let Some(id) = ctx.symbol_db.lookup(pattern.as_bytes()) {
                    let sym = ctx.symbol_db.symbol(id);
                    if sym.file.is_some_and(|file| !file.is_dso()) {
                        sym.ver_idx.store(group.ver_idx, Ordering::Relaxed);
                    }
                }
                continue;
            }
            match Pattern::new(pattern) {
                Ok(glob) => globs.push(glob),
                Err(_) => ctx.record_error(anyhow!("invalid version pattern: {pattern}")),
            }
        }

        let mut cpp_globs: Vec<Pattern> = Vec::new();
        for pattern in &group.cpp_patterns {
            match Pattern::new(pattern) {
                Ok(glob) => cpp_globs.push(glob),
                Err(_) => ctx.record_error(anyhow!("invalid version pattern: {pattern}")),
            }
        }

        if globs.is_empty() && cpp_globs.is_empty() {
            continue;
        }

        let ctx = &*ctx;
        let globs = &globs;
        let cpp_globs = &cpp_globs;
        ctx.objs.par_iter().enumerate().for_each(|(index, obj)| {
            if !obj.is_alive() {
                return;
            }
            let fid = FileId::object(index);
            for (_, _, id) in obj.global_symbols() {
                let sym = ctx.symbol_db.symbol(id);
                if sym.file != Some(fid) {
                    continue;
                }
                let name = String::from_utf8_lossy(sym.name);

                if globs.iter().any(|glob| glob.matches(&name)) {
                    sym.ver_idx.store(group.ver_idx, Ordering::Relaxed);
                    continue;
                }

                if !cpp_globs.is_empty() {
                    let demangled = demangle(&name);
                    if cpp_globs.iter().any(|glob| glob.matches(&demangled)) {
                        sym.ver_idx.store(group.ver_idx, Ordering::Relaxed);
                    }
                }
            }
        });
    }
}

/// Resolves `.symver` requests against the version definition table. Only meaningful when the
/// output is a shared library. A leading `@` marks the default version; any other match is
/// hidden behind `VERSYM_HIDDEN`.
#[tracing::instrument(skip_all)]
pub fn parse_symbol_version(ctx: &mut Context<'_>) {
    if !ctx.args.shared {
        return;
    }

    let mut verdefs: HashMap<&str, u16> = HashMap::new();
    for (index, name) in ctx.args.version_definitions.iter().enumerate() {
        verdefs.insert(
            name.as_str(),
            u16::try_from(index).expect("too many version definitions")
                + elf::VER_NDX_LAST_RESERVED
                + 1,
        );
    }

    let ctx = &*ctx;
    let verdefs = &verdefs;
    ctx.objs.par_iter().enumerate().for_each(|(index, obj)| {
        if !obj.is_alive() {
            return;
        }
        let fid = FileId::object(index);
        for (offset, symver) in obj.symvers.iter().enumerate() {
            let Some(symver) = symver else {
                continue;
            };
            let id = obj.symbols[offset];
            let sym = ctx.symbol_db.symbol(id);
            if sym.file != Some(fid) {
                continue;
            }

            let (is_default, version) = match symver.strip_prefix('@') {
                Some(rest) => (true, rest),
                None => (false, *symver),
            };

            let Some(ver_idx) = verdefs.get(version) else {
                ctx.record_error(anyhow!(
                    "{obj}: symbol {} has undefined version {version}",
                    crate::elf::DisplayName(sym.name)
                ));
                continue;
            };

            let mut ver_idx = *ver_idx;
            if !is_default {
                ver_idx |= elf::VERSYM_HIDDEN;
            }
            sym.ver_idx.store(ver_idx, Ordering::Relaxed);
        }
    });
}
