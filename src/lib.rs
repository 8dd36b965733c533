//! The layout core of a parallel ELF linker. Takes parsed object files and shared objects with
//! known symbol tables and produces an in-memory description of the output: output sections
//! with their members in final order, assigned virtual addresses and file offsets, the
//! dynamic-linking auxiliary tables and the values of all linker-synthesized symbols. A
//! downstream writer serializes the description; an upstream parser populates the inputs.

pub mod alignment;
pub mod arch;
pub mod args;
pub mod chunk;
pub mod context;
pub mod dynamic;
pub mod elf;
pub mod error;
pub mod hash;
pub mod input_file;
pub mod layout;
pub mod merged_section;
pub mod resolution;
pub mod symbol;
pub mod symbol_db;
pub mod synthetic;
pub mod version_script;

#[cfg(test)]
mod pipeline_tests;

use crate::args::CetReport;
use crate::args::CompressKind;
use crate::context::Context;
use crate::error::Result;

/// Runs the pass pipeline over `ctx` and returns the size of the output file.
///
/// Each pass reads a well-defined slice of the context and writes another; later passes never
/// revisit decisions of earlier passes. Errors accumulate inside the context and surface at the
/// checkpoints, so related diagnostics arrive batched.
#[tracing::instrument(skip_all, name = "ComputeLayout")]
pub fn compute_layout(ctx: &mut Context<'_>) -> Result<u64> {
    resolution::apply_exclude_libs(ctx);
    synthetic::create_synthetic_sections(ctx);

    resolution::resolve_symbols(ctx);
    ctx.checkpoint()?;

    resolution::eliminate_comdats(ctx);
    resolution::convert_common_symbols(ctx);
    merged_section::compute_merged_section_sizes(ctx);

    layout::bin_sections(ctx);
    layout::sort_init_fini(ctx);
    layout::collect_output_sections(ctx);
    layout::compute_section_sizes(ctx);

    synthetic::create_internal_file(ctx);

    resolution::claim_unresolved_symbols(ctx);
    ctx.checkpoint()?;

    resolution::check_duplicate_symbols(ctx);
    ctx.checkpoint()?;

    if ctx.args.z_cet_report != CetReport::None {
        resolution::check_cet_errors(ctx);
        ctx.checkpoint()?;
    }

    version_script::apply_version_script(ctx);
    version_script::parse_symbol_version(ctx);
    ctx.checkpoint()?;

    // Import/export must be final before the relocation scan: canonical-PLT and COPYREL
    // decisions read it.
    dynamic::compute_import_export(ctx);
    dynamic::scan_relocations(ctx)?;

    layout::order_chunks(ctx);
    layout::update_synthetic_sizes(ctx);
    let filesize = layout::set_osec_offsets(ctx);
    layout::fix_synthetic_symbols(ctx);
    ctx.checkpoint()?;

    if ctx.args.compress_debug_sections != CompressKind::None {
        layout::compress_debug_sections(ctx);
    }

    Ok(filesize)
}
