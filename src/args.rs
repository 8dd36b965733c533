//! Pre-parsed configuration consumed by the passes. Command-line parsing happens upstream; what
//! arrives here is already split, deduplicated and validated for shape.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildIdKind {
    #[default]
    None,
    Uuid,
    Md5,
    Sha1,
    Hex(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CetReport {
    #[default]
    None,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressKind {
    #[default]
    None,
    Gabi,
    Gnu,
}

/// What to do with references that remain unresolved after archive selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    #[default]
    Error,
    Warn,
    Ignore,
}

/// The right-hand side of a `--defsym` assignment, already classified by the option parser.
#[derive(Debug, Clone)]
pub enum DefsymValue {
    Address(u64),
    Symbol(String),
}

/// One version-script pattern group. Literal names, shell-glob patterns and patterns to be matched
/// against the C++-demangled name all assign the same version index.
#[derive(Debug, Clone)]
pub struct VersionPattern {
    pub ver_idx: u16,
    pub patterns: Vec<String>,
    pub cpp_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Args {
    /// Archive basenames whose members' symbols must not be exported. The special entry "ALL"
    /// covers every archive.
    pub exclude_libs: Vec<String>,

    /// Symbols forced undefined (--undefined); definitions found in archives are pulled in.
    pub undefined: Vec<String>,

    /// Symbols that must be defined (--require-defined); same liveness effect as `undefined`.
    pub require_defined: Vec<String>,

    pub defsyms: Vec<(String, DefsymValue)>,

    pub version_patterns: Vec<VersionPattern>,
    pub version_definitions: Vec<String>,

    pub build_id: BuildIdKind,
    pub eh_frame_hdr: bool,
    pub hash_style_sysv: bool,
    pub hash_style_gnu: bool,
    pub dynamic_linker: Option<String>,
    pub repro: bool,
    pub gc_sections: bool,
    pub shared: bool,
    pub pic: bool,
    pub is_static: bool,
    pub bsymbolic: bool,
    pub bsymbolic_functions: bool,
    pub z_cet_report: CetReport,
    pub z_relro: bool,
    pub compress_debug_sections: CompressKind,
    pub unresolved_symbols: UnresolvedPolicy,

    pub image_base: u64,
    pub page_size: u64,

    /// The full command line, kept so that it can be embedded into `.comment` when requested.
    pub cmdline: Vec<String>,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            exclude_libs: Vec::new(),
            undefined: Vec::new(),
            require_defined: Vec::new(),
            defsyms: Vec::new(),
            version_patterns: Vec::new(),
            version_definitions: Vec::new(),
            build_id: BuildIdKind::None,
            eh_frame_hdr: false,
            hash_style_sysv: false,
            hash_style_gnu: true,
            dynamic_linker: None,
            repro: false,
            gc_sections: false,
            shared: false,
            pic: false,
            is_static: false,
            bsymbolic: false,
            bsymbolic_functions: false,
            z_cet_report: CetReport::None,
            z_relro: true,
            compress_debug_sections: CompressKind::None,
            unresolved_symbols: UnresolvedPolicy::Error,
            image_base: 0x200000,
            page_size: 0x1000,
            cmdline: Vec::new(),
        }
    }
}

impl Args {
    /// Whether the output is linked against a dynamic loader. Claimed-undefined symbols may only
    /// bind at runtime in that case.
    pub fn output_is_dynamic(&self) -> bool {
        self.shared || !self.is_static
    }
}
