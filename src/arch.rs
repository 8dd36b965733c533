//! Per-architecture capabilities. The passes are architecture-neutral; everything they need to
//! know about the target is exposed here as data.

use object::elf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    I386,
    AArch64,
}

/// Which section `_GLOBAL_OFFSET_TABLE_` anchors to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotAnchor {
    GotPlt,
    Got,
}

impl Architecture {
    pub fn e_machine(self) -> u16 {
        match self {
            Architecture::X86_64 => elf::EM_X86_64,
            Architecture::I386 => elf::EM_386,
            Architecture::AArch64 => elf::EM_AARCH64,
        }
    }

    pub fn is_64(self) -> bool {
        !matches!(self, Architecture::I386)
    }

    /// Whether relocation records are REL (no explicit addend) rather than RELA.
    pub fn is_rel(self) -> bool {
        matches!(self, Architecture::I386)
    }

    pub fn ptr_size(self) -> u64 {
        if self.is_64() { 8 } else { 4 }
    }

    /// Size of one relocation record in `.rela.dyn` / `.rel.dyn`.
    pub fn rel_entry_size(self) -> u64 {
        match self {
            Architecture::I386 => 8,
            Architecture::X86_64 | Architecture::AArch64 => 24,
        }
    }

    pub fn symtab_entry_size(self) -> u64 {
        if self.is_64() { 24 } else { 16 }
    }

    pub fn plt_header_size(self) -> u64 {
        match self {
            Architecture::X86_64 | Architecture::I386 => 16,
            Architecture::AArch64 => 32,
        }
    }

    pub fn plt_entry_size(self) -> u64 {
        16
    }

    pub fn pltgot_entry_size(self) -> u64 {
        match self {
            Architecture::X86_64 | Architecture::I386 => 8,
            Architecture::AArch64 => 16,
        }
    }

    pub fn got_anchor(self) -> GotAnchor {
        match self {
            Architecture::X86_64 | Architecture::I386 => GotAnchor::GotPlt,
            Architecture::AArch64 => GotAnchor::Got,
        }
    }

    pub fn default_page_size(self) -> u64 {
        match self {
            Architecture::X86_64 | Architecture::I386 => 0x1000,
            Architecture::AArch64 => 0x10000,
        }
    }

    pub fn rel_iplt_start_name(self) -> &'static [u8] {
        if self.is_rel() {
            b"__rel_iplt_start"
        } else {
            b"__rela_iplt_start"
        }
    }

    pub fn rel_iplt_end_name(self) -> &'static [u8] {
        if self.is_rel() {
            b"__rel_iplt_end"
        } else {
            b"__rela_iplt_end"
        }
    }
}
