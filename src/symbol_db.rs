//! The global symbol table: interns names to `SymbolId`s and owns the `Symbol` arena. Lookup is
//! read-concurrent; insertion happens only during registration, which is single-threaded.

use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::input_file::FileId;
use crate::symbol::Symbol;
use std::fmt::Display;

/// An ID for a symbol in the global table. IDs are never invalidated; a symbol whose owner died
/// reads as undefined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn from_usize(raw: usize) -> Self {
        SymbolId(u32::try_from(raw).expect("symbol IDs overflowed 32 bits"))
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Default)]
pub struct SymbolDb<'data> {
    symbols: Vec<Symbol<'data>>,
    name_to_id: PassThroughHashMap<&'data [u8], SymbolId>,
}

impl<'data> SymbolDb<'data> {
    /// Returns the ID for `name`, creating an empty symbol if the name hasn't been seen before.
    pub fn get_or_create(&mut self, name: &'data [u8]) -> SymbolId {
        let prehashed = PreHashed::from_bytes(name);
        let symbols = &mut self.symbols;
        *self.name_to_id.entry(prehashed).or_insert_with(|| {
            let id = SymbolId::from_usize(symbols.len());
            symbols.push(Symbol::new(name));
            id
        })
    }

    pub fn lookup(&self, name: &[u8]) -> Option<SymbolId> {
        self.name_to_id.get(&PreHashed::from_bytes(name)).copied()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol<'data> {
        &self.symbols[id.as_usize()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol<'data> {
        &mut self.symbols[id.as_usize()]
    }

    pub fn is_owner(&self, id: SymbolId, file: FileId) -> bool {
        self.symbol(id).file == Some(file)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol<'data>)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(raw, sym)| (SymbolId::from_usize(raw), sym))
    }
}
