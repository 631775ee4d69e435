//! Typed symbol tables for operation bases and names.
//!
//! The catalog is built once from configuration; after that every hot-path
//! lookup goes through dense integer IDs instead of string hashing.

use rustc_hash::FxHashMap;
use std::marker::PhantomData;

/// A dense index newtype that a [`SymbolTable`] hands out.
pub trait Symbol: Copy {
    fn from_index(index: u32) -> Self;
    fn index(self) -> u32;
}

/// Insertion-ordered table mapping names to `S`.
///
/// IDs are assigned 0, 1, 2, ... in first-seen order, so they double as
/// indices into parallel `Vec`s built alongside the table.
#[derive(Clone, Debug)]
pub struct SymbolTable<S> {
    by_name: FxHashMap<String, u32>,
    names: Vec<String>,
    _symbol: PhantomData<S>,
}

impl<S: Symbol> SymbolTable<S> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            by_name: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            names: Vec::with_capacity(capacity),
            _symbol: PhantomData,
        }
    }

    /// ID for `name`, allocating the next one on first sight.
    pub fn intern(&mut self, name: &str) -> S {
        if let Some(&index) = self.by_name.get(name) {
            return S::from_index(index);
        }
        let index = self.names.len() as u32;
        self.names.push(name.to_owned());
        self.by_name.insert(name.to_owned(), index);
        S::from_index(index)
    }

    #[inline]
    pub fn lookup(&self, name: &str) -> Option<S> {
        self.by_name.get(name).map(|&index| S::from_index(index))
    }

    #[inline]
    pub fn name_of(&self, symbol: S) -> Option<&str> {
        self.names.get(symbol.index() as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Tag(u32);

    impl Symbol for Tag {
        fn from_index(index: u32) -> Self {
            Tag(index)
        }
        fn index(self) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_first_seen_order_and_lookup() {
        let mut table: SymbolTable<Tag> = SymbolTable::with_capacity(4);

        let erase = table.intern("ERASE");
        let read = table.intern("READ");
        assert_eq!(table.intern("ERASE"), erase);
        assert_eq!((erase, read), (Tag(0), Tag(1)));
        assert_eq!(table.len(), 2);

        assert_eq!(table.name_of(read), Some("READ"));
        assert_eq!(table.lookup("PROGRAM_SLC"), None);
        assert_eq!(table.name_of(Tag(99)), None);
    }
}
