use dashmap::DashMap;

use super::{Atom, AtomEncoding, TermBackend};
use crate::error::DecodeError;

/// Interns atoms decoded by one node, keyed by their wire bytes.
///
/// The same bytes always yield the same allocation, so equal atoms decoded
/// from different messages are `Atom::ptr_eq`. Latin-1 and UTF-8 spellings
/// live in separate tables since identical bytes may decode differently.
#[derive(Default)]
pub struct AtomCache {
    latin1: DashMap<Box<[u8]>, Atom>,
    utf8: DashMap<Box<[u8]>, Atom>,
}

impl AtomCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.latin1.len() + self.utf8.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every interned atom. Atoms already handed out stay valid.
    pub fn clear(&self) {
        self.latin1.clear();
        self.utf8.clear();
    }

    /// Forgets one entry; the next decode of these bytes allocates afresh.
    pub fn evict(&self, encoding: AtomEncoding, bytes: &[u8]) -> Option<Atom> {
        self.table(encoding).remove(bytes).map(|(_, atom)| atom)
    }

    fn table(&self, encoding: AtomEncoding) -> &DashMap<Box<[u8]>, Atom> {
        match encoding {
            AtomEncoding::Latin1 => &self.latin1,
            AtomEncoding::Utf8 => &self.utf8,
        }
    }
}

impl TermBackend for AtomCache {
    fn atom(&self, encoding: AtomEncoding, bytes: &[u8]) -> Result<Atom, DecodeError> {
        let table = self.table(encoding);
        if let Some(atom) = table.get(bytes) {
            return Ok(atom.value().clone());
        }
        let atom = Atom::from_wire(encoding, bytes)?;
        Ok(table.entry(bytes.into()).or_insert(atom).value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_lookups_share_allocation() {
        let cache = AtomCache::new();
        let a = cache.atom(AtomEncoding::Utf8, b"hello").unwrap();
        let b = cache.atom(AtomEncoding::Utf8, b"hello").unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_encodings_are_separate() {
        let cache = AtomCache::new();
        let latin = cache.atom(AtomEncoding::Latin1, &[0xe5]).unwrap();
        assert_eq!(latin.as_str(), "å");
        assert!(cache.atom(AtomEncoding::Utf8, &[0xe5]).is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_and_clear() {
        let cache = AtomCache::new();
        let first = cache.atom(AtomEncoding::Utf8, b"gone").unwrap();
        assert!(cache.evict(AtomEncoding::Utf8, b"gone").is_some());
        let second = cache.atom(AtomEncoding::Utf8, b"gone").unwrap();
        assert_eq!(first, second);
        assert!(!first.ptr_eq(&second));

        cache.clear();
        assert!(cache.is_empty());
    }
}
