//! External term format: the [`Term`] model plus its codec.
//!
//! Decoding is built from `nom` parsers (see [`decode`]), encoding writes
//! straight into any [`std::io::Write`] (see [`encode`]). Atoms met while
//! decoding are resolved through a [`TermBackend`], normally the node's
//! [`AtomCache`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use malachite::Integer;

pub use atom_cache::AtomCache;
pub use decode::{decode, decode_prefix, decode_prefix_with, decode_with, DecodeLimits};
pub use encode::{encode, encode_compressed};

use crate::error::{DecodeError, TermError};

mod atom_cache;
mod bignum;
mod compress;
pub mod consts;
mod decode;
mod encode;

/// How the bytes of an atom were encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomEncoding {
    Latin1,
    Utf8,
}

/// Resolves raw atom bytes into [`Atom`]s while decoding.
pub trait TermBackend {
    fn atom(&self, encoding: AtomEncoding, bytes: &[u8]) -> Result<Atom, DecodeError>;
}

/// Backend that allocates a fresh atom every time.
pub struct Uncached;

impl TermBackend for Uncached {
    fn atom(&self, encoding: AtomEncoding, bytes: &[u8]) -> Result<Atom, DecodeError> {
        Atom::from_wire(encoding, bytes)
    }
}

#[derive(Clone)]
pub struct Atom(Arc<str>);

impl Atom {
    pub fn new(name: &str) -> Self {
        Atom(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when both atoms share one allocation, i.e. came out of the same
    /// cache slot.
    pub fn ptr_eq(&self, other: &Atom) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn from_wire(encoding: AtomEncoding, bytes: &[u8]) -> Result<Self, DecodeError> {
        match encoding {
            AtomEncoding::Latin1 => {
                let name: String = bytes.iter().map(|b| *b as char).collect();
                Ok(Atom(Arc::from(name)))
            }
            AtomEncoding::Utf8 => std::str::from_utf8(bytes)
                .map(Atom::new)
                .map_err(|e| DecodeError::invalid("atom", e.to_string())),
        }
    }

    fn needs_quotes(&self) -> bool {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {
                !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@')
            }
            _ => true,
        }
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Atom {}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Atom::new(name)
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:?}", self.as_str())
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.needs_quotes() {
            write!(f, "'{}'", self.0.replace('\'', "\\'"))
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Process identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pid {
    pub node: Atom,
    pub id: u32,
    pub serial: u32,
    pub creation: u32,
}

impl Pid {
    pub fn new(node: Atom, id: u32, serial: u32, creation: u32) -> Self {
        Pid {
            node,
            id,
            serial,
            creation,
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    pub node: Atom,
    pub id: u64,
    pub creation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub node: Atom,
    pub creation: u32,
    /// One to five id words; references created by this node carry three.
    pub ids: Vec<u32>,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#Ref<{}", self.node)?;
        for id in self.ids.iter().rev() {
            write!(f, ".{}", id)?;
        }
        f.write_str(">")
    }
}

/// Integer outside the `i64` range. Values that fit `i64` are always
/// represented as [`Term::Integer`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigInteger(Integer);

impl BigInteger {
    pub fn value(&self) -> &Integer {
        &self.0
    }
}

/// `f64` with bitwise equality so terms stay `Eq + Hash`.
#[derive(Debug, Clone, Copy)]
pub struct Float(pub f64);

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Float {}

impl Hash for Float {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fun {
    /// `NEW_FUN_EXT`
    Closure {
        arity: u8,
        uniq: [u8; 16],
        index: u32,
        module: Atom,
        old_index: u32,
        old_uniq: u32,
        pid: Pid,
        free_vars: Vec<Term>,
    },
    /// `FUN_EXT`, only produced by pre-OTP 23 nodes
    Legacy {
        pid: Pid,
        module: Atom,
        index: u32,
        uniq: u32,
        free_vars: Vec<Term>,
    },
    /// `EXPORT_EXT`, `fun Module:Function/Arity`
    Export {
        module: Atom,
        function: Atom,
        arity: u8,
    },
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Term {
    // Terminals
    Nil,
    Integer(i64),
    BigInteger(BigInteger),
    Float(Float),
    Atom(Atom),
    Binary(Vec<u8>),
    /// Bytes plus the number of bits used in the last byte (`1..=8`).
    BitBinary { data: Vec<u8>, bits: u8 },
    /// `STRING_EXT`: a list of small integers sent as bytes.
    ///
    /// Equality, hashing and map lookups follow the wire form: `[1,2,3]`
    /// received as `STRING_EXT` is not `==` to the same list built with
    /// [`Term::list`], nor does it find a map key of that form. Compare
    /// through [`Term::list_items`] when the form is not known.
    String(Vec<u8>),

    // Node containers
    Pid(Pid),
    Port(Port),
    Reference(Reference),
    Fun(Box<Fun>),

    // Compounds
    Tuple(Vec<Term>),
    Map(Vec<(Term, Term)>),
    /// Non-empty elements and the tail, `Nil` for proper lists.
    List(Vec<Term>, Box<Term>),
}

impl Term {
    pub fn atom(name: &str) -> Self {
        Term::Atom(Atom::new(name))
    }

    pub fn boolean(value: bool) -> Self {
        Term::atom(if value { "true" } else { "false" })
    }

    pub fn tuple(elements: Vec<Term>) -> Self {
        Term::Tuple(elements)
    }

    /// Proper list; an empty vector gives `Nil`.
    pub fn list(elements: Vec<Term>) -> Self {
        Term::improper_list(elements, Term::Nil)
    }

    pub fn improper_list(elements: Vec<Term>, tail: Term) -> Self {
        if elements.is_empty() {
            tail
        } else {
            Term::List(elements, Box::new(tail))
        }
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Term::Binary(bytes.into())
    }

    /// A charlist. The empty string is `Nil`, matching what Erlang sends.
    pub fn string(text: &str) -> Self {
        if text.is_empty() {
            Term::Nil
        } else {
            Term::String(text.as_bytes().to_vec())
        }
    }

    /// Bitstring of `data` where only `bits` bits of the last byte count.
    pub fn bit_binary(data: Vec<u8>, bits: u8) -> Result<Self, TermError> {
        if data.is_empty() || !(1..=8).contains(&bits) {
            return Err(TermError::BitCount(bits));
        }
        if bits == 8 {
            return Ok(Term::Binary(data));
        }
        Ok(Term::BitBinary { data, bits })
    }

    /// Map built from code; duplicate keys are rejected.
    pub fn try_map(pairs: impl IntoIterator<Item = (Term, Term)>) -> Result<Self, TermError> {
        let mut entries: Vec<(Term, Term)> = Vec::new();
        for (key, value) in pairs {
            if entries.iter().any(|(k, _)| *k == key) {
                return Err(TermError::DuplicateKey(key));
            }
            entries.push((key, value));
        }
        Ok(Term::Map(entries))
    }

    pub fn big_integer(value: Integer) -> Self {
        match i64::try_from(&value) {
            Ok(small) => Term::Integer(small),
            Err(_) => Term::BigInteger(BigInteger(value)),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Term::Nil)
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, Term::Atom(_))
    }

    pub fn is_pid(&self) -> bool {
        matches!(self, Term::Pid(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Term::Reference(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Term::Integer(_) | Term::BigInteger(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Term::Float(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Term::Tuple(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Term::Nil | Term::List(..) | Term::String(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Term::Map(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Term::Binary(_))
    }

    pub fn is_boolean(&self) -> bool {
        self.as_bool().is_some()
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Term::Integer(val) => Some(*val),
            _ => None,
        }
    }

    /// Any integer term as an arbitrary precision value.
    pub fn as_integer(&self) -> Option<Integer> {
        match self {
            Term::Integer(val) => Some(Integer::from(*val)),
            Term::BigInteger(big) => Some(big.0.clone()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Term::Float(val) => Some(val.0),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Term::Atom(atom) => Some(atom),
            _ => None,
        }
    }

    /// Atom text.
    pub fn as_str(&self) -> Option<&str> {
        self.as_atom().map(Atom::as_str)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.as_str() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<&Pid> {
        match self {
            Term::Pid(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Term::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Term::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Term, Term)]> {
        match self {
            Term::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Tuple or list elements, empty for every other term.
    pub fn elements(&self) -> &[Term] {
        match self {
            Term::Tuple(elements) | Term::List(elements, _) => elements,
            _ => &[],
        }
    }

    /// Tuple arity, zero for non-tuples.
    pub fn arity(&self) -> usize {
        self.as_tuple().map_or(0, <[Term]>::len)
    }

    /// Tuple element at `index`.
    pub fn element(&self, index: usize) -> Option<&Term> {
        self.as_tuple().and_then(|elements| elements.get(index))
    }

    pub fn map_get(&self, key: &Term) -> Option<&Term> {
        self.as_map()?
            .iter()
            .find_map(|(k, v)| if k == key { Some(v) } else { None })
    }

    /// Elements of a proper list, expanding `STRING_EXT` bytes into
    /// integers. `None` for improper lists and non-lists.
    pub fn list_items(&self) -> Option<Vec<Term>> {
        match self {
            Term::Nil => Some(Vec::new()),
            Term::String(bytes) => Some(bytes.iter().map(|b| Term::Integer(*b as i64)).collect()),
            Term::List(elements, tail) if tail.is_nil() => Some(elements.clone()),
            _ => None,
        }
    }

    /// Text of a charlist, a UTF-8 binary or an atom.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Term::Nil => Some(String::new()),
            Term::String(bytes) => Some(bytes.iter().map(|b| *b as char).collect()),
            Term::Binary(bytes) => String::from_utf8(bytes.clone()).ok(),
            Term::Atom(atom) => Some(atom.as_str().to_owned()),
            Term::List(..) => self
                .list_items()?
                .iter()
                .map(|t| t.as_i64().and_then(|c| u32::try_from(c).ok()).and_then(char::from_u32))
                .collect(),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Term::Nil => "nil",
            Term::Integer(_) | Term::BigInteger(_) => "integer",
            Term::Float(_) => "float",
            Term::Atom(_) => "atom",
            Term::Binary(_) => "binary",
            Term::BitBinary { .. } => "bitstring",
            Term::String(_) | Term::List(..) => "list",
            Term::Pid(_) => "pid",
            Term::Port(_) => "port",
            Term::Reference(_) => "reference",
            Term::Fun(_) => "fun",
            Term::Tuple(_) => "tuple",
            Term::Map(_) => "map",
        }
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Integer(value)
    }
}

impl From<i32> for Term {
    fn from(value: i32) -> Self {
        Term::Integer(value as i64)
    }
}

impl From<u32> for Term {
    fn from(value: u32) -> Self {
        Term::Integer(value as i64)
    }
}

impl From<u8> for Term {
    fn from(value: u8) -> Self {
        Term::Integer(value as i64)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term::big_integer(Integer::from(value))
    }
}

impl From<Integer> for Term {
    fn from(value: Integer) -> Self {
        Term::big_integer(value)
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::Float(Float(value))
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Term::boolean(value)
    }
}

impl From<Atom> for Term {
    fn from(atom: Atom) -> Self {
        Term::Atom(atom)
    }
}

impl From<Pid> for Term {
    fn from(pid: Pid) -> Self {
        Term::Pid(pid)
    }
}

impl From<Reference> for Term {
    fn from(reference: Reference) -> Self {
        Term::Reference(reference)
    }
}

impl From<Port> for Term {
    fn from(port: Port) -> Self {
        Term::Port(port)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn write_bytes(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", b)?;
    }
    Ok(())
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

/// Erlang source syntax.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Nil => f.write_str("[]"),
            Term::Integer(int) => write!(f, "{}", int),
            Term::BigInteger(big) => write!(f, "{}", big.0),
            Term::Float(flt) => write!(f, "{:?}", flt.0),
            Term::Atom(atom) => write!(f, "{}", atom),
            Term::Binary(bytes) => {
                f.write_str("<<")?;
                write_bytes(f, bytes)?;
                f.write_str(">>")
            }
            Term::BitBinary { data, bits } => {
                f.write_str("<<")?;
                if let Some((last, head)) = data.split_last() {
                    write_bytes(f, head)?;
                    if !head.is_empty() {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", last >> (8 - bits), bits)?;
                }
                f.write_str(">>")
            }
            Term::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Term::Pid(pid) => write!(f, "{}", pid),
            Term::Port(port) => write!(f, "#Port<{}.{}>", port.node, port.id),
            Term::Reference(reference) => write!(f, "{}", reference),
            Term::Fun(fun) => match &**fun {
                Fun::Closure {
                    module,
                    index,
                    arity,
                    ..
                } => write!(f, "#Fun<{}.{}.{}>", module, index, arity),
                Fun::Legacy { module, index, .. } => write!(f, "#Fun<{}.{}>", module, index),
                Fun::Export {
                    module,
                    function,
                    arity,
                } => write!(f, "fun {}:{}/{}", module, function, arity),
            },
            Term::Tuple(elements) => {
                f.write_str("{")?;
                write_seq(f, elements)?;
                f.write_str("}")
            }
            Term::Map(entries) => {
                f.write_str("#{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{} => {}", k, v)?;
                }
                f.write_str("}")
            }
            Term::List(elements, tail) => {
                f.write_str("[")?;
                write_seq(f, elements)?;
                if !tail.is_nil() {
                    write!(f, "|{}", tail)?;
                }
                f.write_str("]")
            }
        }
    }
}
