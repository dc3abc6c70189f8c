use nom::{
    bytes::complete::take,
    multi::{count, length_count, length_data},
    number::complete::{be_f64, be_i32, be_u16, be_u32, be_u64, be_u8},
    sequence::tuple,
    IResult, Parser,
};
use std::cell::Cell;
use std::collections::HashMap;

use super::consts::{tag, VERSION_TAG};
use super::{bignum, compress, Atom, AtomEncoding, Float, Fun, Pid, Port, Reference, Term, TermBackend};
use crate::error::DecodeError;

type PResult<'a, T> = IResult<&'a [u8], T, DecodeError>;

/// Bounds applied to untrusted input while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Deepest container nesting accepted. The decoder recurses once per
    /// level.
    pub max_depth: usize,
    /// Total bytes all `COMPRESSED` terms in one decode may inflate to.
    pub max_inflated_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        DecodeLimits {
            max_depth: 128,
            max_inflated_len: 64 * 1024 * 1024,
        }
    }
}

struct Ctx<'b, B: ?Sized> {
    backend: &'b B,
    limits: DecodeLimits,
    inflated: Cell<usize>,
}

fn failure(err: DecodeError) -> nom::Err<DecodeError> {
    nom::Err::Failure(err)
}

/// Decodes one complete version-tagged term with default limits. Bytes
/// left over are an error.
pub fn decode<B: TermBackend + ?Sized>(input: &[u8], backend: &B) -> Result<Term, DecodeError> {
    decode_with(input, backend, &DecodeLimits::default())
}

pub fn decode_with<B: TermBackend + ?Sized>(
    input: &[u8],
    backend: &B,
    limits: &DecodeLimits,
) -> Result<Term, DecodeError> {
    let (term, rest) = decode_prefix_with(input, backend, limits)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(term)
}

/// Decodes one version-tagged term from the front of `input` and returns
/// the remaining bytes.
pub fn decode_prefix<'a, B: TermBackend + ?Sized>(
    input: &'a [u8],
    backend: &B,
) -> Result<(Term, &'a [u8]), DecodeError> {
    decode_prefix_with(input, backend, &DecodeLimits::default())
}

pub fn decode_prefix_with<'a, B: TermBackend + ?Sized>(
    input: &'a [u8],
    backend: &B,
    limits: &DecodeLimits,
) -> Result<(Term, &'a [u8]), DecodeError> {
    match input.first() {
        None => return Err(DecodeError::Truncated),
        Some(&VERSION_TAG) => {}
        Some(&other) => return Err(DecodeError::MissingVersion(other)),
    }
    let ctx = Ctx {
        backend,
        limits: *limits,
        inflated: Cell::new(0),
    };
    let (rest, term) = p_term(&input[1..], &ctx, 0)?;
    Ok((term, rest))
}

fn p_atom<'a, B: TermBackend + ?Sized>(
    input: &'a [u8],
    state: &Ctx<'_, B>,
    depth: usize,
    what: &'static str,
) -> PResult<'a, Atom> {
    match p_term(input, state, depth)? {
        (rest, Term::Atom(atom)) => Ok((rest, atom)),
        (_, other) => Err(failure(DecodeError::invalid(
            what,
            format!("expected atom, got {}", other.type_name()),
        ))),
    }
}

fn p_pid<'a, B: TermBackend + ?Sized>(input: &'a [u8], state: &Ctx<'_, B>, depth: usize) -> PResult<'a, Pid> {
    match p_term(input, state, depth)? {
        (rest, Term::Pid(pid)) => Ok((rest, pid)),
        (_, other) => Err(failure(DecodeError::invalid(
            "fun pid",
            format!("expected pid, got {}", other.type_name()),
        ))),
    }
}

fn p_u32_term<'a, B: TermBackend + ?Sized>(
    input: &'a [u8],
    state: &Ctx<'_, B>,
    depth: usize,
    what: &'static str,
) -> PResult<'a, u32> {
    let (rest, term) = p_term(input, state, depth)?;
    term.as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .map(|v| (rest, v))
        .ok_or_else(|| failure(DecodeError::invalid(what, format!("expected 32 bit integer, got {}", term))))
}

fn p_atom_bytes<'a, B: TermBackend + ?Sized>(
    input: &'a [u8],
    state: &Ctx<'_, B>,
    encoding: AtomEncoding,
    wide: bool,
) -> PResult<'a, Term> {
    let (rest, bytes) = if wide {
        length_data(be_u16).parse(input)?
    } else {
        length_data(be_u8).parse(input)?
    };
    let atom = state.backend.atom(encoding, bytes).map_err(failure)?;
    Ok((rest, Term::Atom(atom)))
}

fn old_float(bytes: &[u8]) -> Result<Term, DecodeError> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .ok()
        .and_then(|text| text.trim().parse::<f64>().ok())
        .map(|value| Term::Float(Float(value)))
        .ok_or_else(|| DecodeError::invalid("float", String::from_utf8_lossy(bytes).into_owned()))
}

fn big(sign: u8, digits: &[u8]) -> Result<Term, DecodeError> {
    let negative = match sign {
        0 => false,
        1 => true,
        other => return Err(DecodeError::invalid("bignum", format!("sign byte {}", other))),
    };
    let significant = digits.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
    let digits = &digits[..significant];
    if digits.len() <= 8 {
        let mut word = [0u8; 8];
        word[..digits.len()].copy_from_slice(digits);
        let magnitude = u64::from_le_bytes(word) as i128;
        let value = if negative { -magnitude } else { magnitude };
        if let Ok(small) = i64::try_from(value) {
            return Ok(Term::Integer(small));
        }
    }
    Ok(Term::big_integer(bignum::from_le_bytes(digits, negative)))
}

fn reference(node: Atom, creation: u32, ids: Vec<u32>) -> Result<Term, DecodeError> {
    if ids.is_empty() || ids.len() > 5 {
        return Err(DecodeError::invalid("reference", format!("{} id words", ids.len())));
    }
    Ok(Term::Reference(Reference { node, creation, ids }))
}

/// Parses one term without a version tag.
fn p_term<'a, B: TermBackend + ?Sized>(input: &'a [u8], state: &Ctx<'_, B>, depth: usize) -> PResult<'a, Term> {
    if depth > state.limits.max_depth {
        return Err(failure(DecodeError::invalid("term", "nesting too deep")));
    }
    let inner = depth + 1;
    let p = |i: &'a [u8]| p_term(i, state, inner);

    let (input, tag) = be_u8(input)?;
    match tag {
        tag::NIL_EXT => Ok((input, Term::Nil)),

        // Atoms
        tag::ATOM_EXT => p_atom_bytes(input, state, AtomEncoding::Latin1, true),
        tag::SMALL_ATOM_EXT => p_atom_bytes(input, state, AtomEncoding::Latin1, false),
        tag::ATOM_UTF8_EXT => p_atom_bytes(input, state, AtomEncoding::Utf8, true),
        tag::SMALL_ATOM_UTF8_EXT => p_atom_bytes(input, state, AtomEncoding::Utf8, false),

        // Terminal sequences
        tag::BINARY_EXT => length_data(be_u32)
            .map(|v: &[u8]| Term::Binary(v.to_vec()))
            .parse(input),
        tag::BIT_BINARY_EXT => {
            let (i, (len, bits)) = tuple((be_u32, be_u8)).parse(input)?;
            let (i, data) = take(len as usize)(i)?;
            let term = Term::bit_binary(data.to_vec(), bits)
                .map_err(|e| failure(DecodeError::invalid("bitstring", e.to_string())))?;
            Ok((i, term))
        }
        tag::STRING_EXT => length_data(be_u16)
            .map(|v: &[u8]| {
                if v.is_empty() {
                    Term::Nil
                } else {
                    Term::String(v.to_vec())
                }
            })
            .parse(input),

        // Numbers
        tag::SMALL_INTEGER_EXT => be_u8.map(|v| Term::Integer(v as i64)).parse(input),
        tag::INTEGER_EXT => be_i32.map(|v| Term::Integer(v as i64)).parse(input),
        tag::FLOAT_EXT => {
            let (i, text) = take(31usize)(input)?;
            Ok((i, old_float(text).map_err(failure)?))
        }
        tag::NEW_FLOAT_EXT => be_f64.map(|v| Term::Float(Float(v))).parse(input),
        tag::SMALL_BIG_EXT => {
            let (i, (n, sign)) = tuple((be_u8, be_u8)).parse(input)?;
            let (i, digits) = take(n as usize)(i)?;
            Ok((i, big(sign, digits).map_err(failure)?))
        }
        tag::LARGE_BIG_EXT => {
            let (i, (n, sign)) = tuple((be_u32, be_u8)).parse(input)?;
            let (i, digits) = take(n as usize)(i)?;
            Ok((i, big(sign, digits).map_err(failure)?))
        }

        // Node containers
        tag::PID_EXT => {
            let (i, node) = p_atom(input, state, inner, "pid node")?;
            tuple((be_u32, be_u32, be_u8))
                .map(|(id, serial, creation)| Term::Pid(Pid::new(node.clone(), id, serial, creation as u32)))
                .parse(i)
        }
        tag::NEW_PID_EXT => {
            let (i, node) = p_atom(input, state, inner, "pid node")?;
            tuple((be_u32, be_u32, be_u32))
                .map(|(id, serial, creation)| Term::Pid(Pid::new(node.clone(), id, serial, creation)))
                .parse(i)
        }
        tag::PORT_EXT => {
            let (i, node) = p_atom(input, state, inner, "port node")?;
            let (i, (id, creation)) = tuple((be_u32, be_u8)).parse(i)?;
            Ok((i, Term::Port(Port { node, id: id as u64, creation: creation as u32 })))
        }
        tag::NEW_PORT_EXT => {
            let (i, node) = p_atom(input, state, inner, "port node")?;
            let (i, (id, creation)) = tuple((be_u32, be_u32)).parse(i)?;
            Ok((i, Term::Port(Port { node, id: id as u64, creation })))
        }
        tag::V4_PORT_EXT => {
            let (i, node) = p_atom(input, state, inner, "port node")?;
            let (i, (id, creation)) = tuple((be_u64, be_u32)).parse(i)?;
            Ok((i, Term::Port(Port { node, id, creation })))
        }
        tag::REFERENCE_EXT => {
            let (i, node) = p_atom(input, state, inner, "reference node")?;
            let (i, (id, creation)) = tuple((be_u32, be_u8)).parse(i)?;
            Ok((i, reference(node, creation as u32, vec![id]).map_err(failure)?))
        }
        tag::NEW_REFERENCE_EXT => {
            let (i, len) = be_u16(input)?;
            let (i, node) = p_atom(i, state, inner, "reference node")?;
            let (i, creation) = be_u8(i)?;
            let (i, ids) = count(be_u32, len as usize)(i)?;
            Ok((i, reference(node, creation as u32, ids).map_err(failure)?))
        }
        tag::NEWER_REFERENCE_EXT => {
            let (i, len) = be_u16(input)?;
            let (i, node) = p_atom(i, state, inner, "reference node")?;
            let (i, creation) = be_u32(i)?;
            let (i, ids) = count(be_u32, len as usize)(i)?;
            Ok((i, reference(node, creation, ids).map_err(failure)?))
        }

        // Functions
        tag::NEW_FUN_EXT => {
            let (i, (size, arity, uniq, index, num_free)) =
                tuple((be_u32, be_u8, take(16usize), be_u32, be_u32)).parse(input)?;
            let (i, module) = p_atom(i, state, inner, "fun module")?;
            let (i, old_index) = p_u32_term(i, state, inner, "fun old index")?;
            let (i, old_uniq) = p_u32_term(i, state, inner, "fun old uniq")?;
            let (i, pid) = p_pid(i, state, inner)?;
            let (i, free_vars) = count(p, num_free as usize)(i)?;
            let used = input.len() - i.len();
            if used != size as usize {
                return Err(failure(DecodeError::invalid(
                    "fun",
                    format!("size field says {} bytes, body has {}", size, used),
                )));
            }
            let mut uniq_bytes = [0u8; 16];
            uniq_bytes.copy_from_slice(uniq);
            let fun = Fun::Closure {
                arity,
                uniq: uniq_bytes,
                index,
                module,
                old_index,
                old_uniq,
                pid,
                free_vars,
            };
            Ok((i, Term::Fun(Box::new(fun))))
        }
        tag::FUN_EXT => {
            let (i, num_free) = be_u32(input)?;
            let (i, pid) = p_pid(i, state, inner)?;
            let (i, module) = p_atom(i, state, inner, "fun module")?;
            let (i, index) = p_u32_term(i, state, inner, "fun index")?;
            let (i, uniq) = p_u32_term(i, state, inner, "fun uniq")?;
            let (i, free_vars) = count(p, num_free as usize)(i)?;
            let fun = Fun::Legacy {
                pid,
                module,
                index,
                uniq,
                free_vars,
            };
            Ok((i, Term::Fun(Box::new(fun))))
        }
        tag::EXPORT_EXT => {
            let (i, module) = p_atom(input, state, inner, "export module")?;
            let (i, function) = p_atom(i, state, inner, "export function")?;
            let (i, arity) = p_u32_term(i, state, inner, "export arity")?;
            let arity = u8::try_from(arity)
                .map_err(|_| failure(DecodeError::invalid("export arity", arity.to_string())))?;
            let fun = Fun::Export {
                module,
                function,
                arity,
            };
            Ok((i, Term::Fun(Box::new(fun))))
        }

        // Compounds
        tag::SMALL_TUPLE_EXT => length_count(be_u8, p).map(Term::Tuple).parse(input),
        tag::LARGE_TUPLE_EXT => length_count(be_u32, p).map(Term::Tuple).parse(input),
        tag::MAP_EXT => {
            // Duplicate keys keep their first position and their last value.
            let (mut i, n) = be_u32(input)?;
            let mut entries: Vec<(Term, Term)> = Vec::new();
            let mut positions: HashMap<Term, usize> = HashMap::new();
            for _ in 0..n {
                let (rest, key) = p_term(i, state, inner)?;
                let (rest, value) = p_term(rest, state, inner)?;
                i = rest;
                match positions.get(&key) {
                    Some(&pos) => entries[pos].1 = value,
                    None => {
                        positions.insert(key.clone(), entries.len());
                        entries.push((key, value));
                    }
                }
            }
            Ok((i, Term::Map(entries)))
        }
        tag::LIST_EXT => tuple((length_count(be_u32, p), p))
            .map(|(elements, tail)| Term::improper_list(elements, tail))
            .parse(input),

        tag::COMPRESSED => {
            let (i, size) = be_u32(input)?;
            let total = state.inflated.get().saturating_add(size as usize);
            if total > state.limits.max_inflated_len {
                return Err(failure(DecodeError::invalid(
                    "compressed term",
                    format!("inflates past the {} byte limit", state.limits.max_inflated_len),
                )));
            }
            state.inflated.set(total);
            let (inflated, used) = compress::inflate(i, size as usize).map_err(failure)?;
            let (rest, term) = p_term(&inflated, state, depth)?;
            if !rest.is_empty() {
                return Err(failure(DecodeError::TrailingBytes(rest.len())));
            }
            Ok((&i[used..], term))
        }

        other => Err(failure(DecodeError::UnknownTag(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etf::Uncached;

    fn dec(bytes: &[u8]) -> Result<Term, DecodeError> {
        decode(bytes, &Uncached)
    }

    #[test]
    fn test_simple_terms() {
        assert_eq!(dec(&[131, 97, 42]), Ok(Term::Integer(42)));
        assert_eq!(dec(&[131, 98, 255, 255, 255, 255]), Ok(Term::Integer(-1)));
        assert_eq!(dec(&[131, 106]), Ok(Term::Nil));
        assert_eq!(dec(&[131, 119, 2, b'o', b'k']), Ok(Term::atom("ok")));
        assert_eq!(dec(&[131, 100, 0, 2, b'o', b'k']), Ok(Term::atom("ok")));
        assert_eq!(
            dec(&[131, 107, 0, 3, 1, 2, 3]),
            Ok(Term::String(vec![1, 2, 3]))
        );
    }

    #[test]
    fn test_version_and_trailing() {
        assert_eq!(dec(&[]), Err(DecodeError::Truncated));
        assert_eq!(dec(&[130, 106]), Err(DecodeError::MissingVersion(130)));
        assert_eq!(dec(&[131, 106, 106]), Err(DecodeError::TrailingBytes(1)));
        let (term, rest) = decode_prefix(&[131, 106, 106], &Uncached).unwrap();
        assert_eq!(term, Term::Nil);
        assert_eq!(rest, &[106]);
    }

    #[test]
    fn test_unknown_tag_and_truncation() {
        assert_eq!(dec(&[131, 1]), Err(DecodeError::UnknownTag(1)));
        assert_eq!(dec(&[131, 109, 0, 0, 0, 5, 1, 2]), Err(DecodeError::Truncated));
        assert_eq!(dec(&[131, 98, 0, 0]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_bignums_normalize_into_i64() {
        // 2^32 as SMALL_BIG
        assert_eq!(
            dec(&[131, 110, 5, 0, 0, 0, 0, 0, 1]),
            Ok(Term::Integer(1 << 32))
        );
        // i64::MIN fits exactly
        assert_eq!(
            dec(&[131, 110, 8, 1, 0, 0, 0, 0, 0, 0, 0, 0x80]),
            Ok(Term::Integer(i64::MIN))
        );
        // 2^64 does not
        let term = dec(&[131, 110, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap();
        assert_eq!(term.to_string(), "18446744073709551616");
        assert!(matches!(
            dec(&[131, 110, 1, 2, 1]),
            Err(DecodeError::Invalid { what: "bignum", .. })
        ));
    }

    #[test]
    fn test_old_float() {
        let mut bytes = vec![131, 99];
        let mut text = b"1.50000000000000000000e+00".to_vec();
        text.resize(31, 0);
        bytes.extend_from_slice(&text);
        assert_eq!(dec(&bytes), Ok(Term::from(1.5)));
    }

    #[test]
    fn test_map_duplicate_keys_last_value_wins() {
        let bytes = [
            131, 116, 0, 0, 0, 3, // three pairs
            119, 1, b'a', 97, 1, //
            119, 1, b'b', 97, 2, //
            119, 1, b'a', 97, 3,
        ];
        assert_eq!(
            dec(&bytes),
            Ok(Term::Map(vec![
                (Term::atom("a"), Term::Integer(3)),
                (Term::atom("b"), Term::Integer(2)),
            ]))
        );
    }

    #[test]
    fn test_improper_list_and_pid() {
        let bytes = [131, 108, 0, 0, 0, 1, 97, 1, 97, 2];
        assert_eq!(
            dec(&bytes),
            Ok(Term::improper_list(vec![Term::Integer(1)], Term::Integer(2)))
        );

        let bytes = [
            131, 88, 119, 3, b'a', b'@', b'b', 0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 0, 9,
        ];
        assert_eq!(
            dec(&bytes),
            Ok(Term::Pid(Pid::new(Atom::new("a@b"), 7, 1, 9)))
        );
    }

    #[test]
    fn test_pid_node_must_be_atom() {
        let bytes = [131, 88, 97, 1, 0, 0, 0, 7, 0, 0, 0, 1, 0, 0, 0, 9];
        assert!(matches!(
            dec(&bytes),
            Err(DecodeError::Invalid { what: "pid node", .. })
        ));
    }

    #[test]
    fn test_bit_binary_bits_validated() {
        assert!(dec(&[131, 77, 0, 0, 0, 1, 0, 0xff]).is_err());
        assert_eq!(
            dec(&[131, 77, 0, 0, 0, 1, 3, 0xe0]),
            Ok(Term::BitBinary {
                data: vec![0xe0],
                bits: 3
            })
        );
    }

    #[test]
    fn test_compressed_term() {
        let inner = [104, 2, 97, 1, 97, 2]; // {1,2}
        let stream = compress::deflate(&inner, 6).unwrap();
        let mut bytes = vec![131, 80, 0, 0, 0, inner.len() as u8];
        bytes.extend_from_slice(&stream);
        assert_eq!(
            dec(&bytes),
            Ok(Term::tuple(vec![Term::Integer(1), Term::Integer(2)]))
        );

        bytes[5] = 9;
        assert!(matches!(dec(&bytes), Err(DecodeError::CompressedSize { .. })));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut bytes = vec![131];
        for _ in 0..100_000 {
            bytes.extend_from_slice(&[tag::SMALL_TUPLE_EXT, 1]);
        }
        bytes.push(tag::NIL_EXT);
        assert_eq!(dec(&bytes), Err(DecodeError::invalid("term", "nesting too deep")));

        let mut list = vec![131];
        for _ in 0..100_000 {
            list.extend_from_slice(&[tag::LIST_EXT, 0, 0, 0, 0]);
        }
        list.push(tag::NIL_EXT);
        assert!(dec(&list).is_err());
    }

    #[test]
    fn test_depth_limit_is_configurable() {
        // {{{}}}: three levels
        let bytes = [131, 104, 1, 104, 1, 104, 0];
        let shallow = DecodeLimits {
            max_depth: 1,
            ..DecodeLimits::default()
        };
        assert!(decode_with(&bytes, &Uncached, &shallow).is_err());
        let enough = DecodeLimits {
            max_depth: 2,
            ..DecodeLimits::default()
        };
        assert_eq!(
            decode_with(&bytes, &Uncached, &enough),
            Ok(Term::tuple(vec![Term::tuple(vec![Term::tuple(vec![])])]))
        );
    }

    #[test]
    fn test_compressed_size_above_limit_is_rejected_before_inflating() {
        let inner = [tag::SMALL_INTEGER_EXT, 1];
        let stream = compress::deflate(&inner, 6).unwrap();
        let mut bytes = vec![131, tag::COMPRESSED];
        bytes.extend_from_slice(&(300u32 << 20).to_be_bytes());
        bytes.extend_from_slice(&stream);
        assert!(matches!(
            dec(&bytes),
            Err(DecodeError::Invalid { what: "compressed term", .. })
        ));
    }

    #[test]
    fn test_inflation_budget_covers_the_whole_term() {
        let inner = [tag::SMALL_INTEGER_EXT, 1];
        let stream = compress::deflate(&inner, 6).unwrap();
        let mut compressed = vec![tag::COMPRESSED, 0, 0, 0, 2];
        compressed.extend_from_slice(&stream);

        let mut bytes = vec![131, tag::SMALL_TUPLE_EXT, 2];
        bytes.extend_from_slice(&compressed);
        bytes.extend_from_slice(&compressed);

        let limits = DecodeLimits {
            max_inflated_len: 4,
            ..DecodeLimits::default()
        };
        assert_eq!(
            decode_with(&bytes, &Uncached, &limits),
            Ok(Term::tuple(vec![Term::Integer(1), Term::Integer(1)]))
        );
        let limits = DecodeLimits {
            max_inflated_len: 3,
            ..DecodeLimits::default()
        };
        assert!(matches!(
            decode_with(&bytes, &Uncached, &limits),
            Err(DecodeError::Invalid { what: "compressed term", .. })
        ));
    }

    #[test]
    fn test_export_fun() {
        let bytes = [
            131, 113, 119, 6, b'e', b'r', b'l', b'a', b'n', b'g', 119, 4, b's', b'e', b'l', b'f', 97, 0,
        ];
        assert_eq!(
            dec(&bytes).unwrap().to_string(),
            "fun erlang:self/0"
        );
    }
}
