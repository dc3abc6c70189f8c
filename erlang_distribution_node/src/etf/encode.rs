use byteorder::{BigEndian, WriteBytesExt as _};
use std::io::{self, Write};

use super::consts::{tag, VERSION_TAG};
use super::{bignum, compress, Atom, Fun, Pid, Term};

/// Encodes `term` behind the version tag.
pub fn encode(term: &Term) -> io::Result<Vec<u8>> {
    let mut out = vec![VERSION_TAG];
    term.write(&mut out)?;
    Ok(out)
}

/// Like [`encode`], but wraps the term in a `COMPRESSED` envelope when that
/// comes out smaller.
pub fn encode_compressed(term: &Term, level: u32) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    term.write(&mut body)?;
    let packed = compress::deflate(&body, level)?;

    let mut out = Vec::with_capacity(body.len().min(packed.len() + 5) + 1);
    out.write_u8(VERSION_TAG)?;
    if packed.len() + 5 < body.len() {
        out.write_u8(tag::COMPRESSED)?;
        out.write_u32::<BigEndian>(body.len() as u32)?;
        out.write_all(&packed)?;
    } else {
        out.write_all(&body)?;
    }
    Ok(out)
}

fn too_long(what: &str, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} of length {} cannot be encoded", what, len),
    )
}

fn write_atom(w: &mut impl Write, atom: &Atom) -> io::Result<()> {
    let bytes = atom.as_str().as_bytes();
    if bytes.len() <= 255 {
        w.write_u8(tag::SMALL_ATOM_UTF8_EXT)?;
        w.write_u8(bytes.len() as u8)?;
    } else {
        let len = u16::try_from(bytes.len()).map_err(|_| too_long("atom", bytes.len()))?;
        w.write_u8(tag::ATOM_UTF8_EXT)?;
        w.write_u16::<BigEndian>(len)?;
    }
    w.write_all(bytes)
}

fn write_pid(w: &mut impl Write, pid: &Pid) -> io::Result<()> {
    w.write_u8(tag::NEW_PID_EXT)?;
    write_atom(w, &pid.node)?;
    w.write_u32::<BigEndian>(pid.id)?;
    w.write_u32::<BigEndian>(pid.serial)?;
    w.write_u32::<BigEndian>(pid.creation)
}

fn write_big(w: &mut impl Write, magnitude: &[u8], negative: bool) -> io::Result<()> {
    if magnitude.len() <= 255 {
        w.write_u8(tag::SMALL_BIG_EXT)?;
        w.write_u8(magnitude.len() as u8)?;
    } else {
        w.write_u8(tag::LARGE_BIG_EXT)?;
        w.write_u32::<BigEndian>(magnitude.len() as u32)?;
    }
    w.write_u8(negative as u8)?;
    w.write_all(magnitude)
}

fn write_elements(w: &mut impl Write, elements: &[Term]) -> io::Result<()> {
    for elem in elements {
        elem.write(w)?;
    }
    Ok(())
}

impl Term {
    /// Writes the tag and payload of this term, without a version tag.
    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Term::Nil => w.write_u8(tag::NIL_EXT)?,
            Term::Integer(num) => {
                if (0..=255).contains(num) {
                    w.write_u8(tag::SMALL_INTEGER_EXT)?;
                    w.write_u8(*num as u8)?;
                } else if let Ok(word) = i32::try_from(*num) {
                    w.write_u8(tag::INTEGER_EXT)?;
                    w.write_i32::<BigEndian>(word)?;
                } else {
                    let bytes = num.unsigned_abs().to_le_bytes();
                    let len = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                    write_big(w, &bytes[..len], *num < 0)?;
                }
            }
            Term::BigInteger(big) => {
                let (magnitude, negative) = bignum::to_le_bytes(big.value());
                write_big(w, &magnitude, negative)?;
            }
            Term::Float(num) => {
                w.write_u8(tag::NEW_FLOAT_EXT)?;
                w.write_f64::<BigEndian>(num.0)?;
            }
            Term::Atom(atom) => write_atom(w, atom)?,
            Term::Binary(vec) | Term::BitBinary { data: vec, bits: 8 } => {
                w.write_u8(tag::BINARY_EXT)?;
                w.write_u32::<BigEndian>(vec.len() as u32)?;
                w.write_all(vec)?;
            }
            Term::BitBinary { data, bits } => {
                w.write_u8(tag::BIT_BINARY_EXT)?;
                w.write_u32::<BigEndian>(data.len() as u32)?;
                w.write_u8(*bits)?;
                w.write_all(data)?;
            }
            Term::String(vec) => {
                if vec.is_empty() {
                    w.write_u8(tag::NIL_EXT)?;
                } else if vec.len() <= u16::MAX as usize {
                    w.write_u8(tag::STRING_EXT)?;
                    w.write_u16::<BigEndian>(vec.len() as u16)?;
                    w.write_all(vec)?;
                } else {
                    w.write_u8(tag::LIST_EXT)?;
                    w.write_u32::<BigEndian>(vec.len() as u32)?;
                    for byte in vec {
                        w.write_u8(tag::SMALL_INTEGER_EXT)?;
                        w.write_u8(*byte)?;
                    }
                    w.write_u8(tag::NIL_EXT)?;
                }
            }
            Term::Pid(pid) => write_pid(w, pid)?,
            Term::Port(port) => {
                // Ids above 28 bits need the v4 layout.
                if port.id > 0x0fff_ffff {
                    w.write_u8(tag::V4_PORT_EXT)?;
                    write_atom(w, &port.node)?;
                    w.write_u64::<BigEndian>(port.id)?;
                } else {
                    w.write_u8(tag::NEW_PORT_EXT)?;
                    write_atom(w, &port.node)?;
                    w.write_u32::<BigEndian>(port.id as u32)?;
                }
                w.write_u32::<BigEndian>(port.creation)?;
            }
            Term::Reference(reference) => {
                w.write_u8(tag::NEWER_REFERENCE_EXT)?;
                w.write_u16::<BigEndian>(reference.ids.len() as u16)?;
                write_atom(w, &reference.node)?;
                w.write_u32::<BigEndian>(reference.creation)?;
                for id in &reference.ids {
                    w.write_u32::<BigEndian>(*id)?;
                }
            }
            Term::Fun(fun) => match &**fun {
                Fun::Closure {
                    arity,
                    uniq,
                    index,
                    module,
                    old_index,
                    old_uniq,
                    pid,
                    free_vars,
                } => {
                    let mut body = Vec::new();
                    body.write_u8(*arity)?;
                    body.write_all(uniq)?;
                    body.write_u32::<BigEndian>(*index)?;
                    body.write_u32::<BigEndian>(free_vars.len() as u32)?;
                    write_atom(&mut body, module)?;
                    Term::from(*old_index).write(&mut body)?;
                    Term::from(*old_uniq).write(&mut body)?;
                    write_pid(&mut body, pid)?;
                    write_elements(&mut body, free_vars)?;

                    // The size field counts itself.
                    w.write_u8(tag::NEW_FUN_EXT)?;
                    w.write_u32::<BigEndian>(body.len() as u32 + 4)?;
                    w.write_all(&body)?;
                }
                Fun::Legacy {
                    pid,
                    module,
                    index,
                    uniq,
                    free_vars,
                } => {
                    w.write_u8(tag::FUN_EXT)?;
                    w.write_u32::<BigEndian>(free_vars.len() as u32)?;
                    write_pid(w, pid)?;
                    write_atom(w, module)?;
                    Term::from(*index).write(w)?;
                    Term::from(*uniq).write(w)?;
                    write_elements(w, free_vars)?;
                }
                Fun::Export {
                    module,
                    function,
                    arity,
                } => {
                    w.write_u8(tag::EXPORT_EXT)?;
                    write_atom(w, module)?;
                    write_atom(w, function)?;
                    w.write_u8(tag::SMALL_INTEGER_EXT)?;
                    w.write_u8(*arity)?;
                }
            },
            Term::Tuple(vec) => {
                if vec.len() <= 255 {
                    w.write_u8(tag::SMALL_TUPLE_EXT)?;
                    w.write_u8(vec.len() as u8)?;
                } else {
                    w.write_u8(tag::LARGE_TUPLE_EXT)?;
                    w.write_u32::<BigEndian>(vec.len() as u32)?;
                }
                write_elements(w, vec)?;
            }
            Term::Map(vec) => {
                w.write_u8(tag::MAP_EXT)?;
                w.write_u32::<BigEndian>(vec.len() as u32)?;
                for (key, value) in vec {
                    key.write(w)?;
                    value.write(w)?;
                }
            }
            Term::List(vec, tail) => {
                if !vec.is_empty() {
                    w.write_u8(tag::LIST_EXT)?;
                    w.write_u32::<BigEndian>(vec.len() as u32)?;
                    write_elements(w, vec)?;
                }
                tail.write(w)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etf::{decode, Float, Port, Reference, Uncached};
    use malachite::Integer;

    fn round_trip(term: Term) {
        let bytes = encode(&term).unwrap();
        assert_eq!(decode(&bytes, &Uncached).unwrap(), term, "bytes {:?}", bytes);
    }

    fn pid() -> Pid {
        Pid::new(Atom::new("node@host"), 33, 0, 7)
    }

    #[test]
    fn test_integer_tag_boundaries() {
        assert_eq!(encode(&Term::from(0)).unwrap(), vec![131, 97, 0]);
        assert_eq!(encode(&Term::from(255)).unwrap(), vec![131, 97, 255]);
        assert_eq!(encode(&Term::from(256)).unwrap(), vec![131, 98, 0, 0, 1, 0]);
        assert_eq!(encode(&Term::from(-1)).unwrap(), vec![131, 98, 255, 255, 255, 255]);
        assert_eq!(
            encode(&Term::from(i32::MAX)).unwrap(),
            vec![131, 98, 0x7f, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            encode(&Term::from(1i64 << 31)).unwrap(),
            vec![131, 110, 4, 0, 0, 0, 0, 0x80]
        );
        assert_eq!(
            encode(&Term::from(-(1i64 << 31) - 1)).unwrap(),
            vec![131, 110, 4, 1, 1, 0, 0, 0x80]
        );
    }

    #[test]
    fn test_integers_round_trip() {
        for value in [0, 255, 256, (1 << 31) - 1, 1 << 31, i64::MAX, i64::MIN, -42] {
            round_trip(Term::from(value));
        }
        round_trip(Term::from(1u64 << 63));
        let twenty_digits: Integer = "-12345678901234567890".parse().unwrap();
        round_trip(Term::from(twenty_digits));
        let huge = Integer::from(1u64 << 63) * Integer::from(1u64 << 63) * Integer::from(3);
        round_trip(Term::from(huge));
    }

    #[test]
    fn test_float_encodes_new_float() {
        assert_eq!(
            encode(&Term::from(1.5)).unwrap(),
            vec![131, 70, 0x3f, 0xf8, 0, 0, 0, 0, 0, 0]
        );
        round_trip(Term::Float(Float(-0.25)));
    }

    #[test]
    fn test_containers_round_trip() {
        round_trip(Term::Nil);
        round_trip(Term::tuple(vec![]));
        round_trip(Term::tuple((0..300).map(Term::from).collect()));
        round_trip(Term::Map(vec![]));
        round_trip(
            Term::try_map(vec![
                (Term::atom("k"), Term::binary(vec![1, 2, 3])),
                (Term::from(1), Term::list(vec![Term::atom("v")])),
            ])
            .unwrap(),
        );
        round_trip(Term::list(vec![Term::from(1), Term::string("abc")]));
        round_trip(Term::improper_list(
            vec![Term::from(1), Term::from(2)],
            Term::atom("tail"),
        ));
        round_trip(Term::binary(Vec::new()));
        round_trip(Term::bit_binary(vec![1, 0xc0], 2).unwrap());
    }

    #[test]
    fn test_long_atoms_and_strings() {
        let long = "a".repeat(300);
        let bytes = encode(&Term::atom(&long)).unwrap();
        assert_eq!(&bytes[..4], &[131, 118, 1, 44]);
        round_trip(Term::atom(&long));
        round_trip(Term::atom("héllo"));

        // Too long for STRING_EXT, comes back as a plain list of integers.
        let text = vec![b'x'; 70_000];
        let bytes = encode(&Term::String(text.clone())).unwrap();
        assert_eq!(bytes[1], tag::LIST_EXT);
        let decoded = decode(&bytes, &Uncached).unwrap();
        assert_eq!(decoded.list_items().map(|v| v.len()), Some(70_000));
    }

    #[test]
    fn test_node_containers_round_trip() {
        round_trip(Term::Pid(pid()));
        round_trip(Term::Port(Port {
            node: Atom::new("node@host"),
            id: 12,
            creation: 1,
        }));
        round_trip(Term::Port(Port {
            node: Atom::new("node@host"),
            id: 1 << 40,
            creation: 1,
        }));
        round_trip(Term::Reference(Reference {
            node: Atom::new("node@host"),
            creation: 3,
            ids: vec![1, 2, 3],
        }));
    }

    #[test]
    fn test_funs_round_trip() {
        round_trip(Term::Fun(Box::new(Fun::Closure {
            arity: 2,
            uniq: [9; 16],
            index: 4,
            module: Atom::new("shell"),
            old_index: 4,
            old_uniq: 70000,
            pid: pid(),
            free_vars: vec![Term::from(1), Term::atom("x")],
        })));
        round_trip(Term::Fun(Box::new(Fun::Legacy {
            pid: pid(),
            module: Atom::new("shell"),
            index: 1,
            uniq: 2,
            free_vars: vec![],
        })));
        round_trip(Term::Fun(Box::new(Fun::Export {
            module: Atom::new("lists"),
            function: Atom::new("map"),
            arity: 2,
        })));
    }

    #[test]
    fn test_compressed_only_when_smaller() {
        let small = Term::atom("ok");
        assert_eq!(encode_compressed(&small, 6).unwrap(), encode(&small).unwrap());

        let big = Term::binary(vec![0u8; 4096]);
        let packed = encode_compressed(&big, 6).unwrap();
        assert_eq!(packed[1], tag::COMPRESSED);
        assert!(packed.len() < 4096);
        assert_eq!(decode(&packed, &Uncached).unwrap(), big);
    }
}
