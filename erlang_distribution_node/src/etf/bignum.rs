//! Arbitrary precision integers as little-endian magnitude bytes.

use malachite::Integer;

/// Magnitude bytes (least significant first) and the sign of `value`.
pub(crate) fn to_le_bytes(value: &Integer) -> (Vec<u8>, bool) {
    let zero = Integer::from(0);
    let negative = *value < zero;
    let mut rest = if negative { -value.clone() } else { value.clone() };
    let base = Integer::from(256u64);

    let mut bytes = Vec::new();
    while rest > zero {
        let digit = &rest % &base;
        bytes.push(u64::try_from(&digit).unwrap_or(0) as u8);
        rest = &rest / &base;
    }
    (bytes, negative)
}

pub(crate) fn from_le_bytes(bytes: &[u8], negative: bool) -> Integer {
    let mut value = Integer::from(0);
    for &byte in bytes.iter().rev() {
        value = value * Integer::from(256u64) + Integer::from(byte);
    }
    if negative {
        -value
    } else {
        value
    }
}
