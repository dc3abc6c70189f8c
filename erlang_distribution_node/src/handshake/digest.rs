/// Decimal form of a challenge as hashed by real nodes: negative values are
/// read back as `(1 << 31) | (nonce & 0x7fffffff)`.
pub fn nonce_text(nonce: i32) -> String {
    let unsigned = if nonce < 0 {
        (1u32 << 31) | (nonce as u32 & 0x7fff_ffff)
    } else {
        nonce as u32
    };
    unsigned.to_string()
}

/// `MD5(cookie ++ decimal(nonce))`
pub fn generate_digest(nonce: i32, cookie: &str) -> [u8; 16] {
    let plain = format!("{}{}", cookie, nonce_text(nonce));
    md5::compute(plain.as_bytes()).0
}

/// Digest over a challenge as it appears on the wire.
pub fn challenge_digest(challenge: u32, cookie: &str) -> [u8; 16] {
    generate_digest(challenge as i32, cookie)
}
