use rand::RngCore;
use rand::rngs::OsRng;

use crate::base64url;

/// Generate a random opaque token of `bytes` OS-random bytes, base64url
/// encoded without padding.
///
/// 32 bytes (the default for sessions, API tokens, and magic links) yields a
/// 43-character token with 256 bits of entropy.
pub fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    base64url(&buf)
}

/// Generate a numeric one-time passcode of `len` decimal digits.
///
/// Each digit is drawn independently so the code may have leading zeros;
/// callers compare it as a string, never as a number.
pub fn generate_numeric_otp(len: usize) -> String {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| char::from(b'0' + (b % 10))).collect()
}
