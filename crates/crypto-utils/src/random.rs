use rand::rngs::OsRng;
use rand::RngCore;

/// Generates a fixed-size array of cryptographically secure random bytes.
pub fn random_bytes_fixed<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generates a fresh 32-byte KDF salt.
pub fn generate_salt() -> [u8; 32] {
    random_bytes_fixed::<32>()
}

/// Generates a fresh 16-byte cipher IV.
pub fn generate_iv() -> [u8; 16] {
    random_bytes_fixed::<16>()
}
