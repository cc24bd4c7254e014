use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Cryptographically random bytes, sized for the things this client mints:
/// AES-GCM nonces, X11 cookies and generated secrets.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    ChaCha20Rng::from_entropy().gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_draws() {
        let a: [u8; 16] = random_bytes();
        let b: [u8; 16] = random_bytes();
        assert_ne!(a, b);
    }
}
