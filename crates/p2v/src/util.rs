//! Small shared helpers.

use rand::Rng as _;

/// Generate a random lowercase base36 string of the given length.
///
/// Used for the shell-prompt synchronization tokens and the remote
/// directory suffix, so the output must never require shell quoting.
pub fn random_base36(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_base36() {
        let s = random_base36(8);
        assert_eq!(s.len(), 8);
        assert!(s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()));
        // Vanishingly unlikely to collide.
        assert_ne!(random_base36(8), random_base36(8));
    }
}
