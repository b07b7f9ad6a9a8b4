//! Usage: PKCE verifier/challenge and CSRF state generation for the login flow.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

pub fn generate_pkce_pair() -> PkcePair {
    let mut random = [0u8; VERIFIER_BYTES];
    OsRng.fill_bytes(&mut random);

    let code_verifier = URL_SAFE_NO_PAD.encode(random);
    let code_challenge = code_challenge_s256(&code_verifier);

    PkcePair {
        code_verifier,
        code_challenge,
    }
}

pub fn code_challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// 64 lowercase hex chars.
pub fn generate_state() -> String {
    let mut random = [0u8; STATE_BYTES];
    OsRng.fill_bytes(&mut random);
    hex::encode(random)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_has_valid_lengths_and_consistent_challenge() {
        let pair = generate_pkce_pair();
        assert_eq!(pair.code_verifier.len(), 43);
        assert!(!pair.code_verifier.contains('='));

        let expected = code_challenge_s256(&pair.code_verifier);
        assert_eq!(pair.code_challenge, expected);
    }

    #[test]
    fn challenge_matches_rfc7636_example() {
        assert_eq!(
            code_challenge_s256("dBjftJeZ4CVP-mB92K27uhbUJU1p1r7wW1gXD6CX6ts"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn states_are_hex_and_unique() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
