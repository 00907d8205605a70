//! PKCE and CSRF state generation

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Code challenge method sent to the provider
pub const CHALLENGE_METHOD: &str = "S256";

/// PKCE verifier/challenge pair
#[derive(Clone)]
pub struct Pkce {
    /// Kept locally and sent with the code exchange
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`, sent with the authorization request
    pub challenge: String,
}

impl std::fmt::Debug for Pkce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkce")
            .field("challenge", &self.challenge)
            .finish_non_exhaustive()
    }
}

impl Pkce {
    /// Generate a fresh pair from 32 random bytes
    #[must_use]
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::fill(&mut verifier_bytes);
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// S256 challenge of `verifier`
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generate a random `state` parameter
#[must_use]
pub fn generate_state() -> String {
    let mut state_bytes = [0u8; 16];
    rand::fill(&mut state_bytes);
    URL_SAFE_NO_PAD.encode(state_bytes)
}

/// Compare a received `state` with the expected one in constant time
#[must_use]
pub fn state_matches(expected: &str, received: &str) -> bool {
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}
