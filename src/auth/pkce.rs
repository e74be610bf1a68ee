/// PKCE (Proof Key for Code Exchange)
///
/// RFC 7636 S256 verifier/challenge pairs. The verifier stays with the pending
/// authorization request; only the challenge leaves the process before the
/// token exchange.
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// Generate a code verifier: 32 random bytes, base64url-encoded (43 characters,
/// all from the RFC 7636 unreserved set)
pub fn generate_code_verifier() -> String {
    let random_bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// code_challenge = BASE64URL(SHA256(ASCII(code_verifier)))
pub fn code_challenge(code_verifier: &str) -> String {
    let hash = Sha256::digest(code_verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

#[derive(Clone)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let code_verifier = generate_code_verifier();
        let code_challenge = code_challenge(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
        }
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("code_verifier", &"[redacted]")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}
