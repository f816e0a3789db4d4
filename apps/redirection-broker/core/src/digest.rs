//! Digest authentication response.
//!
//! The response is `hex(HMAC-SHA256(SHA-256(user:realm:password), nonce:cnonce))`,
//! so the password itself never crosses the wire.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::protocol::DigestFields;

type HmacSha256 = Hmac<Sha256>;

pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let key = hasher.finalize();

    let mut mac = match HmacSha256::new_from_slice(&key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(nonce.as_bytes());
    mac.update(b":");
    mac.update(cnonce.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

impl DigestFields {
    /// Builds a signed digest request for the given challenge material.
    pub fn sign(username: &str, password: &str, realm: &str, nonce: &str, cnonce: &str) -> Self {
        Self {
            username: username.to_string(),
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            cnonce: cnonce.to_string(),
            response: digest_response(username, realm, password, nonce, cnonce),
        }
    }

    /// Checks the response against the password an endpoint holds.
    pub fn verify(&self, password: &str) -> bool {
        let expected =
            digest_response(&self.username, &self.realm, password, &self.nonce, &self.cnonce);
        expected == self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn response_is_deterministic_and_hex() {
        let a = digest_response("admin", "Digest:AF01", "P@ssw0rd", "n1", "c1");
        let b = digest_response("admin", "Digest:AF01", "P@ssw0rd", "n1", "c1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test_timeout::timeout]
    fn verify_detects_wrong_password_and_nonce_reuse() {
        let fields = DigestFields::sign("admin", "P@ssw0rd", "Digest:AF01", "n1", "c1");
        assert!(fields.verify("P@ssw0rd"));
        assert!(!fields.verify("password"));

        let mut replayed = fields.clone();
        replayed.nonce = "n2".into();
        assert!(!replayed.verify("P@ssw0rd"));
    }
}
