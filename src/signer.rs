//! Request signing capability.
//!
//! Every outbound portal request carries an HMAC-SHA-256 signature over
//! `"{timestamp}.{body}"` keyed with the device secret. The signature is
//! lowercase hex; an empty secret disables signing and yields an empty string.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub trait Signer: Send + Sync + 'static {
    fn sign(&self, timestamp: i64, body: &str) -> String;
}

pub struct HmacSigner {
    secret: SecretString,
}

impl HmacSigner {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    pub fn disabled() -> Self {
        Self {
            secret: SecretString::new(String::new()),
        }
    }
}

impl Signer for HmacSigner {
    fn sign(&self, timestamp: i64, body: &str) -> String {
        let secret = self.secret.expose_secret();
        if secret.is_empty() {
            return String::new();
        }

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{timestamp}.{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_disables_signing() {
        let signer = HmacSigner::disabled();
        assert_eq!(signer.sign(1_700_000_000, "{\"a\":1}"), "");
    }

    #[test]
    fn signature_is_lowercase_hex_sha256() {
        let signer = HmacSigner::new(SecretString::new("device-secret".into()));
        let sig = signer.sign(1_700_000_000, "{\"a\":1}");
        assert_eq!(sig.len(), 64);
        assert!(sig
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let signer = HmacSigner::new(SecretString::new("device-secret".into()));
        let base = signer.sign(100, "body");
        assert_eq!(signer.sign(100, "body"), base);
        assert_ne!(signer.sign(101, "body"), base);
        assert_ne!(signer.sign(100, "body2"), base);

        let other = HmacSigner::new(SecretString::new("other-secret".into()));
        assert_ne!(other.sign(100, "body"), base);
    }
}
