//! Mainnet signer key loading and balance precheck (§4.6).
//!
//! Key material may arrive in any of four encodings; the gateway tries them
//! in a fixed precedence order rather than requiring the operator to tag the
//! format, the same "accept what ops actually hands you" posture the teacher
//! takes toward GitHub token formats in `auth.rs`.

use crate::error::{Error, Result};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BALANCE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub struct Signer {
    key: SigningKey,
    last_balance_check: Mutex<Option<Instant>>,
}

impl Signer {
    /// Decodes `secret` trying, in order: registry-canonical (a JSON array of
    /// the 32 key bytes embedded directly), raw JSON array, base64, then hex.
    /// First successful decode wins.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let bytes = Self::decode_registry_canonical(secret)
            .or_else(|| Self::decode_json_array(secret))
            .or_else(|| Self::decode_base64(secret))
            .or_else(|| Self::decode_hex(secret))
            .ok_or_else(|| Error::Config {
                msg: "signer_secret is not valid registry-canonical/JSON/base64/hex key material"
                    .to_string(),
            })?;

        let array: [u8; 32] = bytes.try_into().map_err(|_| Error::Config {
            msg: "signer_secret must decode to exactly 32 bytes".to_string(),
        })?;

        Ok(Self {
            key: SigningKey::from_bytes(&array),
            last_balance_check: Mutex::new(None),
        })
    }

    fn decode_registry_canonical(secret: &str) -> Option<Vec<u8>> {
        let value: serde_json::Value = serde_json::from_str(secret).ok()?;
        let arr = value.get("schema")?.as_str().filter(|s| *s == "ed25519")?;
        let _ = arr;
        let bytes = value.get("secretKey")?.as_array()?;
        bytes.iter().map(|b| b.as_u64().map(|n| n as u8)).collect()
    }

    fn decode_json_array(secret: &str) -> Option<Vec<u8>> {
        let value: Vec<u8> = serde_json::from_str(secret).ok()?;
        Some(value)
    }

    fn decode_base64(secret: &str) -> Option<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(secret.trim())
            .ok()
    }

    fn decode_hex(secret: &str) -> Option<Vec<u8>> {
        hex::decode(secret.trim()).ok()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn address(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Produces a signature over `payload`, to be attached as a signed
    /// header on the publish request.
    pub fn sign(&self, payload: &[u8]) -> String {
        use ed25519_dalek::Signer as _;
        let signature = self.key.sign(payload);
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    /// Debounces the (expensive, external) balance check to at most once per
    /// `BALANCE_CHECK_INTERVAL` of wall time, the same "timestamp guard
    /// around an external call" shape as the teacher's `db_actor` debounce
    /// window. Returns `true` if a live check should be performed now.
    pub fn should_check_balance(&self) -> bool {
        let mut last = self.last_balance_check.lock().unwrap();
        let due = match *last {
            None => true,
            Some(at) => at.elapsed() >= BALANCE_CHECK_INTERVAL,
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key_bytes() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn loads_from_hex() {
        let hex_secret = hex::encode(sample_key_bytes());
        let signer = Signer::from_secret(&hex_secret).unwrap();
        assert_eq!(signer.verifying_key().to_bytes().len(), 32);
    }

    #[test]
    fn loads_from_base64() {
        let b64 = base64::engine::general_purpose::STANDARD.encode(sample_key_bytes());
        Signer::from_secret(&b64).unwrap();
    }

    #[test]
    fn loads_from_json_array() {
        let json = serde_json::to_string(&sample_key_bytes().to_vec()).unwrap();
        Signer::from_secret(&json).unwrap();
    }

    #[test]
    fn rejects_garbage() {
        assert!(Signer::from_secret("not a key").is_err());
    }

    #[test]
    fn balance_check_debounces() {
        let signer = Signer::from_secret(&hex::encode(sample_key_bytes())).unwrap();
        assert!(signer.should_check_balance());
        assert!(!signer.should_check_balance());
    }
}
