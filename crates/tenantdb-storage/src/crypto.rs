//! Claim encryption.
//!
//! Tenant claims travel inside caller credentials as
//! `base64(nonce || ciphertext || tag)` under AES-256-GCM. The AAD binds the
//! ciphertext to its purpose so a value encrypted for another use cannot be
//! replayed as a tenant claim.

use base64::engine::general_purpose;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use tenantdb_core::{Result, TenancyError};

use crate::tenant::TenantContext;

const KEY_LEN: usize = 32;
const CLAIM_AAD: &[u8] = b"tenantdb:tenant-claim";

/// Symmetric encryption of short string values.
pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// # Errors
    ///
    /// `Decryption` for malformed, truncated or tampered input.
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

pub struct AesGcmEncryption {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for AesGcmEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmEncryption").finish_non_exhaustive()
    }
}

impl AesGcmEncryption {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(TenancyError::Configuration(format!(
                "claim key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| TenancyError::Configuration("invalid AES-256-GCM key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Build from a base64-encoded 32-byte key (`TENANTDB_CLAIM_KEY`).
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let key = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| TenancyError::Configuration(format!("claim key is not base64: {}", e)))?;
        Self::new(&key)
    }

    /// Generate a fresh random key, base64 encoded.
    pub fn generate_key() -> Result<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| TenancyError::Other("Failed to generate key".to_string()))?;
        Ok(general_purpose::STANDARD.encode(key))
    }
}

impl EncryptionService for AesGcmEncryption {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| TenancyError::Other("Failed to generate nonce".to_string()))?;

        let mut data = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(CLAIM_AAD),
                &mut data,
            )
            .map_err(|_| TenancyError::Other("Failed to encrypt claim".to_string()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend(data);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let combined = general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|e| TenancyError::Decryption(format!("invalid base64: {}", e)))?;

        if combined.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(TenancyError::Decryption("ciphertext too short".to_string()));
        }

        let (nonce_bytes, sealed) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| TenancyError::Decryption("invalid nonce".to_string()))?;

        let mut data = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(CLAIM_AAD), &mut data)
            .map_err(|_| TenancyError::Decryption("authentication failed".to_string()))?;

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| TenancyError::Decryption(format!("claim is not UTF-8: {}", e)))
    }
}

/// Produces encrypted tenant claims for credential issuers.
#[derive(Clone)]
pub struct TenantClaimIssuer {
    encryption: Arc<dyn EncryptionService>,
}

impl TenantClaimIssuer {
    pub fn new(encryption: Arc<dyn EncryptionService>) -> Self {
        Self { encryption }
    }

    pub fn issue(&self, tenant: &TenantContext) -> Result<String> {
        self.encryption.encrypt(tenant.tenant_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AesGcmEncryption {
        AesGcmEncryption::from_base64_key(&AesGcmEncryption::generate_key().unwrap()).unwrap()
    }

    #[test]
    fn test_claim_round_trip() {
        let svc = service();
        let sealed = svc.encrypt("acme").unwrap();
        assert_ne!(sealed, "acme");
        assert_eq!(svc.decrypt(&sealed).unwrap(), "acme");
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let svc = service();
        assert_ne!(svc.encrypt("acme").unwrap(), svc.encrypt("acme").unwrap());
    }

    #[test]
    fn test_tampered_claim_rejected() {
        let svc = service();
        let sealed = svc.encrypt("acme").unwrap();
        let mut bytes = general_purpose::STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = general_purpose::STANDARD.encode(bytes);

        assert!(matches!(
            svc.decrypt(&tampered),
            Err(TenancyError::Decryption(_))
        ));
        assert!(matches!(svc.decrypt("not base64!"), Err(TenancyError::Decryption(_))));
        assert!(matches!(svc.decrypt("AAAA"), Err(TenancyError::Decryption(_))));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = service().encrypt("acme").unwrap();
        assert!(service().decrypt(&sealed).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(AesGcmEncryption::new(&[0u8; 16]).is_err());
        assert!(AesGcmEncryption::from_base64_key("%%%").is_err());
        assert!(AesGcmEncryption::new(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_claim_issuer() {
        let svc: Arc<dyn EncryptionService> = Arc::new(service());
        let issuer = TenantClaimIssuer::new(svc.clone());
        let claim = issuer.issue(&TenantContext::new("acme").unwrap()).unwrap();
        assert_eq!(svc.decrypt(&claim).unwrap(), "acme");
    }
}
