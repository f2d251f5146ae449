//! Signed-token construction
//!
//! The minter and the provider both delegate actual signing to a
//! [`TokenSigner`]; the gateway ships an HMAC signer whose key is derived
//! from persisted key material, and an RSA signer for provider-issued JWTs.

use std::fs;
use std::path::Path;

use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde_json::Value;
use sha2::Sha256;
use tracing::info;

use crate::{Error, Result};

/// Generates signed bearer tokens from a claim set
pub trait TokenSigner: Send + Sync {
    /// Sign `claims` into a compact JWT
    fn sign(&self, claims: &Value) -> Result<String>;
}

/// HS256 signer with a key derived from persisted master material
pub struct HmacTokenSigner {
    key: EncodingKey,
}

impl HmacTokenSigner {
    /// Derive a signing key from the master key under `key_dir`,
    /// creating 32 bytes of master material on first use.
    ///
    /// The derivation binds the key to `context` (the trust domain), so
    /// distinct trust domains sharing a key directory cannot forge each
    /// other's tokens.
    pub fn from_key_dir(key_dir: &Path, context: &str) -> Result<Self> {
        fs::create_dir_all(key_dir)?;
        let master_path = key_dir.join("downstream.key");

        let master = if master_path.exists() {
            hex::decode(fs::read_to_string(&master_path)?.trim())
                .map_err(|e| Error::Config(format!("corrupt master key: {e}")))?
        } else {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            fs::write(&master_path, hex::encode(bytes))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&master_path, fs::Permissions::from_mode(0o600));
            }
            info!(path = %master_path.display(), "Created downstream signing key");
            bytes.to_vec()
        };

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&master)
            .map_err(|e| Error::Internal(format!("key derivation: {e}")))?;
        mac.update(context.as_bytes());
        let derived = mac.finalize().into_bytes();

        Ok(Self {
            key: EncodingKey::from_secret(derived.as_slice()),
        })
    }

    /// Build directly from raw secret bytes (tests)
    #[must_use]
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
        }
    }
}

impl TokenSigner for HmacTokenSigner {
    fn sign(&self, claims: &Value) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.key)
            .map_err(|e| Error::Internal(format!("token signing: {e}")))
    }
}

/// RS256 signer over a PEM private key
pub struct RsaTokenSigner {
    key: EncodingKey,
}

impl RsaTokenSigner {
    /// Load from a PKCS#8 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self> {
        Ok(Self {
            key: EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| Error::Config(format!("invalid RSA key: {e}")))?,
        })
    }
}

impl TokenSigner for RsaTokenSigner {
    fn sign(&self, claims: &Value) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), claims, &self.key)
            .map_err(|e| Error::Internal(format!("token signing: {e}")))
    }
}

/// Generate a fresh RSA-2048 private key as PKCS#8 PEM.
/// Done once per store lifetime; the result is persisted.
pub fn generate_rsa_pem() -> Result<String> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| Error::Internal(format!("RSA generation: {e}")))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("RSA encoding: {e}")))?;
    Ok(pem.to_string())
}
