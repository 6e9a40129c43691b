//! Persistent node/client identity.
//!
//! A pair of 32-byte x25519 keys stored hex-encoded at
//! `<home>/.box/keys/{node,client}.identity.json` with mode 0o600. Created on
//! first launch, never rotated except by explicit tooling.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{Error, Result};

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "secretKey")]
    secret_key: String,
}

/// An x25519 keypair pinned to one node or client.
pub struct Identity {
    public: [u8; 32],
    secret: [u8; 32],
}

impl Identity {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| Error::KeyMaterial(format!("rng unavailable: {e}")))?;
        let secret = StaticSecret::from(seed);
        seed.zeroize();
        let public = PublicKey::from(&secret);
        Ok(Self {
            public: public.to_bytes(),
            secret: secret.to_bytes(),
        })
    }

    /// Load the identity at `path`, generating and persisting one when the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate()?;
            identity.save(path)?;
            tracing::info!(path = %path.display(), "generated node identity");
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let file: IdentityFile = serde_json::from_str(&data)?;
        let public = decode_key(&file.public_key, "publicKey")?;
        let secret = decode_key(&file.secret_key, "secretKey")?;
        // Sanity: the stored public key must match the secret.
        let derived = PublicKey::from(&StaticSecret::from(secret));
        if derived.to_bytes() != public {
            return Err(Error::KeyMaterial(format!(
                "identity file {} is inconsistent",
                path.display()
            )));
        }
        Ok(Self { public, secret })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = IdentityFile {
            public_key: hex::encode(self.public),
            secret_key: hex::encode(self.secret),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        restrict_file(path)?;
        Ok(())
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Stable 128-bit identifier derived from the public key. Identity-pinned
    /// access means the UUID and the key can never drift apart.
    pub fn derived_uuid(&self) -> Uuid {
        let digest = Sha256::digest(self.public);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl core::fmt::Debug for Identity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

fn decode_key(hex_str: &str, field: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::KeyMaterial(format!("{field}: invalid hex: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Error::KeyMaterial(format!("{field}: expected 32 bytes")))
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<()> {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<()> {
    Ok(())
}
