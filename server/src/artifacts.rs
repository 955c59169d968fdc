//! Durable storage for build artifacts (SBOMs, signatures, provenance)
//! and the platform signing key.

use std::path::{Path, PathBuf};

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use tracing::info;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use enclii_common::models::error::ErrorKind;

use crate::{Error, Result};

/// Content-addressed files under the artifacts directory, one subdirectory
/// per kind. A ref looks like `sbom:sha256:<hex>` and is stable across
/// restarts and rebuilds of identical content.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub async fn store(&self, kind: &str, content: &[u8]) -> Result<String> {
        let digest = hex::encode(Sha256::digest(content));
        let dir = self.root.join(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;
        tokio::fs::write(dir.join(&digest), content)
            .await
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;

        Ok(format!("{kind}:sha256:{digest}"))
    }

    pub async fn load(&self, artifact_ref: &str) -> Result<Vec<u8>> {
        let (kind, digest) = parse_ref(artifact_ref)?;
        tokio::fs::read(self.root.join(kind).join(digest))
            .await
            .map_err(|e| Error::source(ErrorKind::NotFound, e))
    }
}

fn parse_ref(artifact_ref: &str) -> Result<(&str, &str)> {
    let mut parts = artifact_ref.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some("sha256"), Some(digest)) if !kind.is_empty() && !digest.is_empty() => {
            Ok((kind, digest))
        }
        _ => Err(Error::custom(
            ErrorKind::Validation,
            format!("`{artifact_ref}` is not an artifact ref"),
        )),
    }
}

/// The platform Ed25519 key. Signs image digests at build time and
/// deployment receipts at emission time.
pub struct Signer {
    keypair: Ed25519KeyPair,
}

impl Signer {
    /// Load the PKCS#8 key, generating and persisting one on first start.
    pub fn from_file_or_generate(path: &Path) -> anyhow::Result<Self> {
        let document = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let document = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
                    .map_err(|_| anyhow::anyhow!("failed to generate signing key"))?;
                std::fs::write(path, document.as_ref())?;
                info!(path = %path.display(), "generated platform signing key");
                document.as_ref().to_vec()
            }
            Err(err) => return Err(err.into()),
        };

        let keypair = Ed25519KeyPair::from_pkcs8(&document)
            .map_err(|_| anyhow::anyhow!("invalid signing key at {}", path.display()))?;

        Ok(Self { keypair })
    }

    #[cfg(test)]
    pub fn ephemeral() -> Self {
        let document = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        Self {
            keypair: Ed25519KeyPair::from_pkcs8(document.as_ref()).unwrap(),
        }
    }

    /// Detached signature, base64-encoded.
    pub fn sign(&self, payload: &[u8]) -> String {
        BASE64.encode(self.keypair.sign(payload).as_ref())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.keypair.public_key().as_ref())
    }

    /// Verification the way a downstream compliance consumer would do it.
    pub fn verify(&self, payload: &[u8], signature_base64: &str) -> bool {
        let Ok(signature) = BASE64.decode(signature_base64) else {
            return false;
        };
        UnparsedPublicKey::new(&ED25519, self.keypair.public_key().as_ref())
            .verify(payload, &signature)
            .is_ok()
    }
}
