//! Package signature creation and verification.
//!
//! Update packages ship with a sibling `.sig` file: JSON carrying the
//! package's SHA-256, its size, the signature bytes (base64) and the signing
//! method tag. Two methods are supported:
//!
//! - `rsa`: RSA-PSS with MGF1-SHA256 over the file bytes, verified against
//!   the configured public key.
//! - `hmac`: HMAC-SHA256 over the file bytes with a shared secret, compared
//!   in constant time.
//!
//! Signing support exists alongside verification so the pipeline can be
//! exercised end-to-end in tests and by packaging tooling.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::sha2::{Digest, Sha256};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Signing method tags as they appear in signature files.
pub const METHOD_RSA: &str = "rsa";
pub const METHOD_HMAC: &str = "hmac";

/// Contents of a package's sibling `.sig` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub file_size: u64,
    pub file_hash: String,
    pub hash_algorithm: String,
    pub signing_method: String,
    pub timestamp: i64,
    /// Base64-encoded signature bytes.
    pub signature: String,
}

/// Streams a file through SHA-256 and returns the hex digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Signs and verifies update packages.
#[derive(Debug, Default)]
pub struct SignatureManager {
    public_key: Option<RsaPublicKey>,
    private_key: Option<RsaPrivateKey>,
    hmac_secret: Option<String>,
}

impl SignatureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the RSA public key (SPKI PEM) used to verify `rsa` signatures.
    pub fn with_public_key_file(mut self, path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read public key {}", path.display()))?;
        self.public_key = Some(
            RsaPublicKey::from_public_key_pem(&pem)
                .with_context(|| format!("Invalid public key in {}", path.display()))?,
        );
        log::info!("Loaded update public key from {}", path.display());
        Ok(self)
    }

    /// Loads an RSA private key (PKCS#8 PEM) for signing. The matching
    /// public key is derived for verification.
    pub fn with_private_key_pem(mut self, pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem).context("Invalid RSA private key")?;
        self.public_key = Some(key.to_public_key());
        self.private_key = Some(key);
        Ok(self)
    }

    /// Sets the shared secret for `hmac` signatures.
    pub fn with_hmac_secret(mut self, secret: impl Into<String>) -> Self {
        self.hmac_secret = Some(secret.into());
        self
    }

    /// Whether any verification material is configured.
    pub fn can_verify(&self) -> bool {
        self.public_key.is_some() || self.hmac_secret.is_some()
    }

    /// Signs `path` with `method` and returns the signature file contents.
    pub fn sign_file(&self, path: &Path, method: &str) -> Result<SignatureInfo> {
        let file_hash = sha256_file(path)?;
        let file_size = std::fs::metadata(path)?.len();
        let data = std::fs::read(path)?;

        let signature = match method {
            METHOD_RSA => {
                let key = self
                    .private_key
                    .clone()
                    .context("RSA private key not configured")?;
                let signing_key = BlindedSigningKey::<Sha256>::new(key);
                let mut rng = rand::thread_rng();
                BASE64.encode(signing_key.sign_with_rng(&mut rng, &data).to_vec())
            }
            METHOD_HMAC => BASE64.encode(self.hmac_digest(&data)?),
            other => anyhow::bail!("Unknown signing method: {other}"),
        };

        Ok(SignatureInfo {
            file_path: Some(path.display().to_string()),
            file_size,
            file_hash,
            hash_algorithm: "sha256".to_string(),
            signing_method: method.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            signature,
        })
    }

    /// Verifies `path` against `info`. The hash and size must match, then
    /// the signature must validate under the declared method.
    pub fn verify_file(&self, path: &Path, info: &SignatureInfo) -> Result<bool> {
        let current_hash = sha256_file(path)?;
        if current_hash != info.file_hash {
            log::error!("Package hash mismatch");
            return Ok(false);
        }

        let current_size = std::fs::metadata(path)?.len();
        if current_size != info.file_size {
            log::error!("Package size mismatch");
            return Ok(false);
        }

        let data = std::fs::read(path)?;
        let signature = BASE64
            .decode(&info.signature)
            .context("Signature is not valid base64")?;

        match info.signing_method.as_str() {
            METHOD_RSA => {
                let key = self
                    .public_key
                    .clone()
                    .context("RSA public key not configured")?;
                let verifying_key = VerifyingKey::<Sha256>::new(key);
                let signature = match Signature::try_from(signature.as_slice()) {
                    Ok(signature) => signature,
                    Err(_) => return Ok(false),
                };
                Ok(verifying_key.verify(&data, &signature).is_ok())
            }
            METHOD_HMAC => {
                let secret = self
                    .hmac_secret
                    .as_ref()
                    .context("HMAC secret not configured")?;
                let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                    .expect("HMAC accepts keys of any length");
                mac.update(&data);
                // Constant-time comparison.
                Ok(mac.verify_slice(&signature).is_ok())
            }
            other => anyhow::bail!("Unknown signing method: {other}"),
        }
    }

    fn hmac_digest(&self, data: &[u8]) -> Result<Vec<u8>> {
        let secret = self
            .hmac_secret
            .as_ref()
            .context("HMAC secret not configured")?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// 2048-bit PKCS#8 test key. Generated for these tests only; never used
    /// to sign real artifacts.
    const TEST_PRIVATE_KEY_PEM: &str = include_str!("testdata/test_signing_key.pem");

    #[test]
    fn test_sha256_file_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sign_verify_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        fs::write(&path, b"package bytes").unwrap();

        let manager = SignatureManager::new().with_hmac_secret("shared-secret");
        let info = manager.sign_file(&path, METHOD_HMAC).unwrap();
        assert_eq!(info.signing_method, "hmac");
        assert_eq!(info.hash_algorithm, "sha256");
        assert!(manager.verify_file(&path, &info).unwrap());
    }

    #[test]
    fn test_hmac_verify_rejects_mutated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        fs::write(&path, b"package bytes").unwrap();

        let manager = SignatureManager::new().with_hmac_secret("shared-secret");
        let info = manager.sign_file(&path, METHOD_HMAC).unwrap();

        // Flip a single byte; both the hash check and the MAC must fail.
        fs::write(&path, b"package byteZ").unwrap();
        assert!(!manager.verify_file(&path, &info).unwrap());
    }

    #[test]
    fn test_hmac_verify_rejects_wrong_secret() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        fs::write(&path, b"package bytes").unwrap();

        let signer = SignatureManager::new().with_hmac_secret("secret-a");
        let info = signer.sign_file(&path, METHOD_HMAC).unwrap();

        let verifier = SignatureManager::new().with_hmac_secret("secret-b");
        assert!(!verifier.verify_file(&path, &info).unwrap());
    }

    #[test]
    fn test_rsa_sign_verify_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        fs::write(&path, b"signed package payload").unwrap();

        let manager = SignatureManager::new()
            .with_private_key_pem(TEST_PRIVATE_KEY_PEM)
            .unwrap();
        let info = manager.sign_file(&path, METHOD_RSA).unwrap();
        assert_eq!(info.signing_method, "rsa");
        assert!(manager.verify_file(&path, &info).unwrap());
    }

    #[test]
    fn test_rsa_verify_rejects_mutated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        fs::write(&path, b"signed package payload").unwrap();

        let manager = SignatureManager::new()
            .with_private_key_pem(TEST_PRIVATE_KEY_PEM)
            .unwrap();
        let info = manager.sign_file(&path, METHOD_RSA).unwrap();

        fs::write(&path, b"signed package payloaX").unwrap();
        assert!(!manager.verify_file(&path, &info).unwrap());
    }

    #[test]
    fn test_rsa_verify_rejects_garbage_signature() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.tar.gz");
        fs::write(&path, b"payload").unwrap();

        let manager = SignatureManager::new()
            .with_private_key_pem(TEST_PRIVATE_KEY_PEM)
            .unwrap();
        let mut info = manager.sign_file(&path, METHOD_RSA).unwrap();
        info.signature = BASE64.encode(b"not a signature");
        assert!(!manager.verify_file(&path, &info).unwrap());
    }

    #[test]
    fn test_unknown_method_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg");
        fs::write(&path, b"x").unwrap();

        let manager = SignatureManager::new().with_hmac_secret("s");
        assert!(manager.sign_file(&path, "ed25519").is_err());

        let mut info = manager.sign_file(&path, METHOD_HMAC).unwrap();
        info.signing_method = "ed25519".to_string();
        assert!(manager.verify_file(&path, &info).is_err());
    }

    #[test]
    fn test_signature_info_json_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg");
        fs::write(&path, b"x").unwrap();

        let manager = SignatureManager::new().with_hmac_secret("s");
        let info = manager.sign_file(&path, METHOD_HMAC).unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("file_hash").is_some());
        assert!(json.get("signature").is_some());
        assert_eq!(json["signing_method"], "hmac");
    }
}
