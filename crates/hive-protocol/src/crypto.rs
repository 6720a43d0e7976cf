use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::constants::AGENT_DID_PREFIX;
use crate::ProtocolError;

/// Generate a new Ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    let mut rng = rand::thread_rng();
    SigningKey::generate(&mut rng)
}

/// Derive the agent ID (DID) from a public key.
/// Format: did:hive:<hex(sha256(pub_key))>
pub fn derive_agent_id(verifying_key: &VerifyingKey) -> String {
    let hash = Sha256::digest(verifying_key.as_bytes());
    format!("{AGENT_DID_PREFIX}{}", hex::encode(hash))
}

/// Sign a message payload with the signing key.
pub fn sign_message(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

/// Verify a message signature against the verifying key.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    payload: &[u8],
    signature: &Signature,
) -> Result<(), ProtocolError> {
    verifying_key
        .verify(payload, signature)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))
}

/// Parse a hex-encoded Ed25519 public key.
pub fn verifying_key_from_hex(key_hex: &str) -> Result<VerifyingKey, ProtocolError> {
    let bytes = hex::decode(key_hex)
        .map_err(|e| ProtocolError::Crypto(format!("invalid pubkey hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ProtocolError::Crypto("pubkey wrong length".into()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| ProtocolError::Crypto(format!("invalid pubkey: {e}")))
}

/// Load an Ed25519 keypair from a file, or create a new one if the file doesn't exist.
/// The file stores the raw 32-byte Ed25519 seed with mode 0600.
pub fn load_or_create_keypair(path: &Path) -> Result<SigningKey, ProtocolError> {
    if path.exists() {
        let seed_bytes = std::fs::read(path)
            .map_err(|e| ProtocolError::Crypto(format!("read key file: {e}")))?;
        let seed: [u8; 32] = seed_bytes.as_slice().try_into().map_err(|_| {
            ProtocolError::Crypto(format!(
                "key file is {} bytes, expected 32",
                seed_bytes.len()
            ))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProtocolError::Crypto(format!("create dir: {e}")))?;
        }
        let key = generate_keypair();
        std::fs::write(path, key.to_bytes())
            .map_err(|e| ProtocolError::Crypto(format!("write key file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ProtocolError::Crypto(format!("set permissions: {e}")))?;
        }
        Ok(key)
    }
}
