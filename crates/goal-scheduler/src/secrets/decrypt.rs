use crate::config::DecryptionConfig;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

/// Decrypt a base64 RSA-OAEP (SHA-1) ciphertext with the configured PKCS#8 key.
pub fn decrypt_secret(ciphertext: &str, config: Option<&DecryptionConfig>) -> Result<String> {
    let Some(config) = config else {
        return Err(Error::SecretError(
            "Encrypted secret declared but no decryption key is configured".to_string(),
        ));
    };
    let key = load_private_key(config)?;
    let bytes = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| Error::SecretError(format!("Encrypted secret is not valid base64: {e}")))?;
    let plain = key
        .decrypt(Oaep::new::<Sha1>(), &bytes)
        .map_err(|e| Error::SecretError(format!("Failed to decrypt secret: {e}")))?;
    String::from_utf8(plain)
        .map_err(|e| Error::SecretError(format!("Decrypted secret is not UTF-8: {e}")))
}

fn load_private_key(config: &DecryptionConfig) -> Result<RsaPrivateKey> {
    let pem = config.private_key.trim();
    let key = match config.passphrase.as_deref() {
        Some(passphrase) if !passphrase.is_empty() => {
            RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
        }
        _ => RsaPrivateKey::from_pkcs8_pem(pem),
    };
    key.map_err(|e| Error::ConfigError(format!("Invalid decryption private key: {e}")))
}
