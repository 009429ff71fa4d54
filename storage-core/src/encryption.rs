//! StorageEncryption (C2): AEAD encrypt/decrypt with unique nonces,
//! sensitive-data classification, and secure deletion.
//!
//! AES-GCM-256 via the `aes-gcm` crate; the nonce is a fresh 96 bits drawn
//! from the CSPRNG per call and prepended to the ciphertext, forming the
//! `nonce || ciphertext || tag` envelope this module reads and writes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;

use crate::collaborators::{Clock, IndexedStore};
use crate::error::{CResult, Error};
use crate::key_manager::KeyHandle;
use crate::model::EncryptedEnvelope;

const NONCE_LEN: usize = 12;

/// Sensitive key-name patterns: provider API-key names and chat-history
/// prefixes (glossary). Matched as substrings, case-insensitively.
static SENSITIVE_KEY_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "openai_api_key",
        "anthropic_api_key",
        "azure_api_key",
        "google_api_key",
        "api_key",
        "apikey",
        "access_token",
        "refresh_token",
        "chat_history",
        "conversation_history",
    ]
});

/// Value prefixes that mark a string as sensitive regardless of its key
/// name (glossary: "values beginning with sk-, sk-or-v1-, sk-ant-, or
/// AIzaSy").
static SENSITIVE_VALUE_PREFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["sk-or-v1-", "sk-ant-", "sk-", "AIzaSy"]);

/// Logical OR of key-name pattern match and value-prefix match. Fail-closed:
/// classification never errors in this implementation, but if it ever did,
/// the policy is to classify as sensitive rather than risk a plaintext
/// write.
pub fn should_encrypt(key_name: &str, value: &str) -> bool {
    let lower = key_name.to_ascii_lowercase();
    if SENSITIVE_KEY_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return true;
    }
    SENSITIVE_VALUE_PREFIXES.iter().any(|prefix| value.starts_with(prefix))
}

/// Checked by `SecurityCoordinator::init`'s encryption-readiness step: the
/// classification tables are `once_cell::Lazy` statics, so this can only
/// fail if they were built empty, which would be a packaging bug rather
/// than a runtime condition.
pub fn classification_tables_loaded() -> bool {
    !SENSITIVE_KEY_PATTERNS.is_empty() && !SENSITIVE_VALUE_PREFIXES.is_empty()
}

fn cipher_for(key: &KeyHandle) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.bytes()))
}

/// Encrypts `plaintext` under `key`, using a fresh random 96-bit nonce, and
/// returns the persistable envelope.
pub fn encrypt(plaintext: &[u8], key: &KeyHandle, key_version: u32, clock: &dyn Clock) -> CResult<EncryptedEnvelope> {
    let cipher = cipher_for(key);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| Error::Internal("encryption failed".into()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(EncryptedEnvelope {
        encrypted: true,
        key_version,
        value: BASE64.encode(combined),
        created_at_ms: clock.now_ms(),
    })
}

/// Decrypts `envelope` under `key`. Returns `None` on any authentication or
/// format failure — decryption failure is recovered locally by the caller,
/// never propagated as an error from this function.
pub fn decrypt(envelope: &EncryptedEnvelope, key: &KeyHandle) -> Option<Vec<u8>> {
    let combined = BASE64.decode(&envelope.value).ok()?;
    if combined.len() < NONCE_LEN {
        return None;
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher_for(key).decrypt(nonce, ciphertext).ok()
}

/// Decrypts with `old_key`; on success, re-encrypts with `new_key` under a
/// fresh nonce. Returns `None` if the old envelope does not authenticate.
/// The caller is responsible for persisting the result atomically.
pub fn migrate(old_key: &KeyHandle, new_key: &KeyHandle, new_version: u32, envelope: &EncryptedEnvelope, clock: &dyn Clock) -> CResult<Option<EncryptedEnvelope>> {
    let Some(plaintext) = decrypt(envelope, old_key) else { return Ok(None) };
    Ok(Some(encrypt(&plaintext, new_key, new_version, clock)?))
}

/// For an encrypted record, overwrites the stored ciphertext with a
/// same-length random base64 value in a committed write before deleting the
/// key. If overwrite fails, deletion proceeds anyway and the failure is
/// logged. Non-encrypted records are deleted directly.
pub fn secure_delete(indexed: &dyn IndexedStore, store: &str, key: &[u8]) -> CResult<()> {
    let Some(existing) = indexed.get(store, key)? else { return Ok(()) };

    let overwritten = match serde_json::from_slice::<EncryptedEnvelope>(&existing) {
        Ok(envelope) if envelope.encrypted => {
            let mut random_value = vec![0u8; envelope.value.len().max(1)];
            rand::Rng::fill(&mut rand::thread_rng(), random_value.as_mut_slice());
            let scrubbed = EncryptedEnvelope { value: BASE64.encode(&random_value), ..envelope };
            match serde_json::to_vec(&scrubbed) {
                Ok(bytes) => indexed.put(store, key, &bytes).is_ok(),
                Err(_) => false,
            }
        }
        _ => true, // not an encrypted envelope: nothing to scrub before deleting
    };

    if !overwritten {
        log::warn!("secure_delete: overwrite failed for {store}/{}, deleting without scrub", String::from_utf8_lossy(key));
    }
    indexed.delete(store, key)
}
