//! KeyManager (C1): derives and holds non-extractable symmetric keys from a
//! session secret, and rotates them on a schedule.
//!
//! There is no browser execution context in a Rust process, so the secure
//! context check is an injected `SecureContextCheck` the embedder
//! implements. Key material is held in `KeyHandle`, whose bytes are
//! `zeroize`-wiped on drop and never `Debug`-printed or cloned out of this
//! module — the closest faithful substitute for a non-extractable
//! `CryptoKey` handle.

use std::sync::{Arc, Mutex};

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::collaborators::{Clock, SyncKvStore};
use crate::config::{KeyManagerOptions, MIN_KDF_ITERATIONS};
use crate::error::{CResult, Error};
use crate::model::KeySessionMeta;

/// Rotation is required once the recorded rotation timestamp is older than
/// this many milliseconds (30 days).
pub const ROTATION_INTERVAL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Sync-kv key the per-origin device id is persisted under.
pub const DEVICE_ID_KEY: &str = "device_id";

/// Sync-kv key the last rotation timestamp is persisted under.
pub const ROTATION_TIMESTAMP_KEY: &str = "key_rotation_timestamp_ms";

/// Checks whether the embedding environment is a *secure context*: reachable
/// only over a confidential transport, not embedded in a cross-origin
/// container, and not loaded via a non-navigable scheme. There is no
/// universal way to ask this of a Rust process, so it is delegated to the
/// embedder.
pub trait SecureContextCheck: Send + Sync {
    fn check(&self) -> CResult<()>;
}

/// Test/default double: always reports a secure context.
pub struct AlwaysSecure;

impl SecureContextCheck for AlwaysSecure {
    fn check(&self) -> CResult<()> {
        Ok(())
    }
}

/// Inputs the device fingerprint is derived from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFingerprintInputs {
    pub user_agent: String,
    pub language: String,
    pub hardware_concurrency: u32,
    pub origin: String,
}

/// Reads the persistent per-origin device id from the sync-kv store,
/// generating and persisting a fresh one on first use.
pub fn get_or_create_device_id(sync_kv: &dyn SyncKvStore) -> CResult<String> {
    if let Some(existing) = sync_kv.get(DEVICE_ID_KEY)? {
        return Ok(existing);
    }
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    let id = hex::encode(bytes);
    sync_kv.set(DEVICE_ID_KEY, &id)?;
    Ok(id)
}

/// SHA-256 of the join of user-agent, language, hardware-concurrency,
/// origin, and the persistent device id, hex-encoded.
pub fn device_fingerprint(inputs: &DeviceFingerprintInputs, device_id: &str) -> String {
    let joined = format!(
        "{}|{}|{}|{}|{}",
        inputs.user_agent, inputs.language, inputs.hardware_concurrency, inputs.origin, device_id
    );
    let digest = Sha256::digest(joined.as_bytes());
    hex::encode(digest)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyPurpose {
    Data,
    Sign,
    Session,
}

impl KeyPurpose {
    fn label(self) -> &'static str {
        match self {
            KeyPurpose::Data => "data",
            KeyPurpose::Sign => "sign",
            KeyPurpose::Session => "session",
        }
    }
}

/// A non-extractable key handle: 32 bytes of key material that is never
/// `Debug`-printed, never cloned outside this module, and is zeroized on
/// drop. Consumers receive it wrapped in `Arc` so it can be shared by
/// reference without copying the bytes.
pub struct KeyHandle {
    bytes: Zeroizing<[u8; 32]>,
    purpose: KeyPurpose,
}

impl KeyHandle {
    fn derive(salt: &[u8; 32], purpose: KeyPurpose, version: u32, fingerprint: &str, password: &str, iterations: u32) -> CResult<Self> {
        let mut info = Vec::with_capacity(32 + 8 + 4 + fingerprint.len());
        info.extend_from_slice(salt);
        info.extend_from_slice(purpose.label().as_bytes());
        info.extend_from_slice(&version.to_le_bytes());
        info.extend_from_slice(fingerprint.as_bytes());

        let mut out = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &info, iterations, &mut out);
        Ok(Self { bytes: Zeroizing::new(out), purpose })
    }

    /// Raw key bytes. Crate-private: `StorageEncryption` is the only
    /// consumer allowed to see plaintext key material, and it lives in the
    /// same crate.
    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn purpose_label(&self) -> &'static str {
        self.purpose.label()
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 tag over `data` under the signing key. The `sign` purpose
/// key is derived for exactly this: authenticating records (e.g. a
/// compensation entry or archive manifest) whose integrity needs checking
/// independent of AES-GCM's own per-record tag.
pub fn hmac_sign(data: &[u8], key: &KeyHandle) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key.bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time verification of an HMAC-SHA-256 tag produced by
/// [`hmac_sign`]. Returns `false` on any mismatch, including a malformed
/// tag length — never panics on attacker-controlled input.
pub fn hmac_verify(data: &[u8], tag: &[u8], key: &KeyHandle) -> bool {
    let mut mac = HmacSha256::new_from_slice(key.bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyHandle({}, <redacted>)", self.purpose.label())
    }
}

struct KeySessionState {
    meta: KeySessionMeta,
    data_key: Arc<KeyHandle>,
    signing_key: Arc<KeyHandle>,
    general_key: Arc<KeyHandle>,
    password: Zeroizing<String>,
}

/// Derives and holds the three session keys, and performs rotation.
pub struct KeyManager {
    session: Mutex<Option<KeySessionState>>,
    options: KeyManagerOptions,
}

impl KeyManager {
    pub fn new(options: KeyManagerOptions) -> Self {
        Self { session: Mutex::new(None), options }
    }

    fn iterations(&self) -> u32 {
        self.options.kdf_iterations.max(MIN_KDF_ITERATIONS)
    }

    fn derive_all(salt: &[u8; 32], version: u32, fingerprint: &str, password: &str, iterations: u32) -> CResult<(KeyHandle, KeyHandle, KeyHandle)> {
        let data = KeyHandle::derive(salt, KeyPurpose::Data, version, fingerprint, password, iterations)?;
        let signing = KeyHandle::derive(salt, KeyPurpose::Sign, version, fingerprint, password, iterations)?;
        let general = KeyHandle::derive(salt, KeyPurpose::Session, version, fingerprint, password, iterations)?;
        Ok((data, signing, general))
    }

    pub fn initialize_session(
        &self,
        password: &str,
        fingerprint_inputs: &DeviceFingerprintInputs,
        secure_context: &dyn SecureContextCheck,
        sync_kv: &dyn SyncKvStore,
        clock: &dyn Clock,
    ) -> CResult<()> {
        secure_context.check().map_err(|_| Error::InsecureContext)?;
        if password.len() < 8 {
            return Err(Error::WeakPassword);
        }

        let device_id = get_or_create_device_id(sync_kv)?;
        let fingerprint = device_fingerprint(fingerprint_inputs, &device_id);

        let mut salt = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut salt);

        let iterations = self.iterations();
        let version = 1;
        let (data_key, signing_key, general_key) = Self::derive_all(&salt, version, &fingerprint, password, iterations)
            .map_err(|_| Error::KdfFailure("derivation failed".into()))?;

        let now_ms = clock.now_ms();
        sync_kv.set(ROTATION_TIMESTAMP_KEY, &now_ms.to_string())?;

        *self.session.lock().unwrap() = Some(KeySessionState {
            meta: KeySessionMeta { session_salt: salt, created_at_ms: now_ms, version },
            data_key: Arc::new(data_key),
            signing_key: Arc::new(signing_key),
            general_key: Arc::new(general_key),
            password: Zeroizing::new(password.to_string()),
        });
        log::info!("key session initialized (version {version})");
        Ok(())
    }

    pub fn is_session_active(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    pub fn get_data_key(&self) -> CResult<Arc<KeyHandle>> {
        self.session.lock().unwrap().as_ref().map(|s| s.data_key.clone()).ok_or(Error::EncryptionUnavailable)
    }

    pub fn get_signing_key(&self) -> CResult<Arc<KeyHandle>> {
        self.session.lock().unwrap().as_ref().map(|s| s.signing_key.clone()).ok_or(Error::EncryptionUnavailable)
    }

    pub fn get_general_key(&self) -> CResult<Arc<KeyHandle>> {
        self.session.lock().unwrap().as_ref().map(|s| s.general_key.clone()).ok_or(Error::EncryptionUnavailable)
    }

    pub fn current_version(&self) -> Option<u32> {
        self.session.lock().unwrap().as_ref().map(|s| s.meta.version)
    }

    pub fn clear_session(&self) {
        *self.session.lock().unwrap() = None;
        log::info!("key session cleared");
    }

    /// Rotation is required when the recorded rotation timestamp is older
    /// than 30 days.
    pub fn needs_rotation(&self, sync_kv: &dyn SyncKvStore, clock: &dyn Clock) -> CResult<bool> {
        let Some(last) = sync_kv.get(ROTATION_TIMESTAMP_KEY)? else { return Ok(false) };
        let last_ms: i64 = last.parse().map_err(|_| Error::Parse("rotation timestamp".into()))?;
        Ok(clock.now_ms() - last_ms >= ROTATION_INTERVAL_MS)
    }

    /// Increments the session version, re-derives all three keys, and
    /// persists the new rotation timestamp. Old persisted ciphertexts carry
    /// their own key version and remain readable until migrated.
    pub fn rotate_keys(
        &self,
        fingerprint_inputs: &DeviceFingerprintInputs,
        sync_kv: &dyn SyncKvStore,
        clock: &dyn Clock,
    ) -> CResult<()> {
        let mut session = self.session.lock().unwrap();
        let Some(current) = session.as_mut() else { return Err(Error::EncryptionUnavailable) };

        let device_id = get_or_create_device_id(sync_kv)?;
        let fingerprint = device_fingerprint(fingerprint_inputs, &device_id);
        let next_version = current.meta.version + 1;
        let iterations = self.iterations();

        let (data_key, signing_key, general_key) =
            Self::derive_all(&current.meta.session_salt, next_version, &fingerprint, &current.password, iterations)
                .map_err(|_| Error::KdfFailure("rotation derivation failed".into()))?;

        let now_ms = clock.now_ms();
        sync_kv.set(ROTATION_TIMESTAMP_KEY, &now_ms.to_string())?;

        current.meta.version = next_version;
        current.data_key = Arc::new(data_key);
        current.signing_key = Arc::new(signing_key);
        current.general_key = Arc::new(general_key);
        log::info!("key session rotated to version {next_version}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{FixedClock, MemorySyncKv};

    struct NeverSecure;
    impl SecureContextCheck for NeverSecure {
        fn check(&self) -> CResult<()> {
            Err(Error::InsecureContext)
        }
    }

    fn fingerprint_inputs() -> DeviceFingerprintInputs {
        DeviceFingerprintInputs {
            user_agent: "test-agent".into(),
            language: "en-US".into(),
            hardware_concurrency: 8,
            origin: "https://example.test".into(),
        }
    }

    #[test]
    fn initialize_session_requires_secure_context() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        let result = manager.initialize_session("hunter2!", &fingerprint_inputs(), &NeverSecure, &kv, &clock);
        assert!(matches!(result, Err(Error::InsecureContext)));
    }

    #[test]
    fn initialize_session_rejects_weak_password() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        let result = manager.initialize_session("short", &fingerprint_inputs(), &AlwaysSecure, &kv, &clock);
        assert!(matches!(result, Err(Error::WeakPassword)));
    }

    #[test]
    fn initialize_session_derives_usable_keys() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(1_000);
        manager.initialize_session("correct horse battery staple", &fingerprint_inputs(), &AlwaysSecure, &kv, &clock).unwrap();

        assert!(manager.is_session_active());
        assert_eq!(manager.current_version(), Some(1));
        assert!(manager.get_data_key().is_ok());
        assert_ne!(manager.get_data_key().unwrap().bytes(), manager.get_signing_key().unwrap().bytes());
    }

    #[test]
    fn clear_session_invalidates_key_access() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        manager.initialize_session("correct horse battery staple", &fingerprint_inputs(), &AlwaysSecure, &kv, &clock).unwrap();
        manager.clear_session();
        assert!(!manager.is_session_active());
        assert!(manager.get_data_key().is_err());
    }

    #[test]
    fn rotation_required_after_30_days() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        manager.initialize_session("correct horse battery staple", &fingerprint_inputs(), &AlwaysSecure, &kv, &clock).unwrap();

        assert!(!manager.needs_rotation(&kv, &clock).unwrap());
        clock.advance(ROTATION_INTERVAL_MS + 1);
        assert!(manager.needs_rotation(&kv, &clock).unwrap());

        let before = manager.get_data_key().unwrap();
        manager.rotate_keys(&fingerprint_inputs(), &kv, &clock).unwrap();
        assert_eq!(manager.current_version(), Some(2));
        assert_ne!(before.bytes(), manager.get_data_key().unwrap().bytes());
    }

    #[test]
    fn device_id_persists_across_calls() {
        let kv = MemorySyncKv::new();
        let first = get_or_create_device_id(&kv).unwrap();
        let second = get_or_create_device_id(&kv).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hmac_sign_verify_round_trips_under_the_signing_key() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        manager.initialize_session("correct horse battery staple", &fingerprint_inputs(), &AlwaysSecure, &kv, &clock).unwrap();

        let signing_key = manager.get_signing_key().unwrap();
        let tag = hmac_sign(b"compensation-entry-tx-1", &signing_key);
        assert!(hmac_verify(b"compensation-entry-tx-1", &tag, &signing_key));
        assert!(!hmac_verify(b"tampered-entry-tx-1", &tag, &signing_key));
    }

    #[test]
    fn hmac_verify_rejects_tags_from_a_different_key() {
        let manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        manager.initialize_session("correct horse battery staple", &fingerprint_inputs(), &AlwaysSecure, &kv, &clock).unwrap();
        let signing_key = manager.get_signing_key().unwrap();
        let data_key = manager.get_data_key().unwrap();

        let tag = hmac_sign(b"payload", &signing_key);
        assert!(!hmac_verify(b"payload", &tag, &data_key));
    }
}
