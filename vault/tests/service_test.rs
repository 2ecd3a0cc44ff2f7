//! Key lifecycle and data operation behavior at the service boundary.

use std::sync::Arc;

use secvault::storage::KeyStorage;
use secvault::{
    CipherConfig, DataService, EncryptedStorage, EventBus, KdfConfig, KeyService, MemoryBackend,
    ServiceShared, UsageDelta, UsageFlags, VaultError,
};
use secvault_cipher::{registry, CipherOptions, Digest, KdfOptions};

const SECRET: &[u8] = b"service test master secret";

struct Stack {
    storage: Arc<dyn KeyStorage>,
    keys: KeyService,
    data: DataService,
}

async fn stack() -> Stack {
    stack_with_limit(10_000).await
}

async fn stack_with_limit(failure_limit: u64) -> Stack {
    let backend = MemoryBackend::new(EventBus::new());
    let storage: Arc<dyn KeyStorage> = Arc::new(EncryptedStorage::new(backend));
    let shared = Arc::new(ServiceShared::new(Arc::clone(&storage), failure_limit));
    let keys = KeyService::new(
        Arc::clone(&shared),
        CipherConfig::default(),
        KdfConfig::default(),
    );
    keys.unlock(SECRET).await.unwrap();
    let data = DataService::new(shared);
    Stack {
        storage,
        keys,
        data,
    }
}

fn flags(encrypt: bool, sign: bool, derive: bool, shared: bool) -> UsageFlags {
    UsageFlags {
        encrypt,
        sign,
        derive,
        shared,
        temp: false,
    }
}

fn bits(n: u32) -> serde_json::Map<String, serde_json::Value> {
    let mut params = serde_json::Map::new();
    params.insert("bits".into(), serde_json::Value::from(n));
    params
}

#[tokio::test]
async fn generate_is_idempotent_per_external_id() {
    let s = stack().await;
    let first = s
        .keys
        .generate_key("app.master", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();
    let second = s
        .keys
        .generate_key("app.master", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();
    assert_eq!(first, second);

    // same name, different request: reject instead of overwrite
    assert!(matches!(
        s.keys
            .generate_key("app.master", flags(true, false, false, false), "AES", bits(128))
            .await,
        Err(VaultError::OrigMismatch(_))
    ));
    assert!(matches!(
        s.keys
            .generate_key("app.master", flags(true, true, false, false), "AES", bits(256))
            .await,
        Err(VaultError::OrigMismatch(_))
    ));
}

#[tokio::test]
async fn concurrent_generate_converges_to_one_winner() {
    let s = stack().await;
    let f = flags(true, false, false, false);
    let (a, b) = tokio::join!(
        s.keys.generate_key("raced", f, "AES", bits(128)),
        s.keys.generate_key("raced", f, "AES", bits(128)),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(s.keys.list_keys(Some("raced")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn inject_checks_material_equality() {
    let s = stack().await;
    let raw = [0xC3u8; 32];
    let f = flags(true, false, false, false);
    let id = s
        .keys
        .inject_key("imported", f, "AES", bits(256), &raw)
        .await
        .unwrap();
    // identical re-inject resolves to the same key
    assert_eq!(
        s.keys
            .inject_key("imported", f, "AES", bits(256), &raw)
            .await
            .unwrap(),
        id
    );
    // different bytes under the same name must not silently win
    assert!(matches!(
        s.keys
            .inject_key("imported", f, "AES", bits(256), &[0u8; 32])
            .await,
        Err(VaultError::OrigMismatch(_))
    ));
}

#[tokio::test]
async fn creation_rejects_bad_types_and_lengths() {
    let s = stack().await;
    let f = flags(true, false, false, false);
    assert!(matches!(
        s.keys.generate_key("exotic", f, "Curve448", bits(256)).await,
        Err(VaultError::UnsupportedType(_))
    ));
    assert!(matches!(
        s.keys.generate_key("tiny", f, "AES", bits(64)).await,
        Err(VaultError::NotSupported(_))
    ));
    // nothing was persisted for the failed attempts
    assert!(s.keys.list_keys(Some("tiny")).await.unwrap().is_empty());
}

#[tokio::test]
async fn capability_flags_gate_their_operations() {
    let s = stack().await;
    let none = flags(false, false, false, false);
    let id = s
        .keys
        .generate_key("capless", none, "AES", bits(256))
        .await
        .unwrap();
    let kek = s
        .keys
        .generate_key("kek", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();

    let opts = CipherOptions::default();
    assert!(matches!(
        s.data.encrypt(&id, b"data", &opts).await,
        Err(VaultError::NotApplicable)
    ));
    assert!(matches!(
        s.data.sign(&id, b"data", &opts).await,
        Err(VaultError::NotApplicable)
    ));
    assert!(matches!(
        s.keys.expose_key(&id).await,
        Err(VaultError::NotApplicable)
    ));
    assert!(matches!(
        s.keys.encrypted_key(&id, &kek, None).await,
        Err(VaultError::NotApplicable)
    ));
    assert!(matches!(
        s.keys
            .derive_key(
                "derived-from-capless",
                none,
                "AES",
                bits(128),
                &id,
                "HKDF",
                Digest::Sha256,
                KdfOptions::default(),
            )
            .await,
        Err(VaultError::NotApplicable)
    ));
}

#[tokio::test]
async fn failure_ceiling_quarantines_key() {
    let s = stack_with_limit(2).await;
    let id = s
        .keys
        .generate_key("bruteforced", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();

    s.storage
        .update_usage(&id, &UsageDelta::new(0, 0, 3))
        .await
        .unwrap();
    assert!(matches!(
        s.data.encrypt(&id, b"data", &CipherOptions::default()).await,
        Err(VaultError::SecurityError(_))
    ));
}

#[tokio::test]
async fn encrypt_decrypt_round_trip_updates_stats() {
    let s = stack().await;
    let id = s
        .keys
        .generate_key("worker", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();

    let opts = CipherOptions::default();
    let message = b"attack at dawn";
    let envelope = s.data.encrypt(&id, message, &opts).await.unwrap();
    let plain = s.data.decrypt(&id, &envelope, &opts).await.unwrap();
    assert_eq!(&*plain, message);

    let info = s.keys.key_info(&id).await.unwrap();
    assert_eq!(info.stats.times, 2);
    assert_eq!(info.stats.failures, 0);
    assert_eq!(
        info.stats.bytes,
        (message.len() + envelope.len()) as u64
    );
}

#[tokio::test]
async fn decrypt_failure_is_coarse_and_counted() {
    let s = stack().await;
    let id = s
        .keys
        .generate_key("victim", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();

    // GCM: any corruption trips the auth tag deterministically
    let opts = CipherOptions {
        mode: Some(secvault_cipher::AesMode::Gcm),
        ..Default::default()
    };
    let mut envelope = s.data.encrypt(&id, b"payload", &opts).await.unwrap();
    envelope[0] ^= 0x80;
    assert!(matches!(
        s.data.decrypt(&id, &envelope, &opts).await,
        Err(VaultError::InvalidData)
    ));
    assert_eq!(s.keys.key_info(&id).await.unwrap().stats.failures, 1);
}

#[tokio::test]
async fn sign_verify_with_hmac_key() {
    let s = stack().await;
    let id = s
        .keys
        .generate_key("signer", flags(false, true, false, false), "HMAC", bits(256))
        .await
        .unwrap();

    let opts = CipherOptions {
        digest: Some(Digest::Sha256),
        ..Default::default()
    };
    let sig = s.data.sign(&id, b"message", &opts).await.unwrap();
    s.data.verify(&id, b"message", &sig, &opts).await.unwrap();

    let mut bad = sig.clone();
    bad[0] ^= 1;
    assert!(matches!(
        s.data.verify(&id, b"message", &bad, &opts).await,
        Err(VaultError::InvalidSignature)
    ));
    assert!(matches!(
        s.data.verify(&id, b"other message", &sig, &opts).await,
        Err(VaultError::InvalidSignature)
    ));
    assert_eq!(s.keys.key_info(&id).await.unwrap().stats.failures, 2);
}

#[tokio::test]
async fn shared_keys_can_be_exported() {
    let s = stack().await;
    let raw = [0x77u8; 32];
    let id = s
        .keys
        .inject_key("exportable", flags(false, false, false, true), "AES", bits(256), &raw)
        .await
        .unwrap();
    let kek = s
        .keys
        .generate_key("wrapper", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();

    assert_eq!(&*s.keys.expose_key(&id).await.unwrap(), &raw[..]);

    let wrapped = s.keys.encrypted_key(&id, &kek, None).await.unwrap();
    let unwrapped = s
        .data
        .decrypt(&kek, &wrapped, &CipherOptions::default())
        .await
        .unwrap();
    assert_eq!(&*unwrapped, &raw[..]);
}

#[tokio::test]
async fn inject_encrypted_key_unwraps_under_kek() {
    let s = stack().await;
    let kek_raw = [0x21u8; 32];
    let kek = s
        .keys
        .inject_key("transport-kek", flags(true, false, false, false), "AES", bits(256), &kek_raw)
        .await
        .unwrap();

    let secret = [0x99u8; 32];
    let aes = registry::get("AES").unwrap();
    let blob = aes
        .encrypt(&kek_raw, &secret, &CipherOptions::default())
        .unwrap();

    let id = s
        .keys
        .inject_encrypted_key(
            "unwrapped",
            flags(false, false, false, true),
            "AES",
            bits(256),
            &blob,
            &kek,
            None,
        )
        .await
        .unwrap();
    assert_eq!(&*s.keys.expose_key(&id).await.unwrap(), &secret[..]);
}

#[tokio::test]
async fn derive_key_matches_direct_kdf() {
    let s = stack().await;
    let base_raw = [0x42u8; 32];
    let base = s
        .keys
        .inject_key("base", flags(false, false, true, false), "AES", bits(256), &base_raw)
        .await
        .unwrap();

    let options = KdfOptions {
        salt: Some(b"pepper".to_vec()),
        info: Some(b"session".to_vec()),
        rounds: None,
    };
    let derived = s
        .keys
        .derive_key(
            "session-key",
            flags(false, false, false, true),
            "AES",
            bits(256),
            &base,
            "HKDF",
            Digest::Sha256,
            options.clone(),
        )
        .await
        .unwrap();

    let expected = registry::get("HKDF")
        .unwrap()
        .derive(&base_raw, 256, Digest::Sha256, &options)
        .unwrap();
    assert_eq!(
        &*s.keys.expose_key(&derived).await.unwrap(),
        expected.as_slice()
    );
}

#[tokio::test]
async fn rsa_keys_expose_public_half() {
    let s = stack().await;
    let id = s
        .keys
        .generate_key("rsa-pair", flags(false, false, false, true), "RSA", bits(1024))
        .await
        .unwrap();

    let pem = s.keys.public_key(&id).await.unwrap();
    let pem = String::from_utf8(pem).unwrap();
    assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

    // the derived public half is cached as a parameter at creation
    let info = s.keys.key_info(&id).await.unwrap();
    assert_eq!(info.params["pubkey"].as_str(), Some(pem.as_str()));

    let aes = s
        .keys
        .generate_key("plain-aes", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();
    assert!(matches!(
        s.keys.public_key(&aes).await,
        Err(VaultError::NotApplicable)
    ));
}

#[tokio::test]
async fn pub_encrypted_key_targets_external_recipient() {
    let s = stack().await;
    let raw = [0x0Fu8; 32];
    let id = s
        .keys
        .inject_key("handoff", flags(false, false, false, true), "AES", bits(256), &raw)
        .await
        .unwrap();

    let rsa = registry::get("RSA").unwrap();
    let private_pem = rsa
        .generate(&CipherOptions {
            bits: Some(1024),
            ..Default::default()
        })
        .unwrap();
    let public_pem = rsa.pubkey(&private_pem).unwrap();

    let wrapped = s.keys.pub_encrypted_key(&id, &public_pem).await.unwrap();
    let unwrapped = rsa
        .decrypt(&private_pem, &wrapped, &CipherOptions::default())
        .unwrap();
    assert_eq!(&*unwrapped, &raw[..]);
}

#[tokio::test]
async fn wipe_key_removes_the_record() {
    let s = stack().await;
    let id = s
        .keys
        .generate_key("doomed", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();
    s.keys.wipe_key(&id).await.unwrap();
    assert!(matches!(
        s.keys.key_info(&id).await,
        Err(VaultError::UnknownKeyID(_))
    ));
    assert!(matches!(
        s.keys.wipe_key(&id).await,
        Err(VaultError::UnknownKeyID(_))
    ));
}

#[tokio::test]
async fn key_info_never_carries_material() {
    let s = stack().await;
    let raw = [0xEEu8; 32];
    let id = s
        .keys
        .inject_key("scrutinized", flags(true, false, false, false), "AES", bits(256), &raw)
        .await
        .unwrap();

    let info = s.keys.key_info(&id).await.unwrap();
    let json = serde_json::to_string(&info).unwrap();
    assert!(!json.contains("raw"));
    assert!(!json.contains("data"));

    let by_ext = s.keys.key_info_ext("scrutinized").await.unwrap();
    assert_eq!(by_ext.id, id);
    assert_eq!(by_ext.key_type, "AES");
}

#[tokio::test]
async fn lock_blocks_data_operations() {
    let s = stack().await;
    let id = s
        .keys
        .generate_key("daywork", flags(true, false, false, false), "AES", bits(256))
        .await
        .unwrap();

    s.keys.lock().await.unwrap();
    assert!(s.keys.is_locked());
    assert!(matches!(
        s.data.encrypt(&id, b"data", &CipherOptions::default()).await,
        Err(VaultError::LockedStorage)
    ));
    // metadata stays available while locked
    assert_eq!(s.keys.key_info(&id).await.unwrap().ext_id, "daywork");

    assert!(matches!(
        s.keys.unlock(b"wrong secret").await,
        Err(VaultError::InvalidSecret)
    ));
    s.keys.unlock(SECRET).await.unwrap();
    let envelope = s
        .data
        .encrypt(&id, b"data", &CipherOptions::default())
        .await
        .unwrap();
    assert!(!envelope.is_empty());
}
