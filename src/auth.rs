use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use log::{info, warn};
use rand::rngs::OsRng;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::protocol::AdbError;

/// PKCS#1 v1.5 DigestInfo prefix for SHA-1 (standard 15-byte DER form).
const SHA1_DIGEST_INFO: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

const SHA1_LEN: usize = 20;
const KEY_BITS: usize = 2048;

/// Persistent host RSA key pair used for the AUTH handshake.
///
/// The raw modulus and exponents are kept so the token signature and
/// the Android public-key blob can be computed directly; the `rsa`
/// crate is used for key generation only.
pub struct AdbKeyPair {
    n: BigUint,
    e: BigUint,
    d: BigUint,
    blob: OnceLock<Vec<u8>>,
}

impl AdbKeyPair {
    /// Generate a new 2048-bit key pair with public exponent 65537.
    pub fn generate() -> Result<Self, AdbError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| AdbError::Internal(format!("failed to generate key: {e}")))?;

        Ok(Self {
            n: private_key.n().clone(),
            e: private_key.e().clone(),
            d: private_key.d().clone(),
            blob: OnceLock::new(),
        })
    }

    /// Rebuild the pair from the JWK documents held by the key store.
    /// Only the base64url `n`, `d` and `e` members are read.
    pub fn from_jwk(private_jwk: &str, public_jwk: &str) -> Result<Self, AdbError> {
        let private: RsaJwk = serde_json::from_str(private_jwk)
            .map_err(|e| AdbError::Internal(format!("malformed private key JWK: {e}")))?;
        let public: RsaJwk = serde_json::from_str(public_jwk)
            .map_err(|e| AdbError::Internal(format!("malformed public key JWK: {e}")))?;

        if private.kty != "RSA" || public.kty != "RSA" {
            return Err(AdbError::Internal("key store holds a non-RSA key".into()));
        }
        let d = private
            .d
            .as_deref()
            .ok_or_else(|| AdbError::Internal("private key JWK is missing 'd'".into()))?;

        Ok(Self {
            n: jwk_uint(&private.n)?,
            e: jwk_uint(&public.e)?,
            d: jwk_uint(d)?,
            blob: OnceLock::new(),
        })
    }

    /// Export the pair as `(private_jwk, public_jwk)` JSON documents.
    pub fn to_jwk(&self) -> Result<(String, String), AdbError> {
        let n = uint_jwk(&self.n);
        let e = uint_jwk(&self.e);
        let private = RsaJwk {
            kty: "RSA".into(),
            n: n.clone(),
            e: e.clone(),
            d: Some(uint_jwk(&self.d)),
        };
        let public = RsaJwk {
            kty: "RSA".into(),
            n,
            e,
            d: None,
        };
        let encode = |jwk: &RsaJwk| {
            serde_json::to_string(jwk).map_err(|e| AdbError::Internal(format!("JWK encode failed: {e}")))
        };
        Ok((encode(&private)?, encode(&public)?))
    }

    /// Load the host key from `store`, generating and persisting a new
    /// pair on first use (or when the stored material is unreadable).
    pub async fn load_or_generate(store: &dyn KeyStore) -> Result<Arc<Self>, AdbError> {
        if let Some((private_jwk, public_jwk)) = store.load_key().await? {
            match Self::from_jwk(&private_jwk, &public_jwk) {
                Ok(key) => {
                    info!("loaded host key pair from the key store");
                    return Ok(Arc::new(key));
                }
                Err(e) => warn!("stored host key is unusable ({e}), generating a new one"),
            }
        }

        info!("generating a new host key pair");
        let key = Self::generate()?;
        let (private_jwk, public_jwk) = key.to_jwk()?;
        store.store_key(&private_jwk, &public_jwk).await?;
        Ok(Arc::new(key))
    }

    /// Modulus length in bytes (256 for a 2048-bit key).
    pub fn modulus_len(&self) -> usize {
        self.n.to_bytes_be().len()
    }

    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    pub fn public_exponent(&self) -> &BigUint {
        &self.e
    }

    /// The Android public-key blob: `len` in 32-bit words, `n0inv`,
    /// the modulus little-endian, `R² mod n` little-endian, and the
    /// public exponent, all little-endian. 524 bytes for a 2048-bit
    /// key. Computed once and cached.
    pub fn android_blob(&self) -> &[u8] {
        self.blob.get_or_init(|| {
            let mod_len = self.modulus_len();
            let words = (mod_len / 4) as u32;

            let n_le = pad_le(self.n.to_bytes_le(), mod_len);
            let n0 = u32::from_le_bytes([n_le[0], n_le[1], n_le[2], n_le[3]]);

            let rr = (BigUint::from(1u8) << (mod_len * 8 * 2)) % &self.n;
            let rr_le = pad_le(rr.to_bytes_le(), mod_len);

            let mut e_le = [0u8; 4];
            let e_bytes = self.e.to_bytes_le();
            e_le[..e_bytes.len()].copy_from_slice(&e_bytes);

            let mut blob = Vec::with_capacity(8 + mod_len * 2 + 4);
            blob.extend_from_slice(&words.to_le_bytes());
            blob.extend_from_slice(&n0inv(n0).to_le_bytes());
            blob.extend_from_slice(&n_le);
            blob.extend_from_slice(&rr_le);
            blob.extend_from_slice(&e_le);
            blob
        })
    }

    /// The `AUTH_RSAPUBLICKEY` payload: the blob base64-encoded
    /// (standard alphabet, padded), a space, an identifier, and a NUL.
    pub fn public_key_payload(&self, comment: &str) -> Vec<u8> {
        let mut payload = general_purpose::STANDARD.encode(self.android_blob()).into_bytes();
        payload.push(b' ');
        payload.extend_from_slice(comment.as_bytes());
        payload.push(0);
        payload
    }

    /// Sign an AUTH token with PKCS#1 v1.5 SHA-1 padding.
    ///
    /// The token is normally the 20-byte challenge from the device and
    /// is used as the digest directly; any other length is hashed with
    /// SHA-1 first.
    pub fn sign_token(&self, token: &[u8]) -> Result<Vec<u8>, AdbError> {
        let digest: Vec<u8> = if token.len() == SHA1_LEN {
            token.to_vec()
        } else {
            Sha1::digest(token).to_vec()
        };

        let em = emsa_pkcs1_v15_sha1(&digest, self.modulus_len())?;
        let signature = BigUint::from_bytes_be(&em).modpow(&self.d, &self.n);

        let mut out = vec![0u8; self.modulus_len()];
        let sig_bytes = signature.to_bytes_be();
        out[self.modulus_len() - sig_bytes.len()..].copy_from_slice(&sig_bytes);
        Ok(out)
    }
}

/// EMSA-PKCS1-v1_5 encoding for a SHA-1 digest:
/// `00 01 FF…FF 00 DigestInfo digest`, `em_len` bytes total.
pub fn emsa_pkcs1_v15_sha1(digest: &[u8], em_len: usize) -> Result<Vec<u8>, AdbError> {
    if digest.len() != SHA1_LEN {
        return Err(AdbError::Internal(format!("digest must be {SHA1_LEN} bytes")));
    }
    let overhead = 3 + SHA1_DIGEST_INFO.len() + SHA1_LEN;
    if em_len < overhead {
        return Err(AdbError::Internal("modulus too short for PKCS#1 padding".into()));
    }

    let mut em = Vec::with_capacity(em_len);
    em.push(0x00);
    em.push(0x01);
    em.resize(em_len - SHA1_DIGEST_INFO.len() - SHA1_LEN - 1, 0xff);
    em.push(0x00);
    em.extend_from_slice(&SHA1_DIGEST_INFO);
    em.extend_from_slice(digest);
    Ok(em)
}

/// The 32-bit value with `n0 * n0inv ≡ -1 (mod 2³²)`, computed by the
/// extended Euclidean algorithm on the low modulus word.
pub fn n0inv(n0: u32) -> u32 {
    let modulus: i64 = 1 << 32;
    let (mut r0, mut r1) = (modulus, n0 as i64);
    let (mut t0, mut t1) = (0i64, 1i64);
    while r1 != 0 {
        let q = r0 / r1;
        (r0, r1) = (r1, r0 - q * r1);
        (t0, t1) = (t1, t0 - q * t1);
    }
    // r0 == 1 because the modulus of an RSA key is odd.
    let inverse = t0.rem_euclid(modulus) as u32;
    inverse.wrapping_neg()
}

fn pad_le(mut bytes: Vec<u8>, len: usize) -> Vec<u8> {
    bytes.resize(len, 0);
    bytes
}

fn jwk_uint(field: &str) -> Result<BigUint, AdbError> {
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(field)
        .map_err(|e| AdbError::Internal(format!("bad base64url in JWK: {e}")))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn uint_jwk(value: &BigUint) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

#[derive(Serialize, Deserialize)]
struct RsaJwk {
    kty: String,
    n: String,
    e: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    d: Option<String>,
}

/// The persistent key-store collaborator. Values are opaque JSON JWK
/// documents; the crate never inspects them beyond `n`, `d` and `e`.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load_key(&self) -> Result<Option<(String, String)>, AdbError>;
    async fn store_key(&self, private_jwk: &str, public_jwk: &str) -> Result<(), AdbError>;
}

/// Key store that keeps the pair in memory only. Useful for tests and
/// for callers that manage persistence themselves.
#[derive(Default)]
pub struct MemoryKeyStore {
    key: parking_lot::Mutex<Option<(String, String)>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with an existing pair.
    pub fn with_key(private_jwk: String, public_jwk: String) -> Self {
        Self {
            key: parking_lot::Mutex::new(Some((private_jwk, public_jwk))),
        }
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load_key(&self) -> Result<Option<(String, String)>, AdbError> {
        Ok(self.key.lock().clone())
    }

    async fn store_key(&self, private_jwk: &str, public_jwk: &str) -> Result<(), AdbError> {
        *self.key.lock() = Some((private_jwk.to_string(), public_jwk.to_string()));
        Ok(())
    }
}
