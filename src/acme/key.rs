//! Key and crypto primitives (C1): account key lifecycle, JWK/thumbprint
//! encoding, JWS signing, and per-certificate CSR generation.
//!
//! `ring` handles the long-lived account key (fixed ECDSA P-256 signing, no
//! ASN.1 to unpack because `ECDSA_P256_SHA256_FIXED_SIGNING` already emits
//! raw `r‖s`); `rcgen` handles the short-lived per-domain certificate key
//! and its CSR.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use super::error::{AcmeError, Result};

/// Canonical JWK for a P-256 public key. Field order matches RFC 7638's
/// lexicographic requirement (`crv`, `kty`, `x`, `y`) and serde preserves
/// declaration order, so `serde_json::to_string` is already canonical.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Jwk {
    pub crv: &'static str,
    pub kty: &'static str,
    pub x: String,
    pub y: String,
}

/// A persisted ECDSA P-256 account key.
///
/// `ring`'s `EcdsaKeyPair` borrows its RNG for signing and isn't `Clone`, so
/// only the PKCS#8 document is kept; the signing key pair is reconstructed
/// on demand.
pub struct AccountKey {
    pkcs8: Vec<u8>,
}

impl AccountKey {
    fn key_pair(&self) -> Result<EcdsaKeyPair> {
        EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_FIXED_SIGNING,
            &self.pkcs8,
            &SystemRandom::new(),
        )
        .map_err(|_| AcmeError::Storage("account key is not a valid PKCS#8 ECDSA key".into()))
    }

    /// Generate a fresh account key, independent of any persisted state.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| AcmeError::Storage("failed to generate account key".into()))?;
        Ok(Self {
            pkcs8: doc.as_ref().to_vec(),
        })
    }

    fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Self> {
        let key = Self { pkcs8 };
        key.key_pair()?;
        Ok(key)
    }

    /// Sign `data` with ES256, returning the fixed-width `r‖s` signature.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key_pair = self.key_pair()?;
        let rng = SystemRandom::new();
        let sig = key_pair
            .sign(&rng, data)
            .map_err(|_| AcmeError::Transport("JWS signing failed".into()))?;
        Ok(sig.as_ref().to_vec())
    }

    /// The canonical JWK for this key's public component.
    pub fn public_jwk(&self) -> Result<Jwk> {
        let key_pair = self.key_pair()?;
        jwk_from_uncompressed_point(key_pair.public_key().as_ref())
    }

    /// RFC 7638 JWK thumbprint, base64url-encoded (no padding).
    pub fn thumbprint(&self) -> Result<String> {
        jwk_thumbprint(&self.public_jwk()?)
    }
}

fn jwk_from_uncompressed_point(point: &[u8]) -> Result<Jwk> {
    // Uncompressed SEC1 point: 0x04 || X (32 bytes) || Y (32 bytes).
    if point.len() != 65 || point[0] != 0x04 {
        return Err(AcmeError::Storage(
            "unexpected public key point encoding".into(),
        ));
    }
    let x = &point[1..33];
    let y = &point[33..65];
    Ok(Jwk {
        crv: "P-256",
        kty: "EC",
        x: URL_SAFE_NO_PAD.encode(x),
        y: URL_SAFE_NO_PAD.encode(y),
    })
}

/// RFC 7638 thumbprint of an arbitrary JWK: SHA-256 of its canonical JSON
/// serialization, base64url-encoded.
pub fn jwk_thumbprint(jwk: &Jwk) -> Result<String> {
    let canonical = serde_json::to_string(jwk)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

/// The HTTP-01 key authorization: `token` + `.` + thumbprint(account key).
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{token}.{thumbprint}")
}

/// Load the persisted account key from `path`, or generate and persist a
/// fresh one if the file is absent or unreadable as a PKCS#8 ECDSA key.
///
/// The key is stored PEM-encoded (`PRIVATE KEY` / PKCS#8) with `0600`
/// permissions, written via a temp-file-then-rename so a crash mid-write
/// never leaves a torn file behind.
pub async fn get_or_create_account_key(path: &Path) -> Result<AccountKey> {
    if let Ok(pem_text) = tokio::fs::read_to_string(path).await {
        if let Some(key) = decode_pkcs8_pem(&pem_text).and_then(|der| AccountKey::from_pkcs8(der).ok())
        {
            return Ok(key);
        }
    }

    let key = AccountKey::generate()?;
    let pem_text = encode_pkcs8_pem(&key.pkcs8);
    crate::util::atomic_write(path, pem_text.as_bytes(), 0o600).await?;
    Ok(key)
}

fn encode_pkcs8_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("PRIVATE KEY", der.to_vec()))
}

fn decode_pkcs8_pem(text: &str) -> Option<Vec<u8>> {
    pem::parse(text).ok().map(|p| p.contents().to_vec())
}

/// Generate a fresh per-domain certificate key and a CSR for `domains`,
/// returning (key PEM, CSR DER). Distinct from the account key: a fresh
/// `rcgen::KeyPair` per issuance, never persisted across renewals.
pub fn create_csr(domains: &[String]) -> Result<(String, Vec<u8>)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let first = domains
        .first()
        .ok_or_else(|| AcmeError::Validation("CSR requires at least one domain".into()))?;

    let key_pair =
        KeyPair::generate().map_err(|e| AcmeError::Storage(format!("CSR key generation failed: {e}")))?;
    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|e| AcmeError::Validation(format!("invalid CSR domain list: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, first.clone());
    params.distinguished_name = dn;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::Storage(format!("CSR serialization failed: {e}")))?;
    Ok((key_pair.serialize_pem(), csr.der().to_vec()))
}
