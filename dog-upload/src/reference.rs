//! Signed blob references.
//!
//! A reference is `base64url(payload) "." base64url(tag)` where the payload is
//! a small JSON document naming the blob key, its expiry and the purpose the
//! token was minted for, and the tag is HMAC-SHA256 over the encoded payload.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::BlobKey;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = '.';
const BLOB_PURPOSE: &str = "blob_id";

/// Why a reference failed verification.
///
/// Only ever logged; callers outside the crate see a single
/// `UploadError::InvalidReference`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference is malformed")]
    Malformed,

    #[error("reference signature does not match")]
    Tampered,

    #[error("reference expired at {0}")]
    Expired(DateTime<Utc>),
}

impl ReferenceError {
    /// Malformed tokens are treated as tampering: both mean the bytes are not
    /// what we issued.
    pub fn is_tampering(&self) -> bool {
        matches!(self, Self::Malformed | Self::Tampered)
    }
}

#[derive(Serialize, Deserialize)]
struct Claims {
    key: String,
    exp: i64,
    pur: String,
}

/// Mints and verifies tamper-evident, expiring stand-ins for blob keys
#[derive(Clone)]
pub struct SignedReferenceCodec {
    secret: Vec<u8>,
    purpose: String,
}

impl std::fmt::Debug for SignedReferenceCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedReferenceCodec")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl SignedReferenceCodec {
    pub fn new<S: Into<Vec<u8>>>(secret: S) -> Self {
        Self {
            secret: secret.into(),
            purpose: BLOB_PURPOSE.to_string(),
        }
    }

    /// Scope tokens to another purpose; tokens from other purposes will not verify
    pub fn with_purpose<S: Into<String>>(mut self, purpose: S) -> Self {
        self.purpose = purpose.into();
        self
    }

    /// Sign `key` so that it verifies until `expires_at`
    pub fn sign(&self, key: &BlobKey, expires_at: DateTime<Utc>) -> String {
        let claims = Claims {
            key: key.as_str().to_string(),
            exp: expires_at.timestamp(),
            pur: self.purpose.clone(),
        };
        // A struct of strings and integers always serializes.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(payload);
        let tag = URL_SAFE_NO_PAD.encode(self.mac(encoded.as_bytes()).finalize().into_bytes());
        format!("{}{}{}", encoded, SEPARATOR, tag)
    }

    pub fn verify(&self, token: &str) -> Result<BlobKey, ReferenceError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify against an explicit clock.
    ///
    /// The tag is checked in constant time before anything in the payload is
    /// trusted; purpose and expiry are only looked at afterwards.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<BlobKey, ReferenceError> {
        let (encoded, tag) = token.split_once(SEPARATOR).ok_or(ReferenceError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| ReferenceError::Malformed)?;

        self.mac(encoded.as_bytes())
            .verify_slice(&tag)
            .map_err(|_| ReferenceError::Tampered)?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| ReferenceError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| ReferenceError::Malformed)?;

        if claims.pur != self.purpose {
            return Err(ReferenceError::Tampered);
        }

        let expires_at =
            DateTime::<Utc>::from_timestamp(claims.exp, 0).ok_or(ReferenceError::Malformed)?;
        if now >= expires_at {
            return Err(ReferenceError::Expired(expires_at));
        }

        Ok(BlobKey::from_string(claims.key))
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any size"));
        mac.update(data);
        mac
    }
}
