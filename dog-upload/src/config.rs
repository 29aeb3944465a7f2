use std::env;
use std::time::Duration;

use crate::{UploadError, UploadResult};

/// Configuration for upload ticket issuance
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Secret used to sign blob references handed to clients
    pub signing_secret: Vec<u8>,

    /// Lifetime of presigned upload URLs (single-shot and per part)
    pub upload_url_ttl: Duration,

    /// Lifetime of signed blob references
    pub reference_ttl: Duration,

    /// Absolute max size a client may declare for a single blob (safety guard)
    pub max_byte_size: u64,

    /// Upper bound on part numbers for multipart uploads
    pub max_parts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            signing_secret: Vec::new(),
            upload_url_ttl: Duration::from_secs(5 * 60),
            reference_ttl: Duration::from_secs(60 * 60),
            max_byte_size: 5 * 1024 * 1024 * 1024 * 1024, // 5TB, the S3 object ceiling
            max_parts: 10_000,
        }
    }
}

impl UploadConfig {
    /// Create a config with defaults and the given signing secret
    pub fn new<S: Into<Vec<u8>>>(signing_secret: S) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            ..Self::default()
        }
    }

    /// Load from `DIRECT_UPLOAD_*` environment variables.
    ///
    /// `DIRECT_UPLOAD_SECRET` is required; every other variable falls back to
    /// the default when unset.
    pub fn from_env() -> UploadResult<Self> {
        let secret = env::var("DIRECT_UPLOAD_SECRET").map_err(|_| {
            UploadError::configuration("DIRECT_UPLOAD_SECRET environment variable required")
        })?;

        let mut config = Self::new(secret);
        if let Some(secs) = parse_env::<u64>("DIRECT_UPLOAD_URL_TTL_SECS")? {
            config = config.with_upload_url_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_env::<u64>("DIRECT_UPLOAD_REFERENCE_TTL_SECS")? {
            config = config.with_reference_ttl(Duration::from_secs(secs));
        }
        if let Some(bytes) = parse_env::<u64>("DIRECT_UPLOAD_MAX_BYTES")? {
            config = config.with_max_byte_size(bytes);
        }
        if let Some(parts) = parse_env::<u32>("DIRECT_UPLOAD_MAX_PARTS")? {
            config = config.with_max_parts(parts);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set presigned URL lifetime
    pub fn with_upload_url_ttl(mut self, ttl: Duration) -> Self {
        self.upload_url_ttl = ttl;
        self
    }

    /// Set signed reference lifetime
    pub fn with_reference_ttl(mut self, ttl: Duration) -> Self {
        self.reference_ttl = ttl;
        self
    }

    /// Set max blob size
    pub fn with_max_byte_size(mut self, bytes: u64) -> Self {
        self.max_byte_size = bytes;
        self
    }

    /// Set max part number
    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }

    /// Reject configurations the lifecycle manager cannot run with
    pub fn validate(&self) -> UploadResult<()> {
        if self.signing_secret.is_empty() {
            return Err(UploadError::configuration("signing secret must not be empty"));
        }
        if self.upload_url_ttl.is_zero() || self.reference_ttl.is_zero() {
            return Err(UploadError::configuration("ttl values must be positive"));
        }
        if self.max_parts == 0 {
            return Err(UploadError::configuration("max_parts must be at least 1"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> UploadResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| UploadError::configuration(format!("{} is not a valid number: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_storage_limits() {
        let config = UploadConfig::new("secret");
        assert_eq!(config.upload_url_ttl, Duration::from_secs(300));
        assert_eq!(config.max_parts, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(UploadConfig::default().validate().is_err());
    }

    #[test]
    fn builders_override_defaults() {
        let config = UploadConfig::new("s")
            .with_reference_ttl(Duration::from_secs(10))
            .with_max_parts(3)
            .with_max_byte_size(42);
        assert_eq!(config.reference_ttl, Duration::from_secs(10));
        assert_eq!(config.max_parts, 3);
        assert_eq!(config.max_byte_size, 42);

        assert!(config.with_max_parts(0).validate().is_err());
    }
}
