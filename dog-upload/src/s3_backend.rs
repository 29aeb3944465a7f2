use std::env;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::{PresignedRequest, PresigningConfig};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::debug;

use crate::backend::{BackendError, BackendResult, StorageBackend};
use crate::{BlobKey, Checksum, ChecksumAlgorithm, DirectUpload, UploadError, UploadResult, UploadSessionId};

/// Connection settings for an S3-compatible bucket
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, RustFS, R2)
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
}

impl S3Config {
    /// Read `S3_*` environment variables; only `S3_ENDPOINT_URL` is optional
    pub fn from_env() -> UploadResult<Self> {
        fn get_env(key: &str) -> UploadResult<String> {
            env::var(key)
                .map_err(|_| UploadError::configuration(format!("{} environment variable required", key)))
        }

        Ok(Self {
            region: get_env("S3_REGION")?,
            endpoint_url: env::var("S3_ENDPOINT_URL").ok().filter(|url| !url.is_empty()),
            access_key_id: get_env("S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("S3_SECRET_ACCESS_KEY")?,
            bucket: get_env("S3_BUCKET")?,
        })
    }
}

/// Storage backend issuing presigned requests against an S3-compatible bucket
#[derive(Clone)]
pub struct S3StorageBackend {
    client: Client,
    bucket: String,
}

impl S3StorageBackend {
    pub async fn new(config: S3Config) -> Self {
        let bucket = config.bucket.clone();
        let client = Self::create_client(config).await;
        Self { client, bucket }
    }

    pub async fn from_env() -> UploadResult<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    /// Wrap an existing client, e.g. one configured by the host application
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    async fn create_client(config: S3Config) -> Client {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "dog-upload",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint_url) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let aws_config = loader.load().await;

        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(true)
                .build(),
        )
    }

    fn presigning(expires_in: Duration) -> BackendResult<PresigningConfig> {
        PresigningConfig::expires_in(expires_in)
            .map_err(|e| BackendError::rejected(format!("invalid presign expiry: {}", e)))
    }

    fn into_direct_upload(request: PresignedRequest) -> DirectUpload {
        request
            .headers()
            .fold(DirectUpload::new(request.uri()), |upload, (name, value)| {
                upload.with_header(name, value)
            })
    }

    fn content_length(byte_size: u64) -> BackendResult<i64> {
        i64::try_from(byte_size)
            .map_err(|_| BackendError::rejected(format!("byte size {} out of range", byte_size)))
    }

    /// Every part the backend has received for `session`, in part order
    async fn uploaded_parts(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key.as_str())
                .upload_id(session.as_str())
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("list parts", e))?;

            parts.extend(page.parts().iter().map(|part| {
                CompletedPart::builder()
                    .set_part_number(part.part_number())
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .build()
            }));

            match (page.is_truncated(), page.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }

        parts.sort_by_key(|part| part.part_number());
        Ok(parts)
    }
}

/// Map an SDK failure onto the backend error classes the lifecycle manager understands
fn classify<E>(context: &str, err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            BackendError::Unavailable(message)
        }
        SdkError::ServiceError(service) => match service.err().code() {
            Some("NoSuchUpload") => BackendError::SessionNotFound(message),
            Some("InvalidPart") | Some("InvalidPartOrder") | Some("EntityTooSmall") => {
                BackendError::IncompleteParts(message)
            }
            _ if service.raw().status().as_u16() >= 500 => BackendError::Unavailable(message),
            _ => BackendError::Rejected(message),
        },
        _ => BackendError::Rejected(message),
    }
}

#[async_trait]
impl StorageBackend for S3StorageBackend {
    async fn generate_upload_url(
        &self,
        key: &BlobKey,
        byte_size: u64,
        checksum: &Checksum,
        content_type: &str,
        expires_in: Duration,
    ) -> BackendResult<DirectUpload> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(content_type)
            .content_length(Self::content_length(byte_size)?);
        request = match checksum.algorithm() {
            ChecksumAlgorithm::Md5 => request.content_md5(checksum.as_str()),
            ChecksumAlgorithm::Sha256 => request.checksum_sha256(checksum.as_str()),
        };

        let presigned = request
            .presigned(Self::presigning(expires_in)?)
            .await
            .map_err(|e| classify("presign put object", e))?;

        debug!(key = %key, bucket = %self.bucket, "Presigned single upload");
        Ok(Self::into_direct_upload(presigned))
    }

    async fn initiate_multipart(
        &self,
        key: &BlobKey,
        content_type: &str,
    ) -> BackendResult<UploadSessionId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify("create multipart upload", e))?;

        output
            .upload_id()
            .map(|id| UploadSessionId::from_string(id.to_string()))
            .ok_or_else(|| BackendError::rejected("create multipart upload returned no upload id"))
    }

    async fn generate_part_upload_url(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
        part_number: u32,
        byte_size: u64,
        checksum: &Checksum,
        expires_in: Duration,
    ) -> BackendResult<DirectUpload> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| BackendError::rejected(format!("part number {} out of range", part_number)))?;

        let mut request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(session.as_str())
            .part_number(part_number)
            .content_length(Self::content_length(byte_size)?);
        request = match checksum.algorithm() {
            ChecksumAlgorithm::Md5 => request.content_md5(checksum.as_str()),
            ChecksumAlgorithm::Sha256 => request.checksum_sha256(checksum.as_str()),
        };

        let presigned = request
            .presigned(Self::presigning(expires_in)?)
            .await
            .map_err(|e| classify("presign upload part", e))?;

        Ok(Self::into_direct_upload(presigned))
    }

    async fn complete_multipart(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<()> {
        let parts = self.uploaded_parts(key, session).await?;
        if parts.is_empty() {
            return Err(BackendError::IncompleteParts("no parts uploaded".to_string()));
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(session.as_str())
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("complete multipart upload", e))?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        key: &BlobKey,
        session: &UploadSessionId,
    ) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(session.as_str())
            .send()
            .await
            .map_err(|e| classify("abort multipart upload", e))?;
        Ok(())
    }

    async fn object_exists(&self, key: &BlobKey) -> BackendResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(false),
            Err(err) => Err(classify("head object", err)),
        }
    }
}
