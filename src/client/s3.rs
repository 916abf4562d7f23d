//! S3 object client
//!
//! Talks to Amazon S3 or S3-compatible storage (MinIO, LocalStack, etc.)
//! through `aws-sdk-s3`. Credentials come from the SDK's default provider
//! chain; this module never handles secrets itself.

use std::path::Path;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::RequestPayer;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::backend::ReadStream;
use crate::client::{ObjectClient, ObjectInfo};
use crate::config::S3Config;
use crate::error::{NstoreError, Result};

/// Object client for Amazon S3 and S3-compatible storage
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    request_payer: Option<RequestPayer>,
}

impl S3Client {
    /// Create a new client from configuration
    pub async fn new(config: &S3Config) -> Self {
        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());

        let region = config.effective_region();
        debug!("S3 region: {}", region);
        sdk_config_builder = sdk_config_builder.region(Region::new(region));

        if config.operation_timeout.is_some() || config.connect_timeout.is_some() {
            let mut timeouts = TimeoutConfig::builder();
            if let Some(timeout) = config.operation_timeout {
                timeouts = timeouts.operation_timeout(timeout);
            }
            if let Some(timeout) = config.connect_timeout {
                timeouts = timeouts.connect_timeout(timeout);
            }
            sdk_config_builder = sdk_config_builder.timeout_config(timeouts.build());
        }

        let sdk_config = sdk_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self::from_client(
            Client::from_conf(s3_config_builder.build()),
            config.request_payer,
        )
    }

    /// Wrap an already configured SDK client
    pub fn from_client(client: Client, request_payer: bool) -> Self {
        Self {
            client,
            request_payer: request_payer.then_some(RequestPayer::Requester),
        }
    }
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ReadStream> {
        trace!("get_object: bucket={} key={}", bucket, key);

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_request_payer(self.request_payer.clone())
            .send()
            .await
            .map_err(|e| classify_sdk_error("GetObject", bucket, key, e))?;

        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        debug!("put_object: bucket={} key={} size={}", bucket, key, body.len());

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_request_payer(self.request_payer.clone())
            .send()
            .await
            .map_err(|e| classify_sdk_error("PutObject", bucket, key, e))?;

        Ok(())
    }

    async fn put_object_from_file(&self, bucket: &str, key: &str, file: &Path) -> Result<()> {
        debug!("put_object_from_file: bucket={} key={} file={:?}", bucket, key, file);

        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| NstoreError::Io(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .set_request_payer(self.request_payer.clone())
            .send()
            .await
            .map_err(|e| classify_sdk_error("PutObject", bucket, key, e))?;

        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        trace!("head_object: bucket={} key={}", bucket, key);

        let result = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .set_request_payer(self.request_payer.clone())
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(str::to_string),
            })),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(None),
            Err(e) => Err(classify_sdk_error("HeadObject", bucket, key, e)),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        debug!("delete_object: bucket={} key={}", bucket, key);

        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .set_request_payer(self.request_payer.clone())
            .send()
            .await
            .map_err(|e| classify_sdk_error("DeleteObject", bucket, key, e))?;

        Ok(())
    }
}

/// Coarse failure classes used to pick an error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    NotFound,
    Auth,
    Unavailable,
    Other,
}

/// Classify an S3 error code, if it is one we know
fn class_from_code(code: &str) -> Option<FailureClass> {
    match code {
        "NoSuchKey" | "NoSuchBucket" | "NotFound" => Some(FailureClass::NotFound),
        "AccessDenied"
        | "AllAccessDisabled"
        | "InvalidAccessKeyId"
        | "SignatureDoesNotMatch"
        | "ExpiredToken"
        | "InvalidToken"
        | "TokenRefreshRequired"
        | "Forbidden" => Some(FailureClass::Auth),
        "InternalError" | "ServiceUnavailable" | "SlowDown" | "RequestTimeout" | "Throttling"
        | "ThrottlingException" => Some(FailureClass::Unavailable),
        _ => None,
    }
}

/// Classify by HTTP status, for responses without an error body (HEAD)
fn class_from_status(status: u16) -> FailureClass {
    match status {
        404 => FailureClass::NotFound,
        401 | 403 => FailureClass::Auth,
        408 | 429 | 500..=599 => FailureClass::Unavailable,
        _ => FailureClass::Other,
    }
}

fn classify_sdk_error<E>(
    operation: &str,
    bucket: &str,
    key: &str,
    err: SdkError<E, HttpResponse>,
) -> NstoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let target = format!("s3://{}/{}", bucket, key);
    let detail = DisplayErrorContext(&err).to_string();
    let mentions_credentials = detail.to_ascii_lowercase().contains("credential");

    let class = match &err {
        SdkError::ServiceError(ctx) => ctx
            .err()
            .code()
            .and_then(class_from_code)
            .unwrap_or_else(|| class_from_status(ctx.raw().status().as_u16())),
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => FailureClass::Unavailable,
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() || failure.is_io() {
                FailureClass::Unavailable
            } else if mentions_credentials {
                FailureClass::Auth
            } else {
                FailureClass::Unavailable
            }
        }
        _ if mentions_credentials => FailureClass::Auth,
        _ => FailureClass::Other,
    };

    match class {
        FailureClass::NotFound => NstoreError::NotFound(target),
        FailureClass::Auth => NstoreError::Auth(format!("S3 {} {}: {}", operation, target, detail)),
        FailureClass::Unavailable => {
            NstoreError::BackendUnavailable(format!("S3 {} {}: {}", operation, target, detail))
        }
        FailureClass::Other => NstoreError::Backend(format!("S3 {} {}: {}", operation, target, detail)),
    }
}
