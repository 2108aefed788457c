//! S3 / S3-compatible backend

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use tracing::debug;

use super::{ObjectStore, PutObjectRequest, PutObjectResponse};
use crate::error::StoreError;

/// Writes audit records with the AWS SDK.
///
/// Credentials come from the default provider chain (environment, profile,
/// instance metadata). Timeouts and retries are the SDK's own.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Create a client for `region`, optionally against a custom endpoint
    /// (MinIO, LocalStack)
    pub async fn new(region: &str, endpoint: Option<&str>) -> Self {
        debug!("Creating S3 audit store client for region: {}", region);

        let mut config_builder =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));

        if let Some(ep) = endpoint {
            config_builder = config_builder.endpoint_url(ep);
        }

        let config = config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&config);

        // Force path-style addressing for MinIO compatibility
        if endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectResponse, StoreError> {
        let content_length = i64::try_from(request.content_length).map_err(|_| {
            StoreError::Transport(format!(
                "content length {} exceeds the S3 limit",
                request.content_length
            ))
        })?;

        let mut put = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .body(ByteStream::from(request.body))
            .content_type(&request.content_type)
            .content_length(content_length)
            .set_metadata(Some(request.metadata));

        if request.server_side_encryption {
            put = put.server_side_encryption(ServerSideEncryption::Aes256);
        }

        let output = put.send().await.map_err(store_error)?;

        Ok(PutObjectResponse {
            status_code: 200,
            e_tag: output.e_tag().map(str::to_string),
        })
    }
}

fn store_error(e: SdkError<PutObjectError>) -> StoreError {
    let detail = DisplayErrorContext(&e).to_string();

    match &e {
        SdkError::ServiceError(service_err) => {
            let err = service_err.err();
            StoreError::Status {
                status: service_err.raw().status().as_u16(),
                message: format!(
                    "{} (code: {:?})",
                    err.message().unwrap_or("no message"),
                    err.code()
                ),
            }
        }
        SdkError::DispatchFailure(dispatch_err) => {
            if dispatch_err.is_io() || dispatch_err.is_timeout() {
                StoreError::Transport(detail)
            } else {
                // identity resolution and signing fail before the request is sent
                StoreError::Credentials(detail)
            }
        }
        SdkError::ConstructionFailure(_) => StoreError::Configuration(detail),
        _ => StoreError::Transport(detail),
    }
}
