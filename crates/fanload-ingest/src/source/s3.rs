use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{config::Credentials, error::DisplayErrorContext, Client};
use fanload_common::FileReference;
use tracing::{debug, info, instrument};

use super::{config::StorageConfig, LineStream, ObjectSource};
use crate::error::{IngestError, Result};

/// Streams objects out of S3 (or an S3-compatible store such as MinIO)
#[derive(Clone)]
pub struct S3Source {
    client: Client,
}

impl S3Source {
    pub async fn new(config: StorageConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        if let Some((access_key, secret_key)) = config.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "fanload-source",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.path_style)
            .build();

        info!(region = %config.region, endpoint = ?config.endpoint, "S3 source initialized");

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectSource for S3Source {
    #[instrument(skip(self), fields(url = %file.url()))]
    async fn open(&self, file: &FileReference) -> Result<LineStream> {
        let response = self
            .client
            .get_object()
            .bucket(&file.container_id)
            .key(&file.object_key)
            .send()
            .await
            .map_err(|e| IngestError::source_unreadable(file.url(), DisplayErrorContext(&e)))?;

        debug!(content_length = ?response.content_length(), "Opened S3 object stream");

        Ok(Box::pin(response.body.into_async_read()))
    }

    fn kind(&self) -> &'static str {
        "s3"
    }
}
