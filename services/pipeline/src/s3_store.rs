use crate::config::S3Config;
use crate::uploader::{DocumentStore, ImuDocument, UploadError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Document store writing each sample as a JSON object in S3.
///
/// The object's `Last-Modified` is the server-assigned upload time.
pub struct S3DocumentStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3DocumentStore {
    /// Create a new S3 document store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.prefix,
            "S3 document store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        })
    }

    /// Check the bucket is reachable with the configured credentials.
    pub async fn check_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("Bucket {} is not reachable", self.bucket))?;
        Ok(())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Object key for a document.
///
/// Format: `{prefix}/{date}/{device_id}/{session_id}/{received_at}_{id}.json`,
/// with the date taken from the host arrival time in UTC.
pub fn document_key(prefix: &str, document: &ImuDocument, id: &Uuid) -> String {
    let date = DateTime::<Utc>::from_timestamp_millis(document.received_at)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown-date".to_string());

    format!(
        "{prefix}/{date}/{device}/{session}/{timestamp}_{id}.json",
        prefix = prefix.trim_end_matches('/'),
        date = date,
        device = sanitize_path_component(&document.device_id),
        session = sanitize_path_component(&document.session_id),
        timestamp = document.received_at,
        id = id,
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[async_trait]
impl DocumentStore for S3DocumentStore {
    #[instrument(level = "debug", skip(self, document), fields(session_id = %document.session_id))]
    async fn put(&self, document: &ImuDocument) -> Result<(), UploadError> {
        let key = document_key(&self.prefix, document, &Uuid::new_v4());
        let body = serde_json::to_vec(document)
            .map_err(|e| UploadError::Serialization(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .metadata("device-id", &document.device_id)
            .metadata("session-id", &document.session_id)
            .send()
            .await
            .map_err(|e| UploadError::Store(e.to_string()))?;

        debug!(key = %key, "Document uploaded");
        Ok(())
    }
}
