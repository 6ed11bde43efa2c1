use anyhow::{anyhow, Result};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tracing::info;

use crate::config::SinkSettings;

/// S3-compatible backend. Endpoint, region, credentials, SSL, and
/// path-style addressing all come from the sink settings snapshot.
pub struct S3Store {
    bucket: Box<Bucket>,
    bucket_name: String,
    public_url: String,
}

impl S3Store {
    pub fn new(settings: &SinkSettings) -> Result<Self> {
        let endpoint = if settings.s3_endpoint.contains("://") {
            settings.s3_endpoint.clone()
        } else if settings.s3_use_ssl {
            format!("https://{}", settings.s3_endpoint)
        } else {
            format!("http://{}", settings.s3_endpoint)
        };

        let region = Region::Custom {
            region: settings.s3_region.clone(),
            endpoint,
        };
        let credentials = Credentials::new(
            Some(&settings.s3_access_key),
            Some(&settings.s3_secret_key),
            None,
            None,
            None,
        )?;

        let mut bucket = Bucket::new(&settings.s3_bucket, region, credentials)?;
        if settings.s3_path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            bucket_name: settings.s3_bucket.clone(),
            public_url: settings.s3_public_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        if response.status_code() != 200 {
            return Err(anyhow!(
                "failed to upload to S3: status {}",
                response.status_code()
            ));
        }

        let url = if self.public_url.is_empty() {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket_name, key)
        } else {
            format!("{}/{}", self.public_url, key)
        };
        info!("image stored to S3: {}", url);
        Ok(url)
    }
}
