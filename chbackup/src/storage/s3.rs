//! S3 and S3-compatible (GCS interoperability) object storage.

use super::{RemoteObject, RemoteStorage};
use crate::config::{GcsConfig, S3Config};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{Delete, ObjectIdentifier};
use std::path::Path;
use tracing::{debug, info};

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const DELETE_BATCH: usize = 1000;

pub struct S3Storage {
    client: s3::Client,
    kind: &'static str,
    bucket: String,
    prefix: String,
}

/// Connection parameters shared by every S3 flavour.
struct ClientParams {
    region: String,
    endpoint: Option<String>,
    credentials: Option<(String, String)>,
    force_path_style: bool,
}

fn storage_err(action: &str, key: &str, e: impl std::error::Error) -> BackupError {
    BackupError::Storage(format!("{} {}: {}", action, key, DisplayErrorContext(e)))
}

impl S3Storage {
    pub async fn from_s3_config(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(BackupError::Config("s3->bucket is empty".to_string()));
        }
        let endpoint = if config.endpoint.is_empty() {
            None
        } else if config.endpoint.starts_with("http") {
            Some(config.endpoint.clone())
        } else {
            let scheme = if config.disable_ssl { "http" } else { "https" };
            Some(format!("{}://{}", scheme, config.endpoint))
        };
        let credentials = if config.access_key.is_empty() {
            None
        } else {
            Some((config.access_key.clone(), config.secret_key.clone()))
        };

        let params = ClientParams {
            region: config.region.clone(),
            endpoint,
            credentials,
            force_path_style: config.force_path_style,
        };
        Ok(Self::build("s3", &config.bucket, &config.path, params).await)
    }

    /// GCS through its S3 interoperability API, authenticated with HMAC keys.
    pub async fn from_gcs_config(config: &GcsConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(BackupError::Config("gcs->bucket is empty".to_string()));
        }
        let endpoint = match config.endpoint.as_str() {
            "" => GCS_ENDPOINT.to_string(),
            e if e.starts_with("http") => e.to_string(),
            e => format!("{}://{}", if config.force_http { "http" } else { "https" }, e),
        };
        let credentials = if config.embedded_access_key.is_empty() {
            None
        } else {
            Some((
                config.embedded_access_key.clone(),
                config.embedded_secret_key.clone(),
            ))
        };

        let params = ClientParams {
            region: "auto".to_string(),
            endpoint: Some(endpoint),
            credentials,
            force_path_style: true,
        };
        Ok(Self::build("gcs", &config.bucket, &config.path, params).await)
    }

    async fn build(kind: &'static str, bucket: &str, prefix: &str, params: ClientParams) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(params.region));
        if let Some(endpoint) = params.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some((access_key, secret_key)) = params.credentials {
            loader = loader.credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "Static",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(params.force_path_style)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            kind,
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }
}

fn to_chrono(dt: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl RemoteStorage for S3Storage {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn connect(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| storage_err("head bucket", &self.bucket, e))?;
        info!("Connected to {} bucket {}", self.kind, self.bucket);
        Ok(())
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| storage_err("read", &local_path.display().to_string(), e))?;
        let full_key = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_err("put", &full_key, e))?;
        debug!("PUT {} ({} bytes)", full_key, size);
        Ok(size)
    }

    async fn put_bytes(&self, key: &str, body: Bytes) -> Result<()> {
        let full_key = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| storage_err("put", &full_key, e))?;
        debug!("PUT {}", full_key);
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let full_key = self.full_key(key);
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    return Ok(None);
                }
                return Err(storage_err("get", &full_key, e));
            }
        };
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| storage_err("read body of", &full_key, e))?;
        Ok(Some(data.into_bytes()))
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<RemoteObject>> {
        let full_prefix = self.full_key(prefix);

        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix);
        if !recursive {
            request = request.delimiter("/");
        }

        let mut objects = Vec::new();
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| storage_err("list", &full_prefix, e))?;
            for prefix in page.common_prefixes() {
                if let Some(p) = prefix.prefix() {
                    objects.push(RemoteObject {
                        key: self.relative_key(p).to_string(),
                        size: 0,
                        last_modified: None,
                    });
                }
            }
            for object in page.contents() {
                if let Some(key) = object.key() {
                    objects.push(RemoteObject {
                        key: self.relative_key(key).to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: object.last_modified().and_then(to_chrono),
                    });
                }
            }
        }
        Ok(objects)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for chunk in keys.chunks(DELETE_BATCH) {
            let mut ids = Vec::with_capacity(chunk.len());
            for key in chunk {
                let full_key = self.full_key(key);
                let id = ObjectIdentifier::builder()
                    .key(&full_key)
                    .build()
                    .map_err(|e| storage_err("delete", &full_key, e))?;
                ids.push(id);
            }
            let delete = Delete::builder()
                .set_objects(Some(ids))
                .quiet(true)
                .build()
                .map_err(|e| storage_err("delete from", &self.bucket, e))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| storage_err("delete from", &self.bucket, e))?;
        }
        debug!("deleted {} objects from {}", keys.len(), self.bucket);
        Ok(())
    }
}
