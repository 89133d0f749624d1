//! Location strings for the server's native `BACKUP ... TO` command.

use crate::clickhouse::Database;
use crate::config::{AzblobConfig, Config, GcsConfig, RemoteStorageKind, S3Config};
use crate::utils::{BackupError, Result};
use regex::Regex;
use url::Url;

const GCS_HOST: &str = "storage.googleapis.com";

/// Object store families that can hold embedded backups.
#[derive(Debug, Clone, Copy)]
pub enum ObjectStoreFamily<'a> {
    S3(&'a S3Config),
    Gcs(&'a GcsConfig),
    AzureBlob(&'a AzblobConfig),
}

impl<'a> ObjectStoreFamily<'a> {
    pub fn from_config(config: &'a Config) -> Result<Self> {
        match config.remote_storage()? {
            RemoteStorageKind::S3 => Ok(ObjectStoreFamily::S3(&config.s3)),
            RemoteStorageKind::Gcs => Ok(ObjectStoreFamily::Gcs(&config.gcs)),
            RemoteStorageKind::AzBlob => Ok(ObjectStoreFamily::AzureBlob(&config.azblob)),
            _ => Err(BackupError::Config(format!(
                "empty clickhouse->embedded_backup_disk and invalid general->remote_storage: {}",
                config.general.remote_storage
            ))),
        }
    }

    pub fn object_disk_path(&self) -> &'a str {
        match self {
            ObjectStoreFamily::S3(c) => &c.object_disk_path,
            ObjectStoreFamily::Gcs(c) => &c.object_disk_path,
            ObjectStoreFamily::AzureBlob(c) => &c.object_disk_path,
        }
    }

    /// Location for `backup_name` under the macro-expanded `sub_path`.
    /// `env` supplies credentials missing from the configuration.
    pub fn build_location<F>(&self, sub_path: &str, backup_name: &str, env: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = self.endpoint(sub_path)?;
        self.compose(&endpoint, sub_path, backup_name, env)
    }

    /// Credential-free part of the location: the object URL for S3 and GCS,
    /// the blob endpoint for Azure.
    pub fn endpoint(&self, sub_path: &str) -> Result<String> {
        match self {
            ObjectStoreFamily::S3(c) => Ok(trim_url(&s3_endpoint(c, sub_path)?)),
            ObjectStoreFamily::Gcs(c) => Ok(trim_url(&gcs_endpoint(c, sub_path)?)),
            ObjectStoreFamily::AzureBlob(c) => Ok(format!(
                "{}://{}/{}",
                c.endpoint_schema, c.endpoint_suffix, c.account_name
            )),
        }
    }

    /// Full location from an `endpoint` built by [`Self::endpoint`].
    pub fn compose<F>(&self, endpoint: &str, sub_path: &str, backup_name: &str, env: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            ObjectStoreFamily::S3(c) => {
                let (access_key, secret_key) = credentials(&c.access_key, &c.secret_key, &env)
                    .ok_or_else(|| {
                        BackupError::Config(
                            "provide s3->access_key and s3->secret_key in config to allow embedded backup without `clickhouse->embedded_backup_disk`"
                                .to_string(),
                        )
                    })?;
                Ok(format!(
                    "S3('{}/{}','{}','{}')",
                    endpoint, backup_name, access_key, secret_key
                ))
            }
            ObjectStoreFamily::Gcs(c) => {
                let (access_key, secret_key) =
                    credentials(&c.embedded_access_key, &c.embedded_secret_key, &env).ok_or_else(
                        || {
                            BackupError::Config(
                                "provide gcs->embedded_access_key and gcs->embedded_secret_key in config to allow embedded backup without `clickhouse->embedded_backup_disk`"
                                    .to_string(),
                            )
                        },
                    )?;
                Ok(format!(
                    "S3('{}/{}','{}','{}')",
                    endpoint, backup_name, access_key, secret_key
                ))
            }
            ObjectStoreFamily::AzureBlob(c) => {
                if c.container.is_empty() || c.account_name.is_empty() {
                    return Err(BackupError::Config(
                        "provide azblob->container and azblob->account_name, azblob->account_key in config to allow embedded backup without `clickhouse->embedded_backup_disk`"
                            .to_string(),
                    ));
                }
                Ok(format!(
                    "AzureBlobStorage('{}','{}','{}/{}')",
                    azure_connection_string(c, endpoint),
                    c.container,
                    sub_path.trim_end_matches('/'),
                    backup_name
                ))
            }
        }
    }
}

/// Location of `backup_name` for the server's embedded backup command.
pub async fn embedded_location<F>(
    config: &Config,
    db: &dyn Database,
    backup_name: &str,
    env: F,
) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let disk = &config.clickhouse.embedded_backup_disk;
    if !disk.is_empty() {
        return Ok(format!("Disk('{}','{}')", disk, backup_name));
    }

    let family = ObjectStoreFamily::from_config(config)?;
    let sub_path = db.apply_macros(family.object_disk_path()).await?;
    let endpoint = db.apply_macros(&family.endpoint(&sub_path)?).await?;
    family.compose(&endpoint, &sub_path, backup_name, env)
}

/// Hide credentials embedded in a location string.
pub fn redact_location(location: &str) -> String {
    let keys = Regex::new(r"^(S3\('[^']*'),'[^']*','[^']*'\)$").ok();
    if let Some(caps) = keys.as_ref().and_then(|re| re.captures(location)) {
        return format!("{},'***','***')", &caps[1]);
    }
    match Regex::new(r"AccountKey=[^;]*") {
        Ok(re) => re.replace_all(location, "AccountKey=***").to_string(),
        Err(_) => location.to_string(),
    }
}

pub fn s3_endpoint(config: &S3Config, sub_path: &str) -> Result<Url> {
    let scheme = if config.disable_ssl { "http" } else { "https" };
    let (host_url, path) = if config.endpoint.starts_with("http") {
        let host_url = match config.endpoint.strip_prefix("https://") {
            Some(rest) if config.disable_ssl => format!("http://{}", rest),
            _ => config.endpoint.clone(),
        };
        (host_url, join_path(&[&config.bucket, sub_path]))
    } else if !config.endpoint.is_empty() {
        (
            format!("{}://{}", scheme, config.endpoint),
            join_path(&[&config.bucket, sub_path]),
        )
    } else if config.force_path_style {
        (
            format!("{}://s3.{}.amazonaws.com", scheme, config.region),
            join_path(&[&config.bucket, sub_path]),
        )
    } else {
        (
            format!("{}://{}.s3.{}.amazonaws.com", scheme, config.bucket, config.region),
            join_path(&[sub_path]),
        )
    };

    let mut url = parse_url(&host_url)?;
    url.set_path(&path);
    Ok(url)
}

pub fn gcs_endpoint(config: &GcsConfig, sub_path: &str) -> Result<Url> {
    let scheme = if config.force_http { "http" } else { "https" };
    let host_url = if config.endpoint.starts_with("http") {
        config.endpoint.clone()
    } else if !config.endpoint.is_empty() {
        format!("{}://{}", scheme, config.endpoint)
    } else {
        format!("{}://{}", scheme, GCS_HOST)
    };

    let mut url = parse_url(&host_url)?;
    url.set_path(&join_path(&[&config.bucket, sub_path]));
    Ok(url)
}

fn azure_connection_string(config: &AzblobConfig, blob_endpoint: &str) -> String {
    format!(
        "DefaultEndpointsProtocol={};AccountName={};AccountKey={};BlobEndpoint={};",
        config.endpoint_schema, config.account_name, config.account_key, blob_endpoint,
    )
}

fn credentials<F>(access_key: &str, secret_key: &str, env: &F) -> Option<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    if !access_key.is_empty() && !secret_key.is_empty() {
        return Some((access_key.to_string(), secret_key.to_string()));
    }
    let access_key = env("AWS_ACCESS_KEY_ID").filter(|v| !v.is_empty())?;
    let secret_key = env("AWS_SECRET_ACCESS_KEY").filter(|v| !v.is_empty())?;
    Some((access_key, secret_key))
}

fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|e| BackupError::Config(format!("invalid endpoint '{}': {}", s, e)))
}

fn join_path(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn trim_url(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}
