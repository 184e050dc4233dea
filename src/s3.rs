//! Thin async wrapper over the S3-compatible object store.
//!
//! Issues presigned URLs (rewritten to the public endpoint), answers
//! existence/metadata probes, and handles prefix-scoped deletion and
//! copying for repo delete/rename.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use opendal::Operator;
use opendal::services::S3;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::config::S3Config;

/// Presigned URL generation must complete within this budget (the request
/// fails with a 500 otherwise).
const PRESIGN_DEADLINE: Duration = Duration::from_secs(5);

/// RFC 5987 `attr-char`: everything else is percent-encoded in
/// `filename*=UTF-8''…`.
const RFC5987_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub url: String,
    pub expires_at: String,
    pub method: &'static str,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: i64,
    pub etag: String,
    pub content_type: Option<String>,
}

#[derive(Clone)]
pub struct ObjectStore {
    op: Operator,
    endpoint: String,
    public_endpoint: String,
    pub bucket: String,
}

impl ObjectStore {
    pub fn new(cfg: &S3Config) -> anyhow::Result<Self> {
        if cfg.signature_version != "s3v4" {
            tracing::warn!(
                requested = %cfg.signature_version,
                "only s3v4 signing is supported; continuing with v4"
            );
        }

        let mut builder = S3::default()
            .endpoint(&cfg.endpoint)
            .region(&cfg.region)
            .bucket(&cfg.bucket)
            .access_key_id(&cfg.access_key)
            .secret_access_key(&cfg.secret_key)
            .disable_config_load()
            .disable_ec2_metadata();

        if !cfg.force_path_style {
            builder = builder.enable_virtual_host_style();
        }

        let op = Operator::new(builder)?.finish();

        Ok(Self {
            op,
            endpoint: cfg.endpoint.clone(),
            public_endpoint: cfg.public_endpoint.clone(),
            bucket: cfg.bucket.clone(),
        })
    }

    /// Swap the internal endpoint for the public one in a presigned URL.
    fn publish_url(&self, url: &str) -> String {
        url.replacen(&self.endpoint, &self.public_endpoint, 1)
    }

    /// Presigned GET for `key`, with an attachment `Content-Disposition`
    /// when a filename is given.
    pub async fn generate_download_presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
        filename: Option<&str>,
    ) -> anyhow::Result<String> {
        let presign = async {
            match filename {
                Some(filename) => {
                    self.op
                        .presign_read_with(key, expires_in)
                        .override_content_disposition(&content_disposition(filename))
                        .await
                }
                None => self.op.presign_read(key, expires_in).await,
            }
        };

        let request = tokio::time::timeout(PRESIGN_DEADLINE, presign)
            .await
            .map_err(|_| anyhow::anyhow!("presign timed out"))??;

        Ok(self.publish_url(&request.uri().to_string()))
    }

    /// Presigned PUT for `key`. The returned headers must be sent by the
    /// client verbatim (they are part of the signature).
    pub async fn generate_upload_presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
        content_type: Option<&str>,
    ) -> anyhow::Result<PresignedUpload> {
        let presign = async {
            match content_type {
                Some(content_type) => {
                    self.op
                        .presign_write_with(key, expires_in)
                        .content_type(content_type)
                        .await
                }
                None => self.op.presign_write(key, expires_in).await,
            }
        };

        let request = tokio::time::timeout(PRESIGN_DEADLINE, presign)
            .await
            .map_err(|_| anyhow::anyhow!("presign timed out"))??;

        let expires_at = (Utc::now() + expires_in).format("%Y-%m-%dT%H:%M:%S%.6fZ");

        let mut headers = HashMap::new();
        if let Some(content_type) = content_type {
            headers.insert("Content-Type".to_owned(), content_type.to_owned());
        }

        Ok(PresignedUpload {
            url: self.publish_url(&request.uri().to_string()),
            expires_at: expires_at.to_string(),
            method: "PUT",
            headers,
        })
    }

    pub async fn object_exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.op.exists(key).await?)
    }

    pub async fn get_object_metadata(&self, key: &str) -> anyhow::Result<ObjectMeta> {
        let meta = self.op.stat(key).await?;
        Ok(ObjectMeta {
            size: i64::try_from(meta.content_length()).unwrap_or(i64::MAX),
            etag: meta
                .etag()
                .map(|e| e.trim_matches('"').to_owned())
                .unwrap_or_default(),
            content_type: meta.content_type().map(ToOwned::to_owned),
        })
    }

    /// Best-effort removal of everything under a prefix (repo deletion).
    pub async fn delete_objects_with_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        self.op.remove_all(prefix).await?;
        Ok(())
    }

    /// Copy every object under `from_prefix` to `to_prefix`, skipping an
    /// optional excluded sub-prefix (store-internal metadata).
    pub async fn copy_s3_folder(
        &self,
        from_prefix: &str,
        to_prefix: &str,
        exclude_prefix: Option<&str>,
    ) -> anyhow::Result<usize> {
        let entries = self.op.list_with(from_prefix).recursive(true).await?;
        let mut copied = 0usize;

        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            let key = entry.path();
            let Some(relative) = key.strip_prefix(from_prefix) else {
                continue;
            };
            if let Some(excluded) = exclude_prefix
                && relative.starts_with(excluded)
            {
                continue;
            }
            let target = format!("{to_prefix}{relative}");
            if let Err(e) = self.op.copy(key, &target).await {
                tracing::warn!(key, target, error = %e, "object copy failed");
                continue;
            }
            copied += 1;
        }

        Ok(copied)
    }
}

/// Split an `s3://bucket/key` URI.
pub fn parse_s3_uri(uri: &str) -> anyhow::Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| anyhow::anyhow!("not an s3 uri: {uri}"))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        anyhow::bail!("not an s3 uri: {uri}");
    }
    Ok((bucket, key))
}

/// A well-formed LFS oid: 64 hex digits. Client-supplied oids must pass
/// this before being turned into a storage key.
pub fn is_valid_lfs_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Content-addressed key for an LFS blob (shared across repos). The oid
/// must already be validated with [`is_valid_lfs_oid`].
pub fn lfs_key(oid: &str) -> String {
    format!("lfs/{}/{}/{oid}", &oid[..2], &oid[2..4])
}

/// `Content-Disposition` with both the plain-ASCII and the RFC 5987
/// UTF-8 forms of the filename.
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    let encoded = utf8_percent_encode(filename, RFC5987_ENCODE);
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_s3_uri_splits() {
        let (bucket, key) = parse_s3_uri("s3://hub-storage/lfs/ab/cd/abcd123").unwrap();
        assert_eq!(bucket, "hub-storage");
        assert_eq!(key, "lfs/ab/cd/abcd123");
    }

    #[test]
    fn parse_s3_uri_rejects_other_schemes() {
        assert!(parse_s3_uri("file:///tmp/x").is_err());
        assert!(parse_s3_uri("s3://").is_err());
    }

    #[test]
    fn lfs_key_fans_out_by_oid_prefix() {
        let oid = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";
        assert_eq!(lfs_key(oid), format!("lfs/aa/bb/{oid}"));
    }

    #[test]
    fn lfs_oid_validation() {
        assert!(is_valid_lfs_oid(&"ab".repeat(32)));
        assert!(is_valid_lfs_oid(&"AB".repeat(32)));
        assert!(!is_valid_lfs_oid("ab")); // too short for a storage key
        assert!(!is_valid_lfs_oid(""));
        assert!(!is_valid_lfs_oid(&"zz".repeat(32)));
        assert!(!is_valid_lfs_oid(&format!("é{}", "a".repeat(62)))); // non-ascii
    }

    #[test]
    fn content_disposition_plain_ascii() {
        let d = content_disposition("model.bin");
        assert_eq!(
            d,
            "attachment; filename=\"model.bin\"; filename*=UTF-8''model.bin"
        );
    }

    #[test]
    fn content_disposition_non_ascii_has_both_forms() {
        let d = content_disposition("模型.bin");
        assert!(d.contains("filename=\"__.bin\""));
        assert!(d.contains("filename*=UTF-8''%E6%A8%A1%E5%9E%8B.bin"));
    }

    #[test]
    fn content_disposition_escapes_quotes() {
        let d = content_disposition("a\"b.txt");
        assert!(d.contains("filename=\"a_b.txt\""));
    }
}
