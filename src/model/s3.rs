//! Object-storage coordinates for the backup repository

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default region when none is supplied
const DEFAULT_REGION: &str = "us-east-1";

/// S3 (or S3-compatible) repository configuration
///
/// Every field is optional on input so that incomplete configuration can be
/// reported precisely instead of failing to parse.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct S3Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// `path` or `host`; path style is needed by most S3-compatible stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_style: Option<String>,
}

impl S3Config {
    /// Build from the string data of a credentials Secret
    pub fn from_secret_data(data: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| {
            data.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            bucket: get("bucket"),
            path: get("path"),
            region: get("region"),
            endpoint: get("endpoint"),
            access_key: get("access-key"),
            secret_key: get("secret-key"),
            uri_style: get("s3-uri-style"),
        }
    }

    /// Names of required parameters that are absent
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.bucket) {
            missing.push("bucket");
        }
        if is_blank(&self.access_key) {
            missing.push("access-key");
        }
        if is_blank(&self.secret_key) {
            missing.push("secret-key");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parameters().is_empty()
    }

    pub fn region_or_default(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    /// Repository path inside the bucket, always with a single leading slash
    pub fn normalized_path(&self) -> String {
        let trimmed = self.path.as_deref().unwrap_or("").trim_matches('/');
        format!("/{}", trimmed)
    }

    /// Repository location (`s3://bucket/path`)
    pub fn repository(&self) -> String {
        let bucket = self.bucket.as_deref().unwrap_or("");
        let path = self.normalized_path();
        if path == "/" {
            format!("s3://{}", bucket)
        } else {
            format!("s3://{}{}", bucket, path)
        }
    }

    pub fn uses_path_style(&self) -> bool {
        self.uri_style.as_deref() == Some("path")
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("path", &self.path)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("uri_style", &self.uri_style)
            .finish()
    }
}
