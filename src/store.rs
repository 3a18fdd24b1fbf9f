//! Public object storage.
//!
//! The [`ObjectStore`] trait is the seam between the asset relocator and
//! whatever blob store serves the public bucket. The production
//! implementation is [`S3Store`], which talks to the S3 REST API with AWS
//! Signature V4 signing (pure-Rust `hmac` + `sha2`, no C dependencies).
//! [`MemoryStore`] backs tests and counts uploads so idempotence is
//! observable.
//!
//! Credentials are read from the environment:
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// A byte stream flowing into the store. Boxed so implementations stay
/// object-safe.
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// Write-once-per-key public blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object already exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Upload a byte stream to `key` without buffering it whole.
    async fn put_stream(&self, key: &str, content_type: &str, body: ByteStream) -> Result<()>;

    /// The stable public URL for `key`.
    fn public_url(&self, key: &str) -> String;
}

// ============ S3 implementation ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-backed [`ObjectStore`] using SigV4-signed HEAD and PUT requests.
///
/// Supports custom endpoints for S3-compatible services (MinIO,
/// LocalStack) via `storage.endpoint_url`.
pub struct S3Store {
    client: reqwest::Client,
    creds: AwsCredentials,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    public_base_url: String,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            creds: AwsCredentials::from_env()?,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
        }
    }

    fn scheme(&self) -> &'static str {
        match self.endpoint_url {
            Some(ref e) if e.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Sign a request and return the `Authorization` header value plus the
    /// amz-date used, per AWS Signature Version 4.
    fn sign(
        &self,
        method: &str,
        canonical_uri: &str,
        payload_hash: &str,
        extra_headers: &[(String, String)],
    ) -> (String, String, Vec<(String, String)>) {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(extra_headers.iter().cloned());
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method, canonical_uri, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        (authorization, amz_date, headers)
    }

    fn object_url(&self, key: &str) -> (String, String) {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("/{}", encoded_key);
        let url = format!("{}://{}{}", self.scheme(), self.host(), canonical_uri);
        (url, canonical_uri)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn exists(&self, key: &str) -> Result<bool> {
        let (url, canonical_uri) = self.object_url(key);
        let payload_hash = hex_sha256(b"");
        let (authorization, amz_date, _) = self.sign("HEAD", &canonical_uri, &payload_hash, &[]);

        let mut req = self
            .client
            .head(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("HEAD s3://{}/{}", self.bucket, key))?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => bail!("S3 HeadObject failed (HTTP {}) for key '{}'", s, key),
        }
    }

    async fn put_stream(&self, key: &str, content_type: &str, body: ByteStream) -> Result<()> {
        let (url, canonical_uri) = self.object_url(key);
        // Streamed upload: the payload hash cannot be known up front.
        let payload_hash = "UNSIGNED-PAYLOAD".to_string();
        let extra = vec![("x-amz-acl".to_string(), "public-read".to_string())];
        let (authorization, amz_date, _) = self.sign("PUT", &canonical_uri, &payload_hash, &extra);

        let mut req = self
            .client
            .put(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .header("x-amz-acl", "public-read")
            .header("Content-Type", content_type)
            .body(reqwest::Body::wrap_stream(body));
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("PUT s3://{}/{}", self.bucket, key))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

// ============ SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the SigV4 signing key for a given date, region, and service.
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (unreserved characters pass through).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ In-memory implementation ============

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// In-memory [`ObjectStore`] for tests.
///
/// Buffers uploads and counts them, so tests can assert that relocation
/// performs at most one upload per key.
pub struct MemoryStore {
    public_base_url: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    puts: AtomicU64,
}

impl MemoryStore {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
            puts: AtomicU64::new(0),
        }
    }

    /// Total number of uploads performed.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// The stored bytes for `key`, if present.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().unwrap().contains_key(key))
    }

    async fn put_stream(&self, key: &str, _content_type: &str, mut body: ByteStream) -> Result<()> {
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.write().unwrap().insert(key.to_string(), buf);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}
