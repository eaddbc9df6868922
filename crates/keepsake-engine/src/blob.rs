use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use uuid::Uuid;

pub const FS_SCHEME: &str = "fs";
pub const MEMORY_SCHEME: &str = "mem";

/// Object storage port. URIs have the shape `scheme://bucket/key` and are
/// treated as opaque by everything outside the adapter that minted them.
pub trait BlobStore: Send + Sync {
    fn get(&self, uri: &str) -> Result<Vec<u8>>;
    /// Stores `bytes` under `key_hint` (overwriting) and returns the URI.
    fn put(&self, bytes: &[u8], key_hint: &str) -> Result<String>;
    /// Temporary URL a remote provider can fetch the object from.
    fn presign(&self, uri: &str, ttl: Duration) -> Result<String>;
    /// URI an object stored under `key` has, whether or not it exists yet.
    fn uri_for(&self, key: &str) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation<'a> {
    pub scheme: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
}

pub fn parse_blob_uri(uri: &str) -> Option<BlobLocation<'_>> {
    let (scheme, rest) = uri.trim().split_once("://")?;
    let (bucket, key) = rest.split_once('/')?;
    if scheme.is_empty() || bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some(BlobLocation {
        scheme,
        bucket,
        key,
    })
}

pub fn avatar_key(owner_id: &str) -> String {
    format!("avatars/{owner_id}.png")
}

pub fn subject_key(owner_id: &str) -> String {
    format!("subjects/{owner_id}.png")
}

pub fn generated_key(owner_id: &str, kind: &str) -> String {
    format!("generated/{owner_id}/{kind}_{}.png", short_uuid())
}

pub fn reference_grid_key(owner_id: &str) -> String {
    format!("references/{owner_id}/grid_{}.png", short_uuid())
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn validate_key(key: &str) -> Result<()> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        bail!("blob key must not be empty");
    }
    let escapes = Path::new(trimmed)
        .components()
        .any(|part| !matches!(part, Component::Normal(_)));
    if escapes {
        bail!("blob key {key:?} must be a relative path without '..'");
    }
    Ok(())
}

fn presigned_url(base: &str, ttl: Duration) -> String {
    let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
    format!("{base}?expires={expires}")
}

/// Blob store backed by a directory: `fs://{bucket}/{key}` lives at
/// `{root}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    bucket: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, uri: &str) -> Result<PathBuf> {
        let location =
            parse_blob_uri(uri).ok_or_else(|| anyhow!("not a blob uri: {uri:?}"))?;
        if location.scheme != FS_SCHEME {
            bail!("fs blob store cannot read {uri:?}");
        }
        validate_key(location.bucket)?;
        validate_key(location.key)?;
        Ok(self.root.join(location.bucket).join(location.key))
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.path_for(uri)?;
        fs::read(&path).with_context(|| format!("failed reading blob {}", path.display()))
    }

    fn put(&self, bytes: &[u8], key_hint: &str) -> Result<String> {
        validate_key(key_hint)?;
        let uri = self.uri_for(key_hint);
        let path = self.path_for(&uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("part");
        fs::write(&tmp, bytes).with_context(|| format!("failed writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed moving blob into {}", path.display()))?;
        Ok(uri)
    }

    fn presign(&self, uri: &str, ttl: Duration) -> Result<String> {
        let path = self.path_for(uri)?;
        if !path.exists() {
            bail!("cannot presign missing blob {uri}");
        }
        let absolute = fs::canonicalize(&path)
            .with_context(|| format!("failed resolving {}", path.display()))?;
        Ok(presigned_url(
            &format!("file://{}", absolute.display()),
            ttl,
        ))
    }

    fn uri_for(&self, key: &str) -> String {
        format!("{FS_SCHEME}://{}/{}", self.bucket, key.trim())
    }
}

/// Process-local blob store used by tests and stub runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory blob store lock poisoned"))?;
        objects
            .get(uri.trim())
            .cloned()
            .ok_or_else(|| anyhow!("blob not found: {uri}"))
    }

    fn put(&self, bytes: &[u8], key_hint: &str) -> Result<String> {
        validate_key(key_hint)?;
        let uri = self.uri_for(key_hint);
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory blob store lock poisoned"))?;
        objects.insert(uri.clone(), bytes.to_vec());
        Ok(uri)
    }

    fn presign(&self, uri: &str, ttl: Duration) -> Result<String> {
        let objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory blob store lock poisoned"))?;
        if !objects.contains_key(uri.trim()) {
            bail!("cannot presign missing blob {uri}");
        }
        Ok(presigned_url(uri.trim(), ttl))
    }

    fn uri_for(&self, key: &str) -> String {
        format!("{MEMORY_SCHEME}://{}/{}", self.bucket, key.trim())
    }
}
