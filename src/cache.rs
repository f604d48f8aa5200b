use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use bytes::Bytes;

use crate::record::{RequestRecord, ResponseMeta, ResponseRecord};

const REQ_META_SUFFIX: &str = "_req.json";
const REQ_BODY_SUFFIX: &str = "_req_body";
const RESP_META_SUFFIX: &str = "_resp.json";
const RESP_BODY_SUFFIX: &str = "_resp_body";

#[derive(Debug)]
pub enum CacheError {
    Io { path: PathBuf, source: std::io::Error },
    Serialize(serde_json::Error),
    Deserialize { path: PathBuf, source: serde_json::Error },
    Join(tokio::task::JoinError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cache file {}: {source}", path.display()),
            Self::Serialize(err) => write!(f, "serialize cache entry: {err}"),
            Self::Deserialize { path, source } => {
                write!(f, "parse cache file {}: {source}", path.display())
            }
            Self::Join(err) => write!(f, "cache task failed: {err}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(err) => Some(err),
            Self::Deserialize { source, .. } => Some(source),
            Self::Join(err) => Some(err),
        }
    }
}

/// Content-addressed store of request/response pairs, keyed only by the request fingerprint.
#[derive(Debug, Clone)]
pub enum ReplayCache {
    File(FileCache),
    Memory(MemoryCache),
    Null,
}

impl ReplayCache {
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::File(FileCache::new(dir))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryCache::default())
    }

    /// Returns the stored response for `req`, or `None` on a miss.
    ///
    /// Unreadable entries count as misses.
    pub async fn load(&self, req: &RequestRecord) -> Option<ResponseRecord> {
        let key = req.fingerprint();
        let loaded = match self {
            Self::File(cache) => cache.load(&key).await,
            Self::Memory(cache) => Ok(cache.load(&key)),
            Self::Null => Ok(None),
        };
        match loaded {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(key = %key, "cache load failed, treating as miss: {err}");
                None
            }
        }
    }

    pub async fn store(&self, req: &RequestRecord, resp: &ResponseRecord) -> Result<(), CacheError> {
        match self {
            Self::File(cache) => cache.store(req, resp).await,
            Self::Memory(cache) => {
                cache.store(req, resp);
                Ok(())
            }
            Self::Null => Ok(()),
        }
    }
}

/// Four files per entry in one flat directory: `H_req.json`, `H_req_body`, `H_resp.json`,
/// `H_resp_body`.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn entry_paths(&self, key: &str) -> EntryPaths {
        EntryPaths {
            req_meta: self.dir.join(format!("{key}{REQ_META_SUFFIX}")),
            req_body: self.dir.join(format!("{key}{REQ_BODY_SUFFIX}")),
            resp_meta: self.dir.join(format!("{key}{RESP_META_SUFFIX}")),
            resp_body: self.dir.join(format!("{key}{RESP_BODY_SUFFIX}")),
        }
    }

    pub async fn load(&self, key: &str) -> Result<Option<ResponseRecord>, CacheError> {
        let paths = self.entry_paths(key);
        let response = tokio::task::spawn_blocking(move || load_blocking(&paths))
            .await
            .map_err(CacheError::Join)??;
        if response.is_some() {
            tracing::debug!(
                key = %key,
                file = %self.entry_paths(key).req_body.display(),
                "cache hit"
            );
        }
        Ok(response)
    }

    pub async fn store(&self, req: &RequestRecord, resp: &ResponseRecord) -> Result<(), CacheError> {
        let paths = self.entry_paths(&req.fingerprint());
        let entry = EncodedEntry {
            req_meta: serde_json::to_vec_pretty(&req.meta()).map_err(CacheError::Serialize)?,
            req_body: req.body().clone(),
            resp_meta: serde_json::to_vec_pretty(&resp.meta()).map_err(CacheError::Serialize)?,
            resp_body: resp.body().clone(),
        };
        tokio::task::spawn_blocking(move || store_blocking(&paths, &entry))
            .await
            .map_err(CacheError::Join)?
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    pub req_meta: PathBuf,
    pub req_body: PathBuf,
    pub resp_meta: PathBuf,
    pub resp_body: PathBuf,
}

struct EncodedEntry {
    req_meta: Vec<u8>,
    req_body: Bytes,
    resp_meta: Vec<u8>,
    resp_body: Bytes,
}

fn load_blocking(paths: &EntryPaths) -> Result<Option<ResponseRecord>, CacheError> {
    let Some(meta_bytes) = read_optional(&paths.resp_meta)? else {
        return Ok(None);
    };
    let Some(body) = read_optional(&paths.resp_body)? else {
        return Ok(None);
    };
    let meta: ResponseMeta =
        serde_json::from_slice(&meta_bytes).map_err(|source| CacheError::Deserialize {
            path: paths.resp_meta.clone(),
            source,
        })?;
    Ok(Some(ResponseRecord::from_meta(meta, body)))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn store_blocking(paths: &EntryPaths, entry: &EncodedEntry) -> Result<(), CacheError> {
    for (path, contents) in [
        (&paths.req_meta, entry.req_meta.as_slice()),
        (&paths.req_body, entry.req_body.as_ref()),
        (&paths.resp_meta, entry.resp_meta.as_slice()),
        (&paths.resp_body, entry.resp_body.as_ref()),
    ] {
        fs::write(path, contents).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Process-local cache, mostly useful for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, ResponseRecord>>>,
}

impl MemoryCache {
    pub fn load(&self, key: &str) -> Option<ResponseRecord> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(key).cloned()
    }

    pub fn store(&self, req: &RequestRecord, resp: &ResponseRecord) {
        let stored = ResponseRecord::from_meta(resp.meta(), resp.body().clone());
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(req.fingerprint(), stored);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::{HeaderMap, Request, StatusCode, header};
    use tempfile::tempdir;

    use super::{FileCache, ReplayCache};
    use crate::record::{RequestRecord, ResponseRecord};

    fn request(method: &str, url: &str, body: &'static [u8]) -> RequestRecord {
        let request = Request::builder()
            .method(method)
            .uri(url)
            .header(header::HOST, "example.test")
            .body(Full::new(Bytes::from_static(body)))
            .unwrap();
        let (parts, _) = request.into_parts();
        RequestRecord::from_parts(parts, Bytes::from_static(body))
    }

    fn response(status: StatusCode, body: &'static [u8]) -> ResponseRecord {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        headers.append(header::SET_COOKIE, "a=1".parse().unwrap());
        headers.append(header::SET_COOKIE, "b=2".parse().unwrap());
        ResponseRecord::new(status, headers, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn store_then_load_returns_status_headers_and_body() {
        let temp_dir = tempdir().unwrap();
        let cache = ReplayCache::file(temp_dir.path());
        let req = request("GET", "http://example.test/a", b"");

        assert!(cache.load(&req).await.is_none());
        cache
            .store(&req, &response(StatusCode::OK, b"hello"))
            .await
            .expect("store should succeed");

        let loaded = cache.load(&req).await.expect("entry should load");
        assert_eq!(loaded.status(), 200);
        assert_eq!(&loaded.body()[..], b"hello");
        assert_eq!(loaded.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(loaded.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[tokio::test]
    async fn store_writes_four_files_named_by_fingerprint() {
        let temp_dir = tempdir().unwrap();
        let cache = FileCache::new(temp_dir.path());
        let req = request("GET", "http://example.test/a", b"");
        assert_eq!(req.fingerprint(), "fa7af48cb9");

        cache
            .store(&req, &response(StatusCode::OK, b"hello"))
            .await
            .unwrap();

        let mut names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            [
                "fa7af48cb9_req.json",
                "fa7af48cb9_req_body",
                "fa7af48cb9_resp.json",
                "fa7af48cb9_resp_body",
            ]
        );

        let req_meta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(temp_dir.path().join("fa7af48cb9_req.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(req_meta["Method"], "GET");
        assert_eq!(req_meta["URL"], "http://example.test/a");
        let resp_meta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(temp_dir.path().join("fa7af48cb9_resp.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(resp_meta["Status"], 200);
        assert_eq!(
            std::fs::read(temp_dir.path().join("fa7af48cb9_resp_body")).unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn repeated_store_is_byte_identical() {
        let temp_dir = tempdir().unwrap();
        let cache = FileCache::new(temp_dir.path());
        let req = request("POST", "http://x/", b"a");
        let resp = response(StatusCode::CREATED, b"\x00\x01binary\xff");

        cache.store(&req, &resp).await.unwrap();
        let paths = cache.entry_paths(&req.fingerprint());
        let first: Vec<_> = [&paths.req_meta, &paths.req_body, &paths.resp_meta, &paths.resp_body]
            .into_iter()
            .map(|path| std::fs::read(path).unwrap())
            .collect();

        cache.store(&req, &resp).await.unwrap();
        let second: Vec<_> = [&paths.req_meta, &paths.req_body, &paths.resp_meta, &paths.resp_body]
            .into_iter()
            .map(|path| std::fs::read(path).unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn partial_entry_is_a_miss() {
        let temp_dir = tempdir().unwrap();
        let cache = FileCache::new(temp_dir.path());
        let req = request("GET", "http://example.test/a", b"");
        let paths = cache.entry_paths(&req.fingerprint());

        std::fs::write(&paths.resp_meta, br#"{"Status": 200, "Header": {}}"#).unwrap();
        assert!(cache.load(&req.fingerprint()).await.unwrap().is_none());

        std::fs::remove_file(&paths.resp_meta).unwrap();
        std::fs::write(&paths.resp_body, b"hello").unwrap();
        assert!(cache.load(&req.fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_meta_is_an_error_and_a_miss_through_the_enum() {
        let temp_dir = tempdir().unwrap();
        let file_cache = FileCache::new(temp_dir.path());
        let req = request("GET", "http://example.test/a", b"");
        let paths = file_cache.entry_paths(&req.fingerprint());
        std::fs::write(&paths.resp_meta, b"not json").unwrap();
        std::fs::write(&paths.resp_body, b"hello").unwrap();

        let err = file_cache.load(&req.fingerprint()).await.unwrap_err();
        assert!(err.to_string().contains("parse cache file"), "error: {err}");
        assert!(ReplayCache::File(file_cache).load(&req).await.is_none());
    }

    #[tokio::test]
    async fn store_into_missing_directory_fails() {
        let temp_dir = tempdir().unwrap();
        let cache = ReplayCache::file(temp_dir.path().join("missing"));
        let req = request("GET", "http://example.test/a", b"");

        let err = cache
            .store(&req, &response(StatusCode::OK, b"hello"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cache file"), "error: {err}");
    }

    #[tokio::test]
    async fn different_bodies_are_independent_entries() {
        let cache = ReplayCache::memory();
        let req_a = request("POST", "http://x/", b"a");
        let req_b = request("POST", "http://x/", b"b");
        assert_ne!(req_a.fingerprint(), req_b.fingerprint());

        cache
            .store(&req_a, &response(StatusCode::OK, b"for a"))
            .await
            .unwrap();
        assert!(cache.load(&req_b).await.is_none());
        assert_eq!(&cache.load(&req_a).await.unwrap().body()[..], b"for a");
    }

    #[tokio::test]
    async fn null_cache_never_hits() {
        let cache = ReplayCache::Null;
        let req = request("GET", "http://example.test/a", b"");
        cache
            .store(&req, &response(StatusCode::OK, b"hello"))
            .await
            .unwrap();
        assert!(cache.load(&req).await.is_none());
    }
}
