use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

use tokio::fs;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Stable identifier of an API request.
///
/// Canonical form: coordinates rounded to 4 decimals, then every
/// `name=value` request parameter in sorted order, hashed with BLAKE3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(latitude: f64, longitude: f64, params: &[(&str, String)]) -> Self {
        let mut pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        pairs.sort_unstable();

        let mut canonical = format!("{latitude:.4}_{longitude:.4}");
        for (name, value) in pairs {
            canonical.push('&');
            canonical.push_str(name);
            canonical.push('=');
            canonical.push_str(value);
        }

        CacheKey(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

/// Whether an entry written at `modified` is still inside the TTL window.
/// Entries with a modification time in the future count as fresh.
pub fn is_fresh(modified: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age < ttl,
        Err(_) => true,
    }
}

/// File-backed store of raw API response bodies, one file per [`CacheKey`].
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Return the cached body for `key` if present and fresh.
    ///
    /// Read failures are logged and reported as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match self.read_fresh(&path).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable cache entry, treating as miss");
                metrics::counter!("weather_cache_read_errors_total").increment(1);
                None
            }
        }
    }

    /// Store `payload` verbatim under `key`, replacing any stale entry.
    pub async fn put(&self, key: &CacheKey, payload: &[u8]) -> Result<PathBuf, CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?;

        let path = self.path_for(key);
        // Write then rename so readers never observe a half-written entry.
        // Temp names are unique per write so concurrent writers of one key never share a file.
        let tmp = self.dir.join(format!(
            "{}.{}-{}.tmp",
            key.file_name(),
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = fs::write(&tmp, payload).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::io(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CacheError::io(&path, e));
        }

        Ok(path)
    }

    async fn read_fresh(&self, path: &Path) -> Result<Option<Vec<u8>>, CacheError> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };

        let modified = meta.modified().map_err(|e| CacheError::io(path, e))?;
        if !is_fresh(modified, SystemTime::now(), self.ttl) {
            tracing::debug!(path = %path.display(), "cache entry expired");
            return Ok(None);
        }

        let bytes = fs::read(path).await.map_err(|e| CacheError::io(path, e))?;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(order: &[(&'static str, &str)]) -> Vec<(&'static str, String)> {
        order.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn key_ignores_parameter_order() {
        let a = CacheKey::for_request(
            49.8951,
            -97.1384,
            &params(&[("hourly", "temperature_2m"), ("timezone", "auto")]),
        );
        let b = CacheKey::for_request(
            49.8951,
            -97.1384,
            &params(&[("timezone", "auto"), ("hourly", "temperature_2m")]),
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn key_uses_four_decimal_coordinates() {
        let p = params(&[("timezone", "auto")]);
        let a = CacheKey::for_request(49.895_11, -97.138_41, &p);
        let b = CacheKey::for_request(49.895_09, -97.138_39, &p);
        let c = CacheKey::for_request(49.896, -97.138_4, &p);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_changes_with_parameter_values() {
        let a = CacheKey::for_request(1.0, 2.0, &params(&[("forecast_days", "1")]));
        let b = CacheKey::for_request(1.0, 2.0, &params(&[("forecast_days", "2")]));
        assert_ne!(a, b);
    }

    #[test]
    fn freshness_window() {
        let now = SystemTime::now();
        let ttl = Duration::from_secs(3600);
        assert!(is_fresh(now - Duration::from_secs(10), now, ttl));
        assert!(!is_fresh(now - Duration::from_secs(3600), now, ttl));
        assert!(!is_fresh(now - Duration::from_secs(7200), now, ttl));
        assert!(is_fresh(now + Duration::from_secs(5), now, ttl));
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), DEFAULT_TTL);
        let key = CacheKey::for_request(1.0, 2.0, &[]);
        let body = br#"{"hourly":{"time":[]}}"#;

        assert!(cache.get(&key).await.is_none());
        let path = cache.put(&key, body).await.unwrap();
        assert_eq!(path, dir.path().join(key.file_name()));
        assert_eq!(cache.get(&key).await.as_deref(), Some(&body[..]));
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), Duration::ZERO);
        let key = CacheKey::for_request(1.0, 2.0, &[]);

        cache.put(&key, b"{}").await.unwrap();
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn put_creates_missing_directory_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path().join("nested").join("cache"), DEFAULT_TTL);
        let key = CacheKey::for_request(1.0, 2.0, &[]);

        cache.put(&key, b"old").await.unwrap();
        cache.put(&key, b"new").await.unwrap();
        assert_eq!(cache.get(&key).await.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_to_one_key_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), DEFAULT_TTL);
        let key = CacheKey::for_request(62.454, -114.3718, &[]);
        let bodies: Vec<Vec<u8>> = (0..16).map(|i| format!("{{\"n\":{i}}}").into_bytes()).collect();

        let results = futures::future::join_all(bodies.iter().map(|b| cache.put(&key, b))).await;
        assert!(results.iter().all(Result::is_ok), "{results:?}");

        let stored = cache.get(&key).await.unwrap();
        assert!(bodies.contains(&stored));

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![key.file_name()]);
    }
}
