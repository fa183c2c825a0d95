//! File cache + daily call limit around any `TextGenerator`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{GenerationRequest, TextGenerator};

/// Counter state is guarded by a `Mutex`; it is never held across an await.
pub struct CachingGenerator<P: TextGenerator> {
    inner: P,
    cache_dir: PathBuf,
    daily_limit_max: u32,
    counter: Arc<Mutex<DailyCounter>>,
}

impl<P: TextGenerator> CachingGenerator<P> {
    pub fn new(inner: P, cache_dir: PathBuf, daily_limit_max: u32) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            warn!(target: "generation", dir = %cache_dir.display(), error = %e, "cannot create cache dir");
        }
        let counter = Arc::new(Mutex::new(
            load_daily_counter(&cache_dir).unwrap_or_default(),
        ));
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter,
        }
    }

    /// Real calls made today.
    pub fn calls_today(&self) -> u32 {
        self.counter
            .lock()
            .map(|g| if g.is_expired() { 0 } else { g.count })
            .unwrap_or(0)
    }

    fn check_limit(&self) -> anyhow::Result<()> {
        let mut g = self
            .counter
            .lock()
            .map_err(|_| anyhow!("daily counter lock poisoned"))?;
        if g.is_expired() {
            g.reset_to_today();
            let _ = save_daily_counter(&self.cache_dir, &g);
        }
        if g.count >= self.daily_limit_max {
            return Err(anyhow!(
                "daily generation limit of {} calls reached",
                self.daily_limit_max
            ));
        }
        Ok(())
    }

    fn bump(&self) {
        if let Ok(mut g) = self.counter.lock() {
            g.count = g.count.saturating_add(1);
            let _ = save_daily_counter(&self.cache_dir, &g);
        }
    }
}

#[async_trait]
impl<P: TextGenerator> TextGenerator for CachingGenerator<P> {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let key = cache_key(request)?;
        if let Some(hit) = read_cache_file(&self.cache_dir, &key) {
            debug!(target: "generation", kind = request.kind(), %key, "cache hit");
            return Ok(hit.response);
        }

        // Only real calls count against the limit.
        self.check_limit()?;
        let response = self.inner.generate(request).await?;
        self.bump();
        if let Err(e) = write_cache_file(
            &self.cache_dir,
            &key,
            &CachedResponse {
                response: response.clone(),
            },
        ) {
            warn!(target: "generation", %key, error = %e, "cache write failed");
        }
        Ok(response)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

// ------------------------------------------------------------
// File cache helpers
// ------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse {
    response: String,
}

fn cache_key(request: &GenerationRequest) -> anyhow::Result<String> {
    use sha2::{Digest, Sha256};
    use std::fmt::Write as _;

    let canonical = serde_json::to_string(request).context("serialising request for cache key")?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(32);
    for b in digest.iter().take(16) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    Ok(out)
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cache_file(dir: &Path, key: &str) -> Option<CachedResponse> {
    let s = fs::read_to_string(cache_path(dir, key)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    fs::rename(tmp, path)
}

fn write_cache_file(dir: &Path, key: &str, value: &CachedResponse) -> io::Result<()> {
    let json = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&cache_path(dir, key), &json)
}

// ------------------------------------------------------------
// Daily counter helpers
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}

impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}

impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    chrono::Utc::now().date_naive().to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

fn load_daily_counter(dir: &Path) -> io::Result<DailyCounter> {
    let s = fs::read_to_string(counter_path(dir))?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_daily_counter(dir: &Path, dc: &DailyCounter) -> io::Result<()> {
    let json = serde_json::to_vec(dc).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(&counter_path(dir), &json)
}
