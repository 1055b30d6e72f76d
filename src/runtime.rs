//! Shared server state: the live config snapshot, the upstream HTTP client,
//! and the per-request mtime-driven reload check.
//!
//! Grounded in `original_source/.../core/runtime.py` for the reload
//! algorithm (double-checked locking against file mtime, client rebuild
//! gated on a timeout-signature change, old client kept alive for a grace
//! period) and in `inteniquetic-prx/src/main.rs` / `admin.rs` for the
//! `ArcSwap`-based snapshot pattern.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::SystemConfig;
use crate::store::{self, ConfigFormat};

/// Old client is kept alive this long after a swap so in-flight requests
/// started against it can finish.
const OLD_CLIENT_DRAIN: Duration = Duration::from_secs(5);

type TimeoutSignature = (u64, u64, u64);

fn timeout_signature(config: &SystemConfig) -> TimeoutSignature {
    let t = &config.proxy.timeout;
    (
        t.connect.to_bits(),
        t.read.to_bits(),
        t.write.to_bits(),
    )
}

fn build_http_client(config: &SystemConfig) -> reqwest::Client {
    let timeout = &config.proxy.timeout;
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs_f64(timeout.connect.max(0.0)))
        .timeout(Duration::from_secs_f64(timeout.read.max(timeout.write).max(0.0)))
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(20)
        .build()
        .expect("reqwest client configuration is always valid")
}

fn mtime_of(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

pub struct RuntimeState {
    pub config_path: PathBuf,
    pub config: ArcSwap<SystemConfig>,
    pub config_format: Mutex<ConfigFormat>,
    pub http_client: ArcSwap<reqwest::Client>,
    http_client_sig: Mutex<TimeoutSignature>,
    config_mtime: Mutex<u64>,
    reload_lock: AsyncMutex<()>,
}

impl RuntimeState {
    pub fn new(config_path: PathBuf, config: SystemConfig, format: ConfigFormat) -> Self {
        let mtime = mtime_of(&config_path);
        let sig = timeout_signature(&config);
        let http_client = build_http_client(&config);
        Self {
            config_path,
            config: ArcSwap::from_pointee(config),
            config_format: Mutex::new(format),
            http_client: ArcSwap::from_pointee(http_client),
            http_client_sig: Mutex::new(sig),
            config_mtime: Mutex::new(mtime),
            reload_lock: AsyncMutex::new(()),
        }
    }

    /// Swap in `config` (and, when the on-disk format changed too, `format`).
    /// Rebuilds the HTTP client only when the timeout signature actually
    /// changed, draining the old one asynchronously instead of closing it
    /// out from under in-flight requests.
    pub fn apply_config(&self, config: SystemConfig, format: Option<ConfigFormat>) {
        if let Some(format) = format {
            *self.config_format.lock().unwrap() = format;
        }

        let new_sig = timeout_signature(&config);
        self.config.store(std::sync::Arc::new(config));
        *self.config_mtime.lock().unwrap() = mtime_of(&self.config_path);

        let mut sig_guard = self.http_client_sig.lock().unwrap();
        if *sig_guard == new_sig {
            return;
        }
        *sig_guard = new_sig;
        drop(sig_guard);

        let new_client = build_http_client(&self.config.load());
        let old_client = self.http_client.swap(std::sync::Arc::new(new_client));
        tokio::spawn(async move {
            tokio::time::sleep(OLD_CLIENT_DRAIN).await;
            drop(old_client);
        });
    }

    /// Reload from disk if the file's mtime has advanced, using a
    /// double-checked lock so concurrent requests don't race to reload.
    pub async fn maybe_reload(&self) {
        let disk_mtime = mtime_of(&self.config_path);
        if disk_mtime == 0 || disk_mtime <= *self.config_mtime.lock().unwrap() {
            return;
        }

        let _guard = self.reload_lock.lock().await;
        let disk_mtime = mtime_of(&self.config_path);
        if disk_mtime == 0 || disk_mtime <= *self.config_mtime.lock().unwrap() {
            return;
        }

        match store::load_config(&self.config_path) {
            Ok(config) => {
                let (_, fmt) = store::read_raw_config(&self.config_path).unwrap_or((String::new(), ConfigFormat::Yaml));
                self.apply_config(config, Some(fmt));
            }
            Err(err) => {
                warn!(error = %err, path = %self.config_path.display(), "config reload failed, keeping previous config");
                *self.config_mtime.lock().unwrap() = disk_mtime;
            }
        }
    }
}
