//! Model Downloader
//!
//! One transfer per filename. Bytes stream into `<filename>.partial` next to the
//! destination and are renamed into place only after verification. A cancelled
//! or failed transfer removes the partial file, so there is never a resumable
//! leftover and never a corrupt finished file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::catalog::RemoteCatalog;
use super::gguf;
use super::types::{DownloadProgress, DownloadStatus, RemoteModelInfo};
use crate::llm_engine::provider::LlmError;

/// Suffix of in-flight download files
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Weight of the newest sample in the speed estimate
const SPEED_SMOOTHING: f64 = 0.3;

pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

type DownloadOutcome = Shared<BoxFuture<'static, Result<PathBuf, LlmError>>>;

/// Mutable part of a transfer, shared between the worker and observers
struct DownloadState {
    cancel: CancellationToken,
    progress: Mutex<DownloadProgress>,
    observers: Mutex<Vec<ProgressCallback>>,
}

impl DownloadState {
    fn snapshot(&self) -> DownloadProgress {
        match self.progress.lock() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut DownloadProgress)) {
        let mut guard = match self.progress.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    fn add_observer(&self, callback: ProgressCallback) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(callback);
        }
    }

    /// Notify observers outside the observer lock
    fn notify(&self) {
        let snapshot = self.snapshot();
        let observers: Vec<ProgressCallback> = match self.observers.lock() {
            Ok(o) => o.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer(&snapshot);
        }
    }
}

/// One active transfer
struct DownloadTask {
    state: Arc<DownloadState>,
    outcome: DownloadOutcome,
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub timeout: Duration,
    /// Minimum time between progress callbacks (a whole percent also triggers one)
    pub progress_interval: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600), // 1 hour for large models
            progress_interval: Duration::from_millis(500),
        }
    }
}

pub struct ModelDownloader {
    client: reqwest::Client,
    config: DownloaderConfig,
    catalog: Arc<dyn RemoteCatalog>,
    tasks: Arc<DashMap<String, DownloadTask>>,
}

impl ModelDownloader {
    pub fn new(catalog: Arc<dyn RemoteCatalog>, config: DownloaderConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::IoFailure(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            catalog,
            tasks: Arc::new(DashMap::new()),
        })
    }

    /// Download `info` to `destination`.
    ///
    /// A second call for a filename that is already downloading attaches its
    /// callback to the running transfer and resolves with the same outcome.
    pub async fn download_model(
        &self,
        info: RemoteModelInfo,
        destination: PathBuf,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, LlmError> {
        validate_request(&info)?;

        let outcome = match self.tasks.entry(info.filename.clone()) {
            Entry::Occupied(existing) => {
                log::info!("Download of {} already running, joining it", info.filename);
                if let Some(callback) = on_progress {
                    existing.get().state.add_observer(callback);
                }
                existing.get().outcome.clone()
            }
            Entry::Vacant(slot) => {
                let state = Arc::new(DownloadState {
                    cancel: CancellationToken::new(),
                    progress: Mutex::new(DownloadProgress {
                        filename: info.filename.clone(),
                        bytes_received: 0,
                        total_bytes: info.size_bytes,
                        fraction: 0.0,
                        speed_bps: 0.0,
                        speed_label: format_speed(0.0),
                        status: DownloadStatus::Pending,
                    }),
                    observers: Mutex::new(on_progress.into_iter().collect()),
                });

                let worker = TransferWorker {
                    client: self.client.clone(),
                    progress_interval: self.config.progress_interval,
                    state: Arc::clone(&state),
                    tasks: Arc::clone(&self.tasks),
                    info,
                    destination,
                };
                let handle = tokio::spawn(worker.run());
                let outcome = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(LlmError::DownloadFailed(format!("Download task failed: {}", e))))
                }
                .boxed()
                .shared();

                slot.insert(DownloadTask {
                    state,
                    outcome: outcome.clone(),
                });
                outcome
            }
        };

        outcome.await
    }

    /// Request cancellation; returns false when nothing is downloading under that name
    pub fn cancel_download(&self, filename: &str) -> bool {
        match self.tasks.get(filename) {
            Some(task) => {
                log::info!("Cancelling download of {}", filename);
                task.state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_download_progress(&self, filename: &str) -> Option<DownloadProgress> {
        self.tasks.get(filename).map(|t| t.state.snapshot())
    }

    pub fn list_downloads(&self) -> Vec<DownloadProgress> {
        let mut all: Vec<_> = self.tasks.iter().map(|t| t.state.snapshot()).collect();
        all.sort_by(|a, b| a.filename.cmp(&b.filename));
        all
    }

    pub fn is_downloading(&self, filename: &str) -> bool {
        self.tasks.contains_key(filename)
    }

    pub fn cancel_all(&self) {
        for task in self.tasks.iter() {
            task.state.cancel.cancel();
        }
    }

    /// Catalog listing; an unreachable catalog yields an empty list
    pub async fn get_available_models(&self) -> Vec<RemoteModelInfo> {
        match self.catalog.list_available().await {
            Ok(models) => models,
            Err(e) => {
                log::warn!("Model catalog unavailable: {}", e);
                Vec::new()
            }
        }
    }

    /// Catalog search; an unreachable catalog yields an empty list
    pub async fn search_models(&self, query: &str) -> Vec<RemoteModelInfo> {
        match self.catalog.search(query).await {
            Ok(models) => models,
            Err(e) => {
                log::warn!("Model catalog search for '{}' failed: {}", query, e);
                Vec::new()
            }
        }
    }
}

fn validate_request(info: &RemoteModelInfo) -> Result<(), LlmError> {
    let name = Path::new(&info.filename);
    if info.filename.is_empty() || name.file_name().map(|n| n != name.as_os_str()).unwrap_or(true) {
        return Err(LlmError::InvalidRequest(format!("Invalid filename '{}'", info.filename)));
    }
    let url = info.url.to_lowercase();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(LlmError::InvalidRequest(format!("Unsupported download URL '{}'", info.url)));
    }
    Ok(())
}

pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// "12.4 MB/s"
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    if bytes_per_sec >= GB {
        format!("{:.1} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.1} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.1} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

struct TransferWorker {
    client: reqwest::Client,
    progress_interval: Duration,
    state: Arc<DownloadState>,
    tasks: Arc<DashMap<String, DownloadTask>>,
    info: RemoteModelInfo,
    destination: PathBuf,
}

impl TransferWorker {
    async fn run(self) -> Result<PathBuf, LlmError> {
        let partial = partial_path(&self.destination);
        let result = self.transfer(&partial).await;

        if result.is_err() {
            match tokio::fs::remove_file(&partial).await {
                Ok(()) => log::debug!("Removed partial file {}", partial.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove partial file {}: {}", partial.display(), e),
            }
        }

        // The task leaves the table before anyone learns the outcome
        self.tasks.remove(&self.info.filename);

        let status = match &result {
            Ok(_) => DownloadStatus::Completed,
            Err(LlmError::Cancelled) => DownloadStatus::Cancelled,
            Err(e) => DownloadStatus::Failed(e.to_string()),
        };
        match &result {
            Ok(path) => log::info!("Downloaded {} to {}", self.info.filename, path.display()),
            Err(LlmError::Cancelled) => log::info!("Download of {} cancelled", self.info.filename),
            Err(e) => log::error!("Download of {} failed: {}", self.info.filename, e),
        }
        self.state.update(|p| p.status = status);
        self.state.notify();

        result
    }

    async fn transfer(&self, partial: &Path) -> Result<PathBuf, LlmError> {
        let cancel = self.state.cancel.clone();

        if tokio::fs::try_exists(&self.destination).await.unwrap_or(false) {
            log::info!("{} already present, skipping download", self.destination.display());
            return Ok(self.destination.clone());
        }
        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LlmError::IoFailure(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        log::info!("Starting download of {} from {}", self.info.filename, self.info.url);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            response = self.client.get(&self.info.url).send() => response
                .map_err(|e| LlmError::DownloadFailed(format!("Failed to start download: {}", e)))?,
        };

        if !response.status().is_success() {
            return Err(LlmError::DownloadFailed(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let content_length = response.content_length();
        let total = content_length.unwrap_or(self.info.size_bytes);
        self.state.update(|p| {
            p.total_bytes = total;
            p.status = DownloadStatus::Active;
        });
        self.state.notify();

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| LlmError::IoFailure(format!("Failed to create {}: {}", partial.display(), e)))?;

        let mut hasher = self.info.sha256.as_ref().map(|_| Sha256::new());
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut meter = SpeedMeter::new(Instant::now());
        let mut last_notified_at = Instant::now();
        let mut last_percent: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk.map_err(|e| LlmError::DownloadFailed(format!("Download error: {}", e)))?,
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| LlmError::IoFailure(format!("Failed to write chunk: {}", e)))?;
            if let Some(h) = hasher.as_mut() {
                h.update(&chunk);
            }
            received += chunk.len() as u64;
            crate::perf_trace!("{}: +{} bytes ({} total)", self.info.filename, chunk.len(), received);

            let now = Instant::now();
            let percent = if total > 0 { received * 100 / total } else { 0 };
            if percent > last_percent || now.duration_since(last_notified_at) >= self.progress_interval {
                let speed = meter.sample(received, now);
                self.state.update(|p| {
                    p.bytes_received = received;
                    p.fraction = fraction(received, total);
                    p.speed_bps = speed;
                    p.speed_label = format_speed(speed);
                });
                self.state.notify();
                last_notified_at = now;
                last_percent = percent;
            }
        }

        file.flush()
            .await
            .map_err(|e| LlmError::IoFailure(format!("Failed to flush file: {}", e)))?;
        drop(file);

        self.state.update(|p| {
            p.bytes_received = received;
            p.fraction = fraction(received, total);
            p.status = DownloadStatus::Verifying;
        });
        self.state.notify();

        self.verify(partial, received, content_length, hasher)?;

        tokio::fs::rename(partial, &self.destination)
            .await
            .map_err(|e| LlmError::IoFailure(format!("Failed to move download into place: {}", e)))?;

        Ok(self.destination.clone())
    }

    fn verify(
        &self,
        partial: &Path,
        received: u64,
        content_length: Option<u64>,
        hasher: Option<Sha256>,
    ) -> Result<(), LlmError> {
        if let Some(expected) = content_length {
            if received != expected {
                return Err(LlmError::DownloadFailed(format!(
                    "Transfer ended early: {} of {} bytes",
                    received, expected
                )));
            }
        }

        if let (Some(expected), Some(hasher)) = (self.info.sha256.as_ref(), hasher) {
            let actual = hex(&hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(LlmError::DownloadFailed(format!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    self.info.filename, expected, actual
                )));
            }
        }

        let is_gguf_name = self.info.filename.to_lowercase().ends_with(".gguf");
        if is_gguf_name && !gguf::has_gguf_magic(partial) {
            return Err(LlmError::DownloadFailed(format!(
                "{} is not a GGUF model file",
                self.info.filename
            )));
        }
        Ok(())
    }
}

fn fraction(received: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (received as f64 / total as f64).min(1.0) as f32
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Exponentially smoothed transfer rate
struct SpeedMeter {
    last_at: Instant,
    last_bytes: u64,
    rate: Option<f64>,
}

impl SpeedMeter {
    fn new(start: Instant) -> Self {
        Self {
            last_at: start,
            last_bytes: 0,
            rate: None,
        }
    }

    fn sample(&mut self, bytes: u64, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return self.rate.unwrap_or(0.0);
        }
        let instant = (bytes - self.last_bytes) as f64 / elapsed;
        let rate = match self.rate {
            Some(prev) => SPEED_SMOOTHING * instant + (1.0 - SPEED_SMOOTHING) * prev,
            None => instant,
        };
        self.rate = Some(rate);
        self.last_at = now;
        self.last_bytes = bytes;
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::testing::{gguf_fixture_bytes, remote_model, GgufFixture, StaticCatalog};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `body` to every connection; stall after `stall_after` bytes when set
    async fn serve(body: Vec<u8>, stall_after: Option<usize>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = socket.read(&mut request).await;
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    match stall_after {
                        Some(n) => {
                            let _ = socket.write_all(&body[..n]).await;
                            let _ = socket.flush().await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        None => {
                            for chunk in body.chunks(4096) {
                                let _ = socket.write_all(chunk).await;
                                tokio::time::sleep(Duration::from_millis(5)).await;
                            }
                        }
                    }
                });
            }
        });

        (format!("http://{}", addr), connections)
    }

    fn downloader() -> ModelDownloader {
        ModelDownloader::new(
            Arc::new(StaticCatalog::new(Vec::new())),
            DownloaderConfig {
                timeout: Duration::from_secs(60),
                progress_interval: Duration::from_millis(10),
            },
        )
        .unwrap()
    }

    fn model_body(len: usize) -> Vec<u8> {
        let mut body = gguf_fixture_bytes(&GgufFixture::default());
        body.resize(len, 7);
        body
    }

    #[tokio::test]
    async fn test_download_completes_and_reports_progress() {
        let dir = tempdir().unwrap();
        let body = model_body(64 * 1024);
        let (base, _) = serve(body.clone(), None).await;
        let downloader = downloader();

        let seen = Arc::new(Mutex::new(Vec::<DownloadProgress>::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |p: &DownloadProgress| sink.lock().unwrap().push(p.clone()));

        let dest = dir.path().join("model.gguf");
        let path = downloader
            .download_model(remote_model("model.gguf", &format!("{}/model.gguf", base)), dest.clone(), Some(callback))
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!partial_path(&dest).exists());
        assert!(downloader.get_download_progress("model.gguf").is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().unwrap().status, DownloadStatus::Completed);
        // Throttled: far fewer callbacks than chunks would allow per byte
        assert!(seen.len() < body.len() / 100);
        let fractions: Vec<f32> = seen.iter().map(|p| p.fraction).collect();
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_cancel_at_forty_percent_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let body = model_body(100_000);
        let (base, _) = serve(body, Some(40_000)).await;
        let downloader = Arc::new(downloader());
        let dest = dir.path().join("model.gguf");

        let canceller = Arc::clone(&downloader);
        let callback: ProgressCallback = Arc::new(move |p: &DownloadProgress| {
            if p.fraction >= 0.4 {
                canceller.cancel_download("model.gguf");
            }
        });

        let result = downloader
            .download_model(remote_model("model.gguf", &format!("{}/model.gguf", base)), dest.clone(), Some(callback))
            .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert!(downloader.get_download_progress("model.gguf").is_none());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        assert!(!downloader.cancel_download("model.gguf"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_transfer() {
        let dir = tempdir().unwrap();
        let (base, connections) = serve(model_body(256 * 1024), None).await;
        let downloader = downloader();
        let info = remote_model("shared.gguf", &format!("{}/shared.gguf", base));
        let dest = dir.path().join("shared.gguf");

        let second_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&second_calls);
        let second_cb: ProgressCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (a, b) = tokio::join!(
            downloader.download_model(info.clone(), dest.clone(), None),
            downloader.download_model(info.clone(), dest.clone(), Some(second_cb)),
        );

        assert_eq!(a.unwrap(), dest);
        assert_eq!(b.unwrap(), dest);
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert!(second_calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_partial() {
        let dir = tempdir().unwrap();
        let (base, _) = serve(model_body(8 * 1024), None).await;
        let downloader = downloader();
        let dest = dir.path().join("bad.gguf");

        let mut info = remote_model("bad.gguf", &format!("{}/bad.gguf", base));
        info.sha256 = Some("00".repeat(32));

        let result = downloader.download_model(info, dest.clone(), None).await;
        assert!(matches!(result, Err(LlmError::DownloadFailed(ref m)) if m.contains("Checksum")));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_matching_checksum_is_accepted() {
        let dir = tempdir().unwrap();
        let body = model_body(8 * 1024);
        let (base, _) = serve(body.clone(), None).await;
        let downloader = downloader();

        let mut info = remote_model("ok.gguf", &format!("{}/ok.gguf", base));
        info.sha256 = Some(hex(&Sha256::digest(&body)).to_uppercase());

        let dest = dir.path().join("ok.gguf");
        assert_eq!(downloader.download_model(info, dest.clone(), None).await.unwrap(), dest);
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let dir = tempdir().unwrap();
        let downloader = downloader();

        let traversal = remote_model("../evil.gguf", "http://127.0.0.1/evil.gguf");
        assert!(matches!(
            downloader.download_model(traversal, dir.path().join("x"), None).await,
            Err(LlmError::InvalidRequest(_))
        ));

        let scheme = remote_model("m.gguf", "ftp://host/m.gguf");
        assert!(matches!(
            downloader.download_model(scheme, dir.path().join("m.gguf"), None).await,
            Err(LlmError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_catalog_outage_yields_empty_lists() {
        let downloader = ModelDownloader::new(
            Arc::new(StaticCatalog::unavailable()),
            DownloaderConfig::default(),
        )
        .unwrap();
        assert!(downloader.get_available_models().await.is_empty());
        assert!(downloader.search_models("llama").await.is_empty());
    }

    #[test]
    fn test_speed_label_and_partial_path() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(12.4 * 1024.0 * 1024.0), "12.4 MB/s");
        assert_eq!(
            partial_path(Path::new("/m/model.gguf")),
            PathBuf::from("/m/model.gguf.partial")
        );
    }
}
