//! CVAT dataset export client.
//!
//! An export is requested with `GET /api/<kind>s/<id>/dataset?format=...`.
//! CVAT answers `202` while the export is being prepared, `201` once it is
//! ready to fetch with `action=download`, and `200` with the archive body.

use crate::archive;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FORMAT: &str = "datumaro";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("CVAT API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("expected application/zip, server sent '{0}'")]
    UnexpectedContentType(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not unpack archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// What kind of CVAT object an id refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatasetKind {
    Project,
    #[default]
    Task,
    Job,
}

impl DatasetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::Project => "project",
            DatasetKind::Task => "task",
            DatasetKind::Job => "job",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a short format name to the name CVAT expects. Unknown names are
/// passed through so any format CVAT supports can still be requested.
pub fn cvat_format_name(short: &str) -> String {
    let name = match short {
        "datumaro" => "Datumaro 1.0",
        "coco" => "COCO 1.0",
        "pascal" | "voc" => "PASCAL VOC 1.1",
        "labelme" => "LabelMe 3.0",
        "mask" => "Segmentation mask 1.1",
        "mot" => "MOT 1.1",
        "tfrecord" => "TFRecord 1.0",
        "yolo" => "YOLO 1.1",
        other => other,
    };
    name.to_string()
}

/// Progress notifications emitted while an export is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// The server is still preparing the export.
    Waiting,
    /// The archive body started; `total` is the announced length.
    Started { total: Option<u64> },
    Received(u64),
}

/// Thin client over the CVAT REST API.
#[derive(Debug, Clone)]
pub struct CvatClient {
    client: reqwest::Client,
    base_url: String,
    auth: Option<(String, Option<String>)>,
    poll_interval: Duration,
}

impl CvatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Basic auth is sent when either part is present.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.auth = match (username, password) {
            (None, None) => None,
            (username, password) => Some((username.unwrap_or_default(), password)),
        };
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn dataset_url(&self, kind: DatasetKind, id: u64) -> String {
        format!("{}/api/{}s/{}/dataset", self.base_url, kind, id)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransferError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Request an export and stream the archive into `dest`. Returns the
    /// number of bytes written. A cancelled or failed transfer leaves no
    /// partial file behind.
    pub async fn export_dataset<F>(
        &self,
        kind: DatasetKind,
        id: u64,
        format: &str,
        dest: &Path,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<u64, TransferError>
    where
        F: Fn(TransferEvent),
    {
        let url = self.dataset_url(kind, id);
        let mut params = vec![("format", cvat_format_name(format))];
        let mut requested_download = false;

        loop {
            let mut request = self.client.get(&url).query(&params);
            if let Some((username, password)) = &self.auth {
                request = request.basic_auth(username, password.as_ref());
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                response = request.send() => response?,
            };
            let response = Self::ensure_success(response).await?;

            match response.status() {
                StatusCode::OK => {
                    let result = self.receive(response, dest, cancel, &on_event).await;
                    if result.is_err() && dest.exists() {
                        if let Err(e) = tokio::fs::remove_file(dest).await {
                            log::warn!("Failed to remove partial archive {}: {}", dest.display(), e);
                        }
                    }
                    return result;
                }
                StatusCode::CREATED if !requested_download => {
                    log::debug!("{} {} export ready, requesting download", kind, id);
                    params.push(("action", "download".to_string()));
                    requested_download = true;
                }
                status => {
                    log::debug!("{} {} export pending ({})", kind, id, status);
                    on_event(TransferEvent::Waiting);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn receive<F>(
        &self,
        mut response: reqwest::Response,
        dest: &Path,
        cancel: &CancellationToken,
        on_event: &F,
    ) -> Result<u64, TransferError>
    where
        F: Fn(TransferEvent),
    {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with(ZIP_CONTENT_TYPE) {
            return Err(TransferError::UnexpectedContentType(content_type));
        }

        on_event(TransferEvent::Started {
            total: response.content_length(),
        });
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = File::create(dest).await?;
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            on_event(TransferEvent::Received(chunk.len() as u64));
        }
        file.flush().await?;
        Ok(written)
    }
}

/// One export to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub kind: DatasetKind,
    pub id: u64,
    pub format: String,
}

impl ExportRequest {
    pub fn new(kind: DatasetKind, id: u64, format: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            format: format.into(),
        }
    }

    /// `<format>_<kind>_<id>`, shared by the archive and the unpacked directory.
    pub fn output_stem(&self) -> String {
        format!("{}_{}_{}", self.format, self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Written to `path` (a directory, or the archive with unzip disabled).
    Downloaded { path: PathBuf, bytes: u64 },
    /// The output already existed.
    Skipped { path: PathBuf },
}

#[derive(Debug)]
pub struct DownloadReport {
    pub request: ExportRequest,
    pub result: Result<DownloadOutcome, TransferError>,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs one task per export and keeps their failures apart.
pub struct Downloader {
    client: CvatClient,
    output_dir: PathBuf,
    unzip: bool,
    progress: MultiProgress,
}

impl Downloader {
    pub fn new(client: CvatClient, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            output_dir: output_dir.into(),
            unzip: true,
            progress: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        }
    }

    pub fn with_unzip(mut self, unzip: bool) -> Self {
        self.unzip = unzip;
        self
    }

    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Fetch every request concurrently. Reports come back in request order.
    pub async fn run(&self, requests: Vec<ExportRequest>, cancel: &CancellationToken) -> Vec<DownloadReport> {
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let bar = self.progress.add(new_bar(&request));
            let client = self.client.clone();
            let output_dir = self.output_dir.clone();
            let unzip = self.unzip;
            let cancel = cancel.clone();
            let task_request = request.clone();
            let handle = tokio::spawn(async move {
                let result = fetch(&client, &task_request, &output_dir, unzip, &cancel, &bar).await;
                match &result {
                    Ok(DownloadOutcome::Downloaded { .. }) => bar.finish_with_message("done"),
                    Ok(DownloadOutcome::Skipped { .. }) => bar.finish_with_message("already exists, skipping"),
                    Err(e) => bar.abandon_with_message(format!("failed: {e}")),
                }
                result
            });
            handles.push((request, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (request, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(TransferError::Io(std::io::Error::other(e))),
            };
            if let Err(e) = &result {
                log::error!("Failed exporting {} {}: {}", request.kind, request.id, e);
            }
            reports.push(DownloadReport { request, result });
        }
        reports
    }
}

fn new_bar(request: &ExportRequest) -> ProgressBar {
    let bar = ProgressBar::new_spinner().with_prefix(request.output_stem());
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {prefix} {msg} {bytes}") {
        bar.set_style(style);
    }
    bar.set_message("waiting for export");
    bar
}

async fn fetch(
    client: &CvatClient,
    request: &ExportRequest,
    output_dir: &Path,
    unzip: bool,
    cancel: &CancellationToken,
    bar: &ProgressBar,
) -> Result<DownloadOutcome, TransferError> {
    let stem = request.output_stem();
    let output = output_dir.join(&stem);
    let archive_path = output_dir.join(format!("{stem}.zip"));

    let existing = if unzip { &output } else { &archive_path };
    if existing.exists() {
        log::info!("{} already exists, skipping", existing.display());
        return Ok(DownloadOutcome::Skipped {
            path: existing.clone(),
        });
    }

    let bytes = client
        .export_dataset(request.kind, request.id, &request.format, &archive_path, cancel, |event| {
            match event {
                TransferEvent::Waiting => bar.tick(),
                TransferEvent::Started { total } => {
                    if let Some(total) = total {
                        bar.set_length(total);
                    }
                    bar.set_message("downloading");
                }
                TransferEvent::Received(n) => bar.inc(n),
            }
        })
        .await?;
    log::info!("Downloaded {} ({} bytes)", archive_path.display(), bytes);

    if !unzip {
        return Ok(DownloadOutcome::Downloaded {
            path: archive_path,
            bytes,
        });
    }

    bar.set_message("unpacking");
    let (zip, dest) = (archive_path.clone(), output.clone());
    tokio::task::spawn_blocking(move || archive::extract(&zip, &dest))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
    tokio::fs::remove_file(&archive_path).await?;

    Ok(DownloadOutcome::Downloaded { path: output, bytes })
}
