//! 클라이언트
//!
//! 메타데이터 조회 -> 샤드 계획 -> 병렬 다운로드 순서로 진행하고,
//! 진행 중인 다운로드의 진행률을 파일명으로 조회할 수 있게 보관한다.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::catalog::{parse_listing, ListingEntry};
use crate::chunk::Metadata;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::fetcher::MetadataFetcher;
use crate::message::validate_filename;
use crate::progress::{spawn_monitor, DownloadProgress, DownloadStatus, ProgressSnapshot};
use crate::scheduler::ChunkScheduler;
use crate::DEFAULT_LISTING_NAME;

/// CFP 클라이언트
pub struct Client {
    config: ClientConfig,
    shutdown: watch::Receiver<bool>,
    /// 파일명 -> 진행률
    downloads: DashMap<String, Arc<DownloadProgress>>,
}

impl Client {
    pub fn new(config: ClientConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown,
            downloads: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 파일 메타데이터 조회
    pub async fn fetch_metadata(&self, filename: &str) -> Result<Metadata> {
        let mut fetcher = MetadataFetcher::new(&self.config, self.shutdown.clone());
        fetcher.fetch(filename).await
    }

    /// 메타데이터를 이미 알고 있는 파일 다운로드
    ///
    /// `downloads_dir/<filename>`에 저장하고 그 경로를 반환한다.
    /// 같은 파일이 이미 다운로드 중이면 AlreadyDownloading.
    pub async fn download_file(&self, filename: &str, metadata: &Metadata) -> Result<PathBuf> {
        validate_filename(filename)?;

        let scheduler = ChunkScheduler::new(self.config.clone(), self.shutdown.clone());
        let progress = Arc::new(DownloadProgress::new(
            filename,
            *metadata,
            &scheduler.plan(metadata),
        ));
        match self.downloads.entry(filename.to_string()) {
            Entry::Occupied(entry) if entry.get().status() == DownloadStatus::InProgress => {
                return Err(Error::AlreadyDownloading(filename.to_string()));
            }
            Entry::Occupied(mut entry) => {
                entry.insert(progress.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(progress.clone());
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.downloads_dir).await {
            progress.finish(false);
            return Err(e.into());
        }
        let dest = self.config.downloads_dir.join(filename);

        let monitor = (self.config.progress_interval_ms > 0).then(|| {
            spawn_monitor(
                progress.clone(),
                self.config.progress_interval(),
                self.shutdown.clone(),
            )
        });

        let result = scheduler
            .download(filename, metadata, &dest, progress.clone())
            .await;
        progress.finish(result.is_ok());
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        result?;

        let snap = progress.snapshot();
        info!(
            "{} 다운로드 완료: {} bytes, {} chunks, {:.2}s",
            filename,
            metadata.file_size,
            snap.received_chunks,
            snap.elapsed.as_secs_f64()
        );
        Ok(dest)
    }

    /// 메타데이터 조회 후 다운로드
    pub async fn download(&self, filename: &str) -> Result<PathBuf> {
        let metadata = self.fetch_metadata(filename).await?;
        self.download_file(filename, &metadata).await
    }

    /// 서버 파일 목록 다운로드 후 파싱
    pub async fn list(&self) -> Result<Vec<ListingEntry>> {
        let path = self.download(DEFAULT_LISTING_NAME).await?;
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(parse_listing(&text))
    }

    /// 큐 파일 텍스트에서 아직 받지 않은 파일명 추출
    ///
    /// 한 줄에 하나, 빈 줄과 `#` 주석은 무시. 다운로드 디렉토리에 이미 있거나
    /// 요청할 수 없는 이름은 건너뛴다.
    pub fn pending_from_queue(&self, text: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for line in text.lines() {
            let name = line.trim();
            if name.is_empty() || name.starts_with('#') || names.iter().any(|n| n == name) {
                continue;
            }
            if let Err(e) = validate_filename(name) {
                warn!("큐 항목 무시 {:?}: {}", name, e);
                continue;
            }
            if self.config.downloads_dir.join(name).exists() {
                continue;
            }
            names.push(name.to_string());
        }
        names
    }

    /// 파일별 진행률 조회 (다운로드가 끝난 뒤에도 최종 상태가 남음)
    pub fn progress(&self, filename: &str) -> Option<ProgressSnapshot> {
        self.downloads.get(filename).map(|p| p.snapshot())
    }

    /// 모든 다운로드의 진행률
    pub fn all_progress(&self) -> Vec<ProgressSnapshot> {
        self.downloads.iter().map(|p| p.snapshot()).collect()
    }
}
