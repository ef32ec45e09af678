//! 다운로드 진행률
//!
//! 워커는 자기 샤드 카운터만 올리고, 모니터와 조회 API는 읽기만 한다.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::chunk::{ChunkId, Metadata};

/// 다운로드 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    InProgress,
    Complete,
    Failed,
}

/// 샤드 하나의 진행률
#[derive(Debug)]
struct ShardProgress {
    range: Range<ChunkId>,
    received: AtomicU64,
}

/// 파일 하나의 다운로드 진행률
#[derive(Debug)]
pub struct DownloadProgress {
    filename: String,
    metadata: Metadata,
    shards: Vec<ShardProgress>,
    status: Mutex<DownloadStatus>,
    started_at: Instant,
}

/// 진행률 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub filename: String,
    pub status: DownloadStatus,
    pub received_chunks: u64,
    pub total_chunks: u64,
    /// 샤드별 (수신, 전체)
    pub shards: Vec<(u64, u64)>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// 전체 진행률 (0.0 ~ 100.0)
    pub fn percent(&self) -> f64 {
        percent(self.received_chunks, self.total_chunks)
    }
}

fn percent(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    received as f64 * 100.0 / total as f64
}

impl DownloadProgress {
    pub fn new(filename: &str, metadata: Metadata, shards: &[Range<ChunkId>]) -> Self {
        Self {
            filename: filename.to_string(),
            metadata,
            shards: shards
                .iter()
                .map(|range| ShardProgress {
                    range: range.clone(),
                    received: AtomicU64::new(0),
                })
                .collect(),
            status: Mutex::new(DownloadStatus::InProgress),
            started_at: Instant::now(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// 샤드 구간 목록
    pub fn shard_ranges(&self) -> Vec<Range<ChunkId>> {
        self.shards.iter().map(|s| s.range.clone()).collect()
    }

    /// 샤드에서 청크 하나를 새로 받음
    pub fn record_chunk(&self, shard: usize) {
        if let Some(progress) = self.shards.get(shard) {
            progress.received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn received_chunks(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn status(&self) -> DownloadStatus {
        *self.status.lock()
    }

    /// 최종 상태 기록
    pub fn finish(&self, success: bool) {
        *self.status.lock() = if success {
            DownloadStatus::Complete
        } else {
            DownloadStatus::Failed
        };
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            filename: self.filename.clone(),
            status: self.status(),
            received_chunks: self.received_chunks(),
            total_chunks: self.metadata.num_chunks,
            shards: self
                .shards
                .iter()
                .map(|s| {
                    (
                        s.received.load(Ordering::Relaxed),
                        s.range.end - s.range.start,
                    )
                })
                .collect(),
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// 진행률 모니터 태스크
///
/// 주기마다 샤드별 진행률을 로그로 남긴다. 다운로드가 끝나거나 shutdown 신호가 오면 종료.
pub fn spawn_monitor(
    progress: Arc<DownloadProgress>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 첫 틱은 즉시 완료되므로 건너뜀
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = progress.snapshot();
                    let shards: Vec<String> = snap
                        .shards
                        .iter()
                        .enumerate()
                        .map(|(i, (received, total))| {
                            format!("#{} {:.1}%", i, percent(*received, *total))
                        })
                        .collect();
                    info!(
                        "{}: {}/{} chunks ({:.1}%) [{}]",
                        snap.filename,
                        snap.received_chunks,
                        snap.total_chunks,
                        snap.percent(),
                        shards.join(", ")
                    );
                    if snap.status != DownloadStatus::InProgress {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
