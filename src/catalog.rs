//! 파일 카탈로그 (서버측)
//!
//! 파일명 + 청크 ID를 바이트 구간으로 변환하고 디스크에서 읽는다.
//! 파일 목록 파일은 서비스 디렉토리 밖에 두며, 오래되면 요청 시 재생성한다.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::chunk::{ChunkId, Metadata};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::message::validate_filename;

/// 파일 목록 한 줄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub size: u64,
}

/// 청크 서버
pub struct ChunkServer {
    /// 서비스 디렉토리
    files_dir: PathBuf,

    /// 파일 목록 요청용 특별 파일명
    listing_name: String,

    /// 파일 목록 파일 경로
    listing_path: PathBuf,

    /// 재생성 주기
    reload_interval: Duration,

    /// 청크 크기 (서버 전역 상수)
    chunk_size: u64,

    /// 마지막 목록 재생성 시간
    last_reload: Mutex<Option<Instant>>,
}

impl ChunkServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            files_dir: config.files_dir.clone(),
            listing_name: config.listing_name.clone(),
            listing_path: config.listing_path.clone(),
            reload_interval: config.listing_reload_interval(),
            chunk_size: config.chunk_size as u64,
            last_reload: Mutex::new(None),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 파일명을 전체 경로로 변환
    ///
    /// 목록 파일명은 서비스 디렉토리 밖의 목록 파일로, 나머지는 디렉토리 안으로.
    /// 경로 구분자나 상위 디렉토리 참조가 있으면 BadRequest.
    pub async fn resolve(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;

        if filename == self.listing_name {
            if self.listing_is_stale() {
                if let Err(e) = self.refresh_listing().await {
                    warn!("파일 목록 재생성 실패: {}", e);
                }
            }
            return Ok(self.listing_path.clone());
        }

        Ok(self.files_dir.join(filename))
    }

    fn listing_is_stale(&self) -> bool {
        match *self.last_reload.lock() {
            Some(at) => at.elapsed() >= self.reload_interval,
            None => true,
        }
    }

    /// 서비스 디렉토리를 다시 스캔해 목록 파일 작성
    pub async fn refresh_listing(&self) -> Result<usize> {
        let count = write_listing(&self.files_dir, &self.listing_path).await?;
        *self.last_reload.lock() = Some(Instant::now());
        info!(
            files = count,
            path = %self.listing_path.display(),
            "파일 목록 재생성"
        );
        Ok(count)
    }

    /// 파일 메타데이터 계산
    pub async fn metadata_for(&self, filename: &str) -> Result<Metadata> {
        let path = self.resolve(filename).await?;
        let stat = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::NotFound(filename.to_string()))?;
        if !stat.is_file() {
            return Err(Error::NotFound(filename.to_string()));
        }

        let meta = Metadata::new(stat.len(), self.chunk_size);
        debug!(
            filename,
            file_size = meta.file_size,
            num_chunks = meta.num_chunks,
            "메타데이터"
        );
        Ok(meta)
    }

    /// 청크 읽기
    ///
    /// 마지막 청크는 남은 길이만큼만 읽는다. 파일이 중간에 줄어들어
    /// 덜 읽히면 ReadError.
    pub async fn read_chunk(&self, filename: &str, chunk_id: ChunkId) -> Result<Bytes> {
        let path = self.resolve(filename).await?;
        let mut file = File::open(&path)
            .await
            .map_err(|_| Error::NotFound(filename.to_string()))?;
        let stat = file
            .metadata()
            .await
            .map_err(|e| Error::ReadError(e.to_string()))?;
        if !stat.is_file() {
            return Err(Error::NotFound(filename.to_string()));
        }

        let meta = Metadata::new(stat.len(), self.chunk_size);
        let len = meta.chunk_len(chunk_id).ok_or(Error::OutOfRange {
            chunk_id,
            num_chunks: meta.num_chunks,
        })?;

        read_range(&mut file, meta.offset_of(chunk_id), len)
            .await
            .map_err(|e| Error::ReadError(format!("{} chunk {}: {}", filename, chunk_id, e)))
    }
}

/// `offset`부터 정확히 `len` 바이트 읽기 (모자라면 UnexpectedEof)
async fn read_range(file: &mut File, offset: u64, len: u64) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// 디렉토리의 일반 파일들을 `"<name> <size>"` 줄로 기록
///
/// 요청할 수 없는 이름(구분자 포함 등)은 건너뛴다. 이름순 정렬.
pub async fn write_listing(dir: &Path, listing_path: &Path) -> Result<usize> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = read_dir.next_entry().await? {
        let stat = match entry.metadata().await {
            Ok(stat) => stat,
            Err(e) => {
                warn!("{} 읽기 실패: {}", entry.path().display(), e);
                continue;
            }
        };
        if !stat.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if validate_filename(&name).is_err() {
            continue;
        }
        entries.push(ListingEntry {
            name,
            size: stat.len(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut text = String::new();
    for entry in &entries {
        text.push_str(&format!("{} {}\n", entry.name, entry.size));
    }
    tokio::fs::write(listing_path, text).await?;

    Ok(entries.len())
}

/// 목록 텍스트 파싱 (마지막 공백 기준으로 이름/크기 분리)
pub fn parse_listing(text: &str) -> Vec<ListingEntry> {
    text.lines()
        .filter_map(|line| {
            let (name, size) = line.trim_end().rsplit_once(' ')?;
            let size = size.parse().ok()?;
            let name = name.trim_end();
            if name.is_empty() {
                return None;
            }
            Some(ListingEntry {
                name: name.to_string(),
                size,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn setup() -> (tempfile::TempDir, ChunkServer) {
        let root = tempfile::tempdir().unwrap();
        let files = root.path().join("files");
        std::fs::create_dir(&files).unwrap();
        std::fs::write(files.join("data.bin"), sample_data(2500)).unwrap();
        std::fs::write(files.join("empty.bin"), b"").unwrap();
        std::fs::create_dir(files.join("subdir")).unwrap();

        let config = ServerConfig {
            files_dir: files,
            listing_path: root.path().join("server_list.txt"),
            chunk_size: 1024,
            ..ServerConfig::default()
        };
        let server = ChunkServer::new(&config);
        (root, server)
    }

    #[tokio::test]
    async fn test_metadata_and_chunks() {
        let (_root, server) = setup();

        let meta = server.metadata_for("data.bin").await.unwrap();
        assert_eq!(meta, Metadata::new(2500, 1024));
        assert_eq!(meta.num_chunks, 3);

        let data = sample_data(2500);
        let first = server.read_chunk("data.bin", 0).await.unwrap();
        assert_eq!(&first[..], &data[..1024]);

        let last = server.read_chunk("data.bin", 2).await.unwrap();
        assert_eq!(last.len(), 452);
        assert_eq!(&last[..], &data[2048..]);
    }

    #[tokio::test]
    async fn test_out_of_range_and_missing() {
        let (_root, server) = setup();

        assert!(matches!(
            server.read_chunk("data.bin", 3).await,
            Err(Error::OutOfRange {
                chunk_id: 3,
                num_chunks: 3
            })
        ));
        assert!(matches!(
            server.read_chunk("empty.bin", 0).await,
            Err(Error::OutOfRange { num_chunks: 0, .. })
        ));
        assert!(matches!(
            server.metadata_for("nope.bin").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            server.metadata_for("subdir").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(
            server.metadata_for("empty.bin").await.unwrap().num_chunks,
            0
        );
    }

    #[tokio::test]
    async fn test_short_read_is_read_error() {
        let (root, _server) = setup();
        let mut file = File::open(root.path().join("files/data.bin")).await.unwrap();

        let tail = read_range(&mut file, 2048, 452).await.unwrap();
        assert_eq!(tail.len(), 452);

        // stat 이후 파일이 줄어든 경우와 같음
        let err = read_range(&mut file, 2048, 1024).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_root, server) = setup();

        for name in ["../server_list.txt", "subdir/x", "..", ""] {
            assert!(
                matches!(server.resolve(name).await, Err(Error::BadRequest(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_listing_regenerated_on_demand() {
        let (root, server) = setup();
        let listing = root.path().join("server_list.txt");
        assert!(!listing.exists());

        let path = server.resolve(DEFAULT_LISTING).await.unwrap();
        assert_eq!(path, listing);

        let text = std::fs::read_to_string(&listing).unwrap();
        assert_eq!(text, "data.bin 2500\nempty.bin 0\n");

        let meta = server.metadata_for(DEFAULT_LISTING).await.unwrap();
        assert_eq!(meta.file_size, text.len() as u64);
    }

    const DEFAULT_LISTING: &str = crate::DEFAULT_LISTING_NAME;

    #[test]
    fn test_parse_listing() {
        let entries = parse_listing("data.bin 2500\nmy file.txt 12\n\ngarbage\nbad x\n");
        assert_eq!(
            entries,
            vec![
                ListingEntry {
                    name: "data.bin".into(),
                    size: 2500
                },
                ListingEntry {
                    name: "my file.txt".into(),
                    size: 12
                },
            ]
        );
    }
}
