//! 청크 스케줄러 (클라이언트측)
//!
//! 청크 ID 공간을 샤드로 나누고 샤드마다 워커(소켓 하나)를 띄운다.
//!
//! 워커 루프:
//! 1. 남은 청크 중 토큰 한도만큼 요청
//! 2. 응답을 기다리며 받은 청크는 오프셋에 기록하고 ACK
//! 3. 타임아웃이 나거나 현재 배치를 다 받으면 남은 청크를 다시 요청
//!
//! 워커 하나라도 실패하면 나머지를 중단하고 부분 파일을 지운다.

use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::chunk::{plan_shards, ChunkId, Metadata};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{Message, ReplyBody, WireCodec};
use crate::progress::DownloadProgress;
use crate::RECV_BUFFER_SIZE;

/// 워커 하나의 샤드 상태
#[derive(Debug, Clone)]
pub struct ShardState {
    /// 담당 구간
    pub range: Range<ChunkId>,

    /// 아직 받지 못한 청크
    pub outstanding: BTreeSet<ChunkId>,

    /// 구간의 전체 청크 수
    pub total: u64,
}

impl ShardState {
    pub fn new(range: Range<ChunkId>) -> Self {
        Self {
            outstanding: range.clone().collect(),
            total: range.end - range.start,
            range,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// 다음에 요청할 청크 (ID 오름차순, 최대 `limit`개)
    pub fn next_batch(&self, limit: usize) -> Vec<ChunkId> {
        self.outstanding.iter().take(limit).copied().collect()
    }

    /// 수신 처리. 처음 받은 청크면 true.
    pub fn mark_received(&mut self, chunk_id: ChunkId) -> bool {
        self.outstanding.remove(&chunk_id)
    }
}

/// 다운로드 대상 파일 (위치 지정 쓰기)
#[derive(Debug)]
pub struct DestinationFile {
    path: PathBuf,
    file: File,
}

impl DestinationFile {
    /// 파일 생성 후 최종 크기로 미리 확장
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 오프셋에 기록 (같은 청크를 다시 써도 결과 동일)
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)
    }

    /// 오프셋에 기록 (같은 청크를 다시 써도 결과 동일)
    #[cfg(windows)]
    pub fn write_at(&self, mut offset: u64, mut data: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !data.is_empty() {
            let written = self.file.seek_write(data, offset)?;
            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote 0 bytes"));
            }
            data = &data[written..];
            offset += written as u64;
        }
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// 청크 스케줄러
pub struct ChunkScheduler {
    config: ClientConfig,
    shutdown: watch::Receiver<bool>,
}

impl ChunkScheduler {
    pub fn new(config: ClientConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self { config, shutdown }
    }

    /// 샤드 계획
    pub fn plan(&self, metadata: &Metadata) -> Vec<Range<ChunkId>> {
        plan_shards(metadata.num_chunks, self.config.workers)
    }

    /// 파일 전체 다운로드
    ///
    /// 샤드는 `progress`에 등록된 구간을 따른다. 실패하면 `dest`를 지운다.
    pub async fn download(
        &self,
        filename: &str,
        metadata: &Metadata,
        dest: &Path,
        progress: Arc<DownloadProgress>,
    ) -> Result<()> {
        let file = {
            let dest = dest.to_path_buf();
            let size = metadata.file_size;
            tokio::task::spawn_blocking(move || DestinationFile::create(&dest, size))
                .await
                .map_err(|e| Error::Worker(e.to_string()))??
        };
        let file = Arc::new(file);
        let shards = progress.shard_ranges();
        info!(
            filename,
            chunks = metadata.num_chunks,
            workers = shards.len(),
            "다운로드 시작"
        );

        let result = match self
            .run_workers(filename, metadata, &shards, file.clone(), progress)
            .await
        {
            Ok(()) => {
                let expected = metadata.file_size;
                tokio::task::spawn_blocking(move || verify_size(&file, expected))
                    .await
                    .unwrap_or_else(|e| Err(Error::Worker(e.to_string())))
            }
            Err(e) => {
                drop(file);
                Err(e)
            }
        };

        if let Err(e) = &result {
            warn!(filename, "다운로드 실패: {}", e);
            if let Err(remove_err) = tokio::fs::remove_file(dest).await {
                warn!("부분 파일 삭제 실패 {}: {}", dest.display(), remove_err);
            }
        }
        result
    }

    async fn run_workers(
        &self,
        filename: &str,
        metadata: &Metadata,
        shards: &[Range<ChunkId>],
        file: Arc<DestinationFile>,
        progress: Arc<DownloadProgress>,
    ) -> Result<()> {
        let mut workers = JoinSet::new();
        for (index, range) in shards.iter().enumerate() {
            let worker = ShardWorker {
                index,
                filename: filename.to_string(),
                metadata: *metadata,
                shard: ShardState::new(range.clone()),
                server_addr: self.config.server_addr,
                bind_addr: self.config.bind_addr,
                config: self.config.clone(),
                request_codec: WireCodec::new(self.config.request_checksum),
                reply_codec: WireCodec::new(self.config.reply_checksum),
                file: file.clone(),
                progress: progress.clone(),
                shutdown: self.shutdown.clone(),
            };
            workers.spawn(worker.run());
        }

        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => Error::Worker(e.to_string()),
            };
            workers.abort_all();
            // 중단된 워커가 파일 핸들을 놓을 때까지 대기
            while workers.join_next().await.is_some() {}
            return Err(failure);
        }
        Ok(())
    }
}

fn verify_size(file: &DestinationFile, expected: u64) -> Result<()> {
    file.sync()?;
    let got = std::fs::metadata(file.path())?.len();
    if got != expected {
        return Err(Error::SizeMismatch { expected, got });
    }
    Ok(())
}

/// 샤드 하나를 담당하는 워커
struct ShardWorker {
    index: usize,
    filename: String,
    metadata: Metadata,
    shard: ShardState,
    server_addr: SocketAddr,
    bind_addr: SocketAddr,
    config: ClientConfig,
    request_codec: WireCodec,
    reply_codec: WireCodec,
    file: Arc<DestinationFile>,
    progress: Arc<DownloadProgress>,
    shutdown: watch::Receiver<bool>,
}

impl ShardWorker {
    async fn run(mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.bind_addr).await?;
        let timeout = self.config.request_timeout();
        let mut batch = HashSet::new();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        debug!(
            shard = self.index,
            start = self.shard.range.start,
            end = self.shard.range.end,
            "워커 시작"
        );
        self.request_batch(&socket, &mut batch).await;

        while !self.shard.is_complete() {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(Error::Cancelled);
                    }
                }
                received = tokio::time::timeout(timeout, socket.recv_from(&mut buf)) => {
                    match received {
                        Ok(Ok((len, from))) => {
                            self.handle_datagram(&socket, &buf[..len], from, &mut batch).await?;
                            if batch.is_empty() && !self.shard.is_complete() {
                                self.request_batch(&socket, &mut batch).await;
                            }
                        }
                        Ok(Err(e)) => debug!(shard = self.index, "수신 에러(무시): {}", e),
                        Err(_) => {
                            trace!(
                                shard = self.index,
                                remaining = self.shard.outstanding.len(),
                                "타임아웃, 재요청"
                            );
                            self.request_batch(&socket, &mut batch).await;
                        }
                    }
                }
            }
        }

        debug!(shard = self.index, "워커 완료");
        Ok(())
    }

    /// 남은 청크 중 토큰 한도만큼 요청
    async fn request_batch(&self, socket: &UdpSocket, batch: &mut HashSet<ChunkId>) {
        batch.clear();
        for chunk_id in self.shard.next_batch(self.config.token_limit) {
            let raw = self.request_codec.encode(&Message::RequestChunk {
                filename: self.filename.clone(),
                chunk_id,
            });
            if let Err(e) = socket.send_to(&raw, self.server_addr).await {
                warn!(shard = self.index, chunk_id, "청크 요청 송신 실패: {}", e);
            }
            batch.insert(chunk_id);
        }
    }

    async fn handle_datagram(
        &mut self,
        socket: &UdpSocket,
        data: &[u8],
        from: SocketAddr,
        batch: &mut HashSet<ChunkId>,
    ) -> Result<()> {
        let (seq, body) = match self.reply_codec.decode(data) {
            Ok(Message::Reply { seq, body }) => (seq, body),
            Ok(_) => return Ok(()),
            Err(e) => {
                trace!(shard = self.index, "디코딩 실패 무시: {}", e);
                return Ok(());
            }
        };

        match body {
            ReplyBody::Chunk {
                filename,
                chunk_id,
                data,
            } if filename == self.filename => {
                self.send_ack(socket, from, seq).await;
                if !self.shard.outstanding.contains(&chunk_id) {
                    trace!(shard = self.index, chunk_id, "중복 청크");
                    return Ok(());
                }

                // 메타데이터 이후 서버 파일이 바뀌면 길이가 달라짐 -> 다운로드 실패
                let expected = self.metadata.chunk_len(chunk_id).unwrap_or(0);
                if expected != data.len() as u64 {
                    return Err(Error::ChunkLengthMismatch {
                        chunk_id,
                        expected,
                        got: data.len() as u64,
                    });
                }

                let file = self.file.clone();
                let offset = self.metadata.offset_of(chunk_id);
                tokio::task::spawn_blocking(move || file.write_at(offset, &data))
                    .await
                    .map_err(|e| Error::Worker(e.to_string()))??;

                self.shard.mark_received(chunk_id);
                self.progress.record_chunk(self.index);
                // 기록된 청크만 배치에서 제거 (배치가 비어야 다음 배치 요청)
                batch.remove(&chunk_id);
            }
            ReplyBody::Error { reason } => {
                self.send_ack(socket, from, seq).await;
                return Err(Error::Remote(reason));
            }
            _ => {
                // 서버 재전송을 멈추기 위해 관계없는 응답에도 ACK
                self.send_ack(socket, from, seq).await;
            }
        }
        Ok(())
    }

    async fn send_ack(&self, socket: &UdpSocket, to: SocketAddr, seq: u64) {
        let ack = self.request_codec.encode(&Message::Ack { seq });
        if let Err(e) = socket.send_to(&ack, to).await {
            warn!(shard = self.index, seq, "ACK 송신 실패: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    const CHUNK: u64 = 100;

    fn sample_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// 가짜 서버 동작
    #[derive(Default, Clone)]
    struct Behavior {
        duplicate: bool,
        drop_first: HashSet<ChunkId>,
        error_on: Option<ChunkId>,
        silent: bool,
    }

    #[derive(Default)]
    struct Observed {
        requests: HashMap<ChunkId, usize>,
        acks: usize,
    }

    async fn fake_server(
        data: Vec<u8>,
        behavior: Behavior,
    ) -> (SocketAddr, Arc<Mutex<Observed>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let observed = Arc::new(Mutex::new(Observed::default()));
        let seen = observed.clone();

        tokio::spawn(async move {
            let codec = WireCodec::new(true);
            let meta = Metadata::new(data.len() as u64, CHUNK);
            let mut buf = [0u8; 4096];
            let mut seq = 0u64;

            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let (filename, chunk_id) = match Message::parse(&buf[..len]).unwrap() {
                    Message::RequestChunk { filename, chunk_id } => (filename, chunk_id),
                    Message::Ack { .. } => {
                        seen.lock().acks += 1;
                        continue;
                    }
                    other => panic!("unexpected {:?}", other),
                };

                let count = {
                    let mut seen = seen.lock();
                    let count = seen.requests.entry(chunk_id).or_insert(0);
                    *count += 1;
                    *count
                };
                if behavior.silent || (count == 1 && behavior.drop_first.contains(&chunk_id)) {
                    continue;
                }

                let body = if behavior.error_on == Some(chunk_id) {
                    ReplyBody::Error {
                        reason: "BAD REQUEST".into(),
                    }
                } else {
                    let start = meta.offset_of(chunk_id) as usize;
                    let len = meta.chunk_len(chunk_id).unwrap() as usize;
                    ReplyBody::Chunk {
                        filename,
                        chunk_id,
                        data: Bytes::copy_from_slice(&data[start..start + len]),
                    }
                };
                let raw = codec.encode(&body.into_reply(seq));
                seq += 1;
                socket.send_to(&raw, from).await.unwrap();
                if behavior.duplicate {
                    socket.send_to(&raw, from).await.unwrap();
                }
            }
        });
        (addr, observed)
    }

    fn config(server_addr: SocketAddr, workers: usize) -> ClientConfig {
        ClientConfig {
            server_addr,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            workers,
            request_timeout_ms: 50,
            token_limit: 4,
            ..ClientConfig::default()
        }
    }

    async fn run_download(
        config: ClientConfig,
        meta: Metadata,
        dest: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> (Result<()>, Arc<DownloadProgress>) {
        let scheduler = ChunkScheduler::new(config, shutdown);
        let progress = Arc::new(DownloadProgress::new("data.bin", meta, &scheduler.plan(&meta)));
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler.download("data.bin", &meta, dest, progress.clone()),
        )
        .await
        .expect("download timed out");
        (result, progress)
    }

    #[test]
    fn test_shard_state_batches() {
        let mut shard = ShardState::new(10..20);
        assert_eq!(shard.total, 10);
        assert_eq!(shard.next_batch(3), vec![10, 11, 12]);

        assert!(shard.mark_received(11));
        assert!(!shard.mark_received(11));
        assert!(!shard.mark_received(99));
        assert_eq!(shard.next_batch(3), vec![10, 12, 13]);
        assert_eq!(shard.next_batch(100).len(), 9);
        assert!(!shard.is_complete());
    }

    #[test]
    fn test_positional_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = DestinationFile::create(&path, 10).unwrap();

        file.write_at(5, b"world").unwrap();
        file.write_at(0, b"hello").unwrap();
        file.write_at(5, b"world").unwrap();
        file.sync().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn test_duplicate_replies_written_once() {
        let data = sample_data(950);
        let meta = Metadata::new(950, CHUNK);
        let (addr, observed) = fake_server(
            data.clone(),
            Behavior {
                duplicate: true,
                ..Behavior::default()
            },
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let (_tx, rx) = watch::channel(false);
        let (result, progress) = run_download(config(addr, 3), meta, &dest, rx).await;

        result.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(progress.received_chunks(), 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 먼저 도착한 사본은 모두 ACK됨 (워커 종료 후 도착한 사본은 제외)
        assert!(observed.lock().acks >= 10);
    }

    #[tokio::test]
    async fn test_dropped_reply_is_rerequested() {
        let data = sample_data(950);
        let meta = Metadata::new(950, CHUNK);
        let (addr, observed) = fake_server(
            data.clone(),
            Behavior {
                drop_first: [1, 7].into_iter().collect(),
                ..Behavior::default()
            },
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let (_tx, rx) = watch::channel(false);
        let (result, _) = run_download(config(addr, 2), meta, &dest, rx).await;

        result.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        let observed = observed.lock();
        assert!(observed.requests[&1] >= 2);
        assert!(observed.requests[&7] >= 2);
    }

    #[tokio::test]
    async fn test_error_reply_aborts_and_removes_file() {
        let data = sample_data(950);
        let meta = Metadata::new(950, CHUNK);
        let (addr, _) = fake_server(
            data,
            Behavior {
                error_on: Some(3),
                ..Behavior::default()
            },
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let (_tx, rx) = watch::channel(false);
        let (result, _) = run_download(config(addr, 2), meta, &dest, rx).await;

        match result {
            Err(Error::Remote(reason)) => assert_eq!(reason, "BAD REQUEST"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_length_mismatch_fails_download() {
        // 서버 파일은 1000 바이트, 클라이언트 메타데이터는 950 바이트
        let (addr, observed) = fake_server(sample_data(1000), Behavior::default()).await;
        let meta = Metadata::new(950, CHUNK);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let (_tx, rx) = watch::channel(false);
        let (result, _) = run_download(config(addr, 2), meta, &dest, rx).await;

        match result {
            Err(Error::ChunkLengthMismatch {
                chunk_id,
                expected,
                got,
            }) => {
                assert_eq!(chunk_id, 9);
                assert_eq!(expected, 50);
                assert_eq!(got, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!dest.exists());
        assert!(observed.lock().requests[&9] <= 3);
    }

    #[tokio::test]
    async fn test_batch_not_refilled_while_chunks_outstanding() {
        let data = sample_data(400);
        let meta = Metadata::new(400, CHUNK);
        let (addr, observed) = fake_server(
            data.clone(),
            Behavior {
                drop_first: [2].into_iter().collect(),
                ..Behavior::default()
            },
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let (_tx, rx) = watch::channel(false);
        let (result, _) = run_download(config(addr, 1), meta, &dest, rx).await;

        result.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        // 0,1,3을 받아도 2가 남아 있으면 타임아웃 전까지 재요청하지 않음
        let observed = observed.lock();
        assert_eq!(observed.requests[&0], 1);
        assert_eq!(observed.requests[&2], 2);
    }

    #[tokio::test]
    async fn test_empty_file_completes_without_requests() {
        let meta = Metadata::new(0, CHUNK);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.bin");
        let (_tx, rx) = watch::channel(false);
        // 요청을 보내지 않으므로 서버가 없어도 됨
        let unused: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (result, progress) = run_download(config(unused, 4), meta, &dest, rx).await;

        result.unwrap();
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
        assert!(progress.shard_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_removes_file() {
        let data = sample_data(950);
        let meta = Metadata::new(950, CHUNK);
        let (addr, _) = fake_server(
            data,
            Behavior {
                silent: true,
                ..Behavior::default()
            },
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.bin");
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.send(true).unwrap();
        });
        let (result, _) = run_download(config(addr, 2), meta, &dest, rx).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!dest.exists());
    }
}
