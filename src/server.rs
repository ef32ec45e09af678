//! 서버
//!
//! - 수신 루프 하나에서 요청을 순서대로 처리 (디스크 I/O만 하므로 병렬화하지 않음)
//! - 재전송 루프는 별도 태스크
//! - 모든 응답은 ReplyTracker를 거쳐 신뢰성 있게 전달

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::catalog::ChunkServer;
use crate::config::ServerConfig;
use crate::error::{DecodeError, Error, Result};
use crate::message::{Message, ReplyBody, WireCodec};
use crate::stats::ServerStats;
use crate::tracker::ReplyTracker;
use crate::{BAD_REQUEST, INTERNAL_ERROR, RECV_BUFFER_SIZE};

/// 청크 서버 런타임
pub struct Server {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    /// 클라이언트 -> 서버 방향 코덱
    inbound: WireCodec,
    catalog: ChunkServer,
    tracker: Arc<ReplyTracker>,
    stats: Arc<ServerStats>,
}

impl Server {
    /// 소켓 바인딩 및 초기 파일 목록 생성
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let stats = Arc::new(ServerStats::new());
        let tracker = Arc::new(ReplyTracker::new(socket.clone(), &config, stats.clone()));
        let catalog = ChunkServer::new(&config);

        if let Err(e) = catalog.refresh_listing().await {
            warn!("초기 파일 목록 생성 실패: {}", e);
        }

        info!(
            "CFP Server bound on {} (files: {}, chunk size: {} bytes)",
            socket.local_addr()?,
            config.files_dir.display(),
            config.chunk_size
        );

        Ok(Self {
            inbound: WireCodec::new(config.request_checksum),
            config,
            socket,
            catalog,
            tracker,
            stats,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub fn tracker(&self) -> Arc<ReplyTracker> {
        self.tracker.clone()
    }

    pub fn catalog(&self) -> &ChunkServer {
        &self.catalog
    }

    /// 수신 루프 실행 (shutdown 신호까지)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let retry_task = tokio::spawn(
            self.tracker
                .clone()
                .run_retry_loop(self.config.retry_interval(), shutdown.clone()),
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => warn!("수신 에러: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = retry_task.await {
            warn!("재전송 루프 종료 실패: {}", e);
        }
        info!("CFP Server stopped: {}", self.stats.summary());
        Ok(())
    }

    /// 데이터그램 하나 처리
    pub async fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        let msg = match self.inbound.decode(data) {
            Ok(msg) => msg,
            Err(DecodeError::MalformedMessage(reason)) if Message::is_request_command(data) => {
                // 요청 명령인데 필드가 잘못됨 -> 에러 응답
                self.stats.record_request();
                self.reply_error(peer, &Error::BadRequest(reason)).await;
                return;
            }
            Err(e) => {
                self.stats.record_malformed();
                trace!(%peer, "데이터그램 폐기: {}", e);
                return;
            }
        };

        match msg {
            Message::Ack { seq } => {
                self.tracker.acknowledge(peer, seq);
            }
            Message::RequestMetadata { filename } => {
                self.stats.record_request();
                debug!(%peer, filename, "메타데이터 요청");
                match self.catalog.metadata_for(&filename).await {
                    Ok(metadata) => {
                        self.tracker
                            .send_reliable(peer, ReplyBody::Meta { filename, metadata })
                            .await;
                    }
                    Err(e) => self.reply_error(peer, &e).await,
                }
            }
            Message::RequestChunk { filename, chunk_id } => {
                self.stats.record_request();
                debug!(%peer, filename, chunk_id, "청크 요청");
                match self.catalog.read_chunk(&filename, chunk_id).await {
                    Ok(data) => {
                        self.stats.record_payload(data.len());
                        self.tracker
                            .send_reliable(
                                peer,
                                ReplyBody::Chunk {
                                    filename,
                                    chunk_id,
                                    data,
                                },
                            )
                            .await;
                    }
                    Err(e) => self.reply_error(peer, &e).await,
                }
            }
            Message::Reply { seq, .. } => {
                trace!(%peer, seq, "클라이언트가 보낸 응답 무시");
            }
        }
    }

    async fn reply_error(&self, peer: SocketAddr, err: &Error) {
        let reason = if err.is_client_fault() {
            debug!(%peer, "잘못된 요청: {}", err);
            BAD_REQUEST
        } else {
            warn!(%peer, "요청 처리 실패: {}", err);
            INTERNAL_ERROR
        };
        self.stats.record_error_reply();
        self.tracker
            .send_reliable(
                peer,
                ReplyBody::Error {
                    reason: reason.to_string(),
                },
            )
            .await;
    }
}
