//! 메타데이터 조회 (클라이언트측)
//!
//! 요청 하나만 대기 슬롯에 두고, 별도 타이머 태스크가 주기적으로 재전송한다.
//! 일치하는 META 응답을 받으면 ACK을 보내고 타이머를 멈춘다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::chunk::Metadata;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::message::{validate_filename, Message, ReplyBody, WireCodec};
use crate::RECV_BUFFER_SIZE;

/// 응답을 기다리는 메타데이터 요청
#[derive(Debug, Clone)]
pub struct PendingMetadataRequest {
    /// 요청한 파일명
    pub filename: String,

    /// 인코딩된 요청 (재전송 시 그대로 사용)
    pub raw: Bytes,

    /// 마지막 송신 시간
    pub sent_at: Instant,

    /// 재전송 횟수
    pub resend_count: u32,
}

type PendingSlot = Arc<Mutex<Option<PendingMetadataRequest>>>;

/// 메타데이터 조회기
///
/// `fetch`가 `&mut self`를 받으므로 한 조회기에 동시에 두 요청이 걸릴 수 없다.
pub struct MetadataFetcher {
    server_addr: SocketAddr,
    bind_addr: SocketAddr,
    resend_interval: Duration,
    request_codec: WireCodec,
    reply_codec: WireCodec,
    slot: PendingSlot,
    shutdown: watch::Receiver<bool>,
}

impl MetadataFetcher {
    pub fn new(config: &ClientConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            server_addr: config.server_addr,
            bind_addr: config.bind_addr,
            resend_interval: config.metadata_resend_interval(),
            request_codec: WireCodec::new(config.request_checksum),
            reply_codec: WireCodec::new(config.reply_checksum),
            slot: Arc::new(Mutex::new(None)),
            shutdown,
        }
    }

    /// 현재 대기 중인 요청
    pub fn pending(&self) -> Option<PendingMetadataRequest> {
        self.slot.lock().clone()
    }

    /// 파일 메타데이터 조회
    ///
    /// 응답이 올 때까지 재전송한다. ERROR 응답은 `Error::Remote`,
    /// shutdown 신호는 `Error::Cancelled`.
    pub async fn fetch(&mut self, filename: &str) -> Result<Metadata> {
        validate_filename(filename)?;

        let socket = Arc::new(UdpSocket::bind(self.bind_addr).await?);
        let raw = self.request_codec.encode(&Message::RequestMetadata {
            filename: filename.to_string(),
        });

        *self.slot.lock() = Some(PendingMetadataRequest {
            filename: filename.to_string(),
            raw: raw.clone(),
            sent_at: Instant::now(),
            resend_count: 0,
        });
        debug!(filename, server = %self.server_addr, "메타데이터 요청");
        if let Err(e) = socket.send_to(&raw, self.server_addr).await {
            warn!("메타데이터 요청 송신 실패: {}", e);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let timer = tokio::spawn(resend_timer(
            socket.clone(),
            self.server_addr,
            self.slot.clone(),
            self.resend_interval,
            stop_rx,
        ));

        let result = self.await_reply(&socket, filename).await;

        // 결과와 관계없이 타이머 정지 및 슬롯 비우기
        let _ = stop_tx.send(());
        if let Err(e) = timer.await {
            warn!("재전송 타이머 종료 실패: {}", e);
        }
        *self.slot.lock() = None;

        if let Ok(meta) = &result {
            info!(
                filename,
                file_size = meta.file_size,
                num_chunks = meta.num_chunks,
                chunk_size = meta.chunk_size,
                "메타데이터 수신"
            );
        }
        result
    }

    async fn await_reply(&mut self, socket: &UdpSocket, filename: &str) -> Result<Metadata> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Err(Error::Cancelled);
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!("수신 에러(무시): {}", e);
                            continue;
                        }
                    };

                    let (seq, body) = match self.reply_codec.decode(&buf[..len]) {
                        Ok(Message::Reply { seq, body }) => (seq, body),
                        Ok(other) => {
                            trace!(%from, "응답이 아닌 메시지 무시: {:?}", other);
                            continue;
                        }
                        Err(e) => {
                            trace!(%from, "디코딩 실패 무시: {}", e);
                            continue;
                        }
                    };

                    match body {
                        ReplyBody::Meta { filename: name, metadata } if name == filename => {
                            self.send_ack(socket, from, seq).await;
                            return Ok(metadata);
                        }
                        ReplyBody::Error { reason } => {
                            self.send_ack(socket, from, seq).await;
                            return Err(Error::Remote(reason));
                        }
                        _ => {
                            trace!(%from, seq, "관계없는 응답 무시");
                        }
                    }
                }
            }
        }
    }

    async fn send_ack(&self, socket: &UdpSocket, to: SocketAddr, seq: u64) {
        let ack = self.request_codec.encode(&Message::Ack { seq });
        if let Err(e) = socket.send_to(&ack, to).await {
            warn!(seq, "ACK 송신 실패: {}", e);
        }
    }
}

/// 대기 슬롯의 요청을 주기적으로 재전송
async fn resend_timer(
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    slot: PendingSlot,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let raw = {
                    let mut slot = slot.lock();
                    let Some(pending) = slot.as_mut() else { break };
                    pending.resend_count += 1;
                    pending.sent_at = Instant::now();
                    debug!(
                        filename = %pending.filename,
                        attempt = pending.resend_count,
                        "메타데이터 요청 재전송"
                    );
                    pending.raw.clone()
                };
                if let Err(e) = socket.send_to(&raw, server).await {
                    warn!("메타데이터 요청 재전송 실패: {}", e);
                }
            }
        }
    }
}
