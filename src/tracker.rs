//! 응답 추적기 (서버측)
//!
//! - 피어별 시퀀스 번호 할당
//! - ACK 대기 중인 응답 보관
//! - 타임아웃 시 재전송, 한도 초과 시 폐기
//!
//! 대기 테이블과 시퀀스 카운터는 수신 루프와 재전송 루프가 공유하며
//! 하나의 락으로 보호한다. 락은 조회/삽입/삭제 동안만 잡고 I/O 중에는 놓는다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::message::{ReplyBody, WireCodec};
use crate::stats::ServerStats;

/// ACK 대기 중인 응답
#[derive(Debug, Clone)]
pub struct PendingReply {
    /// 시퀀스 번호 (피어 내에서 유일)
    pub seq: u64,

    /// 목적지
    pub destination: SocketAddr,

    /// 인코딩된 데이터그램 (재전송 시 그대로 사용)
    pub raw: Bytes,

    /// 재전송 횟수
    pub retry_count: u32,

    /// 마지막 송신 시간
    pub last_sent_at: Instant,
}

/// 재전송 대상
#[derive(Debug, Clone)]
pub(crate) struct Resend {
    destination: SocketAddr,
    seq: u64,
    raw: Bytes,
    attempt: u32,
}

/// 락으로 보호되는 상태
#[derive(Debug, Default)]
struct TrackerState {
    /// 피어별 다음 시퀀스 번호
    sequences: HashMap<SocketAddr, u64>,

    /// (피어, 시퀀스) -> 대기 응답
    pending: HashMap<(SocketAddr, u64), PendingReply>,
}

/// 응답 추적기
pub struct ReplyTracker {
    socket: Arc<UdpSocket>,
    codec: WireCodec,
    state: Mutex<TrackerState>,
    ack_timeout: Duration,
    max_retries: u32,
    simulated_loss: f64,
    stats: Arc<ServerStats>,
}

impl ReplyTracker {
    pub fn new(socket: Arc<UdpSocket>, config: &ServerConfig, stats: Arc<ServerStats>) -> Self {
        Self {
            socket,
            codec: WireCodec::new(config.reply_checksum),
            state: Mutex::new(TrackerState::default()),
            ack_timeout: config.ack_timeout(),
            max_retries: config.max_retries,
            simulated_loss: config.simulated_loss,
            stats,
        }
    }

    /// 응답을 신뢰성 있게 송신
    ///
    /// 시퀀스 번호를 할당하고 대기 테이블에 넣은 뒤 즉시 송신한다.
    /// 송신 실패는 타임아웃과 동일하게 처리되어 다음 주기에 재전송된다.
    pub async fn send_reliable(&self, peer: SocketAddr, body: ReplyBody) -> u64 {
        let seq = {
            let mut state = self.state.lock();
            let counter = state.sequences.entry(peer).or_insert(0);
            let seq = *counter;
            *counter += 1;
            seq
        };

        let raw = self.codec.encode(&body.into_reply(seq));
        self.state.lock().pending.insert(
            (peer, seq),
            PendingReply {
                seq,
                destination: peer,
                raw: raw.clone(),
                retry_count: 0,
                last_sent_at: Instant::now(),
            },
        );

        self.stats.record_reply();
        self.transmit(peer, seq, &raw).await;
        seq
    }

    /// ACK 처리
    ///
    /// 대기 중인 응답이 있으면 제거하고 true. 이미 처리됐거나 없는 번호는 무시.
    pub fn acknowledge(&self, peer: SocketAddr, seq: u64) -> bool {
        let removed = self.state.lock().pending.remove(&(peer, seq)).is_some();
        if removed {
            self.stats.record_ack();
            debug!(%peer, seq, "ACK 수신");
        }
        removed
    }

    /// 대기 중인 응답 수
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 특정 응답이 대기 중인지
    pub fn is_pending(&self, peer: SocketAddr, seq: u64) -> bool {
        self.state.lock().pending.contains_key(&(peer, seq))
    }

    /// 피어에 다음으로 할당될 시퀀스 번호
    pub fn next_sequence(&self, peer: SocketAddr) -> u64 {
        self.state.lock().sequences.get(&peer).copied().unwrap_or(0)
    }

    /// 타임아웃된 응답 수집
    ///
    /// 한도 안이면 재전송 대상으로 표시하고, 한도를 넘으면 테이블에서 제거한다.
    pub(crate) fn collect_due(&self, now: Instant) -> Vec<Resend> {
        let ack_timeout = self.ack_timeout;
        let max_retries = self.max_retries;
        let mut due = Vec::new();
        let mut dropped = Vec::new();

        self.state.lock().pending.retain(|_, reply| {
            if now.saturating_duration_since(reply.last_sent_at) <= ack_timeout {
                return true;
            }
            if reply.retry_count < max_retries {
                reply.retry_count += 1;
                reply.last_sent_at = now;
                due.push(Resend {
                    destination: reply.destination,
                    seq: reply.seq,
                    raw: reply.raw.clone(),
                    attempt: reply.retry_count,
                });
                true
            } else {
                dropped.push((reply.destination, reply.seq));
                false
            }
        });

        for (peer, seq) in dropped {
            self.stats.record_dropped();
            warn!(%peer, seq, "재시도 한도 초과, 응답 폐기");
        }
        due
    }

    /// 재전송 한 주기
    pub async fn retry_tick(&self, now: Instant) {
        for resend in self.collect_due(now) {
            self.stats.record_retransmit();
            debug!(
                peer = %resend.destination,
                seq = resend.seq,
                attempt = resend.attempt,
                "응답 재전송"
            );
            self.transmit(resend.destination, resend.seq, &resend.raw).await;
        }
    }

    /// 주기적 재전송 루프 (shutdown 신호로 종료)
    pub async fn run_retry_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.retry_tick(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("재전송 루프 종료");
    }

    async fn transmit(&self, peer: SocketAddr, seq: u64, raw: &[u8]) {
        if self.simulated_loss > 0.0 && rand::random::<f64>() < self.simulated_loss {
            debug!(%peer, seq, "손실 시뮬레이션: 송신 생략");
            return;
        }
        if let Err(e) = self.socket.send_to(raw, peer).await {
            warn!(%peer, seq, "응답 송신 실패: {}", e);
        }
    }
}
