//! 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 서버 통계 (수신 루프와 재전송 루프가 함께 갱신)
#[derive(Debug)]
pub struct ServerStats {
    /// 시작 시간
    start_time: Instant,

    /// 처리한 요청 수 (메타데이터 + 청크)
    requests: AtomicU64,

    /// 최초 송신한 응답 수
    replies_sent: AtomicU64,

    /// 재전송 수
    retransmits: AtomicU64,

    /// 재시도 한도 초과로 버린 응답 수
    dropped: AtomicU64,

    /// 처리한 ACK 수 (일치하는 대기 응답이 있던 경우만)
    acks: AtomicU64,

    /// 에러 응답 수
    error_replies: AtomicU64,

    /// 디코딩 실패한 데이터그램 수
    malformed: AtomicU64,

    /// 송신한 청크 페이로드 바이트 (재전송 제외)
    payload_bytes: AtomicU64,
}

/// 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub replies_sent: u64,
    pub retransmits: u64,
    pub dropped: u64,
    pub acks: u64,
    pub error_replies: u64,
    pub malformed: u64,
    pub payload_bytes: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            error_replies: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error_reply(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payload(&self, bytes: usize) {
        self.payload_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            error_replies: self.error_replies.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
        }
    }

    /// 재전송 비율 (재전송 / 최초 송신)
    pub fn retransmit_ratio(&self) -> f64 {
        let snap = self.snapshot();
        if snap.replies_sent == 0 {
            return 0.0;
        }
        snap.retransmits as f64 / snap.replies_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let snap = self.snapshot();
        format!(
            "Elapsed: {:.2}s | Requests: {} | Replies: {} | Retransmits: {} ({:.1}%) | Dropped: {} | ACKs: {} | Errors: {} | Malformed: {} | Payload: {} bytes",
            self.elapsed().as_secs_f64(),
            snap.requests,
            snap.replies_sent,
            snap.retransmits,
            self.retransmit_ratio() * 100.0,
            snap.dropped,
            snap.acks,
            snap.error_replies,
            snap.malformed,
            snap.payload_bytes,
        )
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_ratio() {
        let stats = ServerStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        for _ in 0..4 {
            stats.record_reply();
        }
        stats.record_retransmit();
        stats.record_payload(1024);
        stats.record_payload(452);

        let snap = stats.snapshot();
        assert_eq!(snap.replies_sent, 4);
        assert_eq!(snap.retransmits, 1);
        assert_eq!(snap.payload_bytes, 1476);
        assert!((stats.retransmit_ratio() - 0.25).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Retransmits: 1"));
    }
}
