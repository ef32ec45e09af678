//! 프로토콜 설정
//!
//! 서버/클라이언트 설정은 각각 기본값을 가지며 TOML 파일로 덮어쓸 수 있다.
//! 트레일러 정책(`reply_checksum`, `request_checksum`)은 양쪽이 같아야 한다.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::CHECKSUM_LEN;
use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_LISTING_NAME, DEFAULT_PORT, DEFAULT_TOKEN_LIMIT,
    MAX_DATAGRAM_SIZE, MAX_FILENAME_LEN,
};

/// 응답 헤더 최대 길이 (`REPLY:<u64>:CHUNK:<filename>:<u64>:`)
const MAX_REPLY_HEADER_LEN: usize = 6 + 20 + 7 + MAX_FILENAME_LEN + 1 + 20 + 1;

/// 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 바인드 주소
    pub bind_addr: SocketAddr,

    /// 서비스할 파일 디렉토리
    pub files_dir: PathBuf,

    /// 파일 목록 요청에 쓰이는 특별 파일명
    pub listing_name: String,

    /// 파일 목록 파일 경로 (files_dir 밖)
    pub listing_path: PathBuf,

    /// 파일 목록 재생성 주기 (초)
    pub listing_reload_secs: u64,

    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// ACK 대기 타임아웃 (밀리초)
    pub ack_timeout_ms: u64,

    /// 재전송 스캔 주기 (밀리초)
    pub retry_interval_ms: u64,

    /// 응답당 최대 재전송 횟수
    pub max_retries: u32,

    /// 서버 -> 클라이언트 CRC 트레일러
    pub reply_checksum: bool,

    /// 클라이언트 -> 서버 CRC 트레일러
    pub request_checksum: bool,

    /// 응답 송신을 일부러 건너뛸 확률 (0.0 ~ 1.0, 손실 시뮬레이션)
    pub simulated_loss: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            files_dir: PathBuf::from("files"),
            listing_name: DEFAULT_LISTING_NAME.to_string(),
            listing_path: PathBuf::from(DEFAULT_LISTING_NAME),
            listing_reload_secs: 5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout_ms: 2000,    // 2초
            retry_interval_ms: 500,  // 500ms
            max_retries: 3,
            reply_checksum: true,
            request_checksum: false,
            simulated_loss: 0.0,
        }
    }
}

impl ServerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn listing_reload_interval(&self) -> Duration {
        Duration::from_secs(self.listing_reload_secs)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        let max_chunk = MAX_DATAGRAM_SIZE - MAX_REPLY_HEADER_LEN - CHECKSUM_LEN;
        if self.chunk_size == 0 || self.chunk_size > max_chunk {
            return Err(Error::Config(format!(
                "chunk_size must be in 1..={}, got {}",
                max_chunk, self.chunk_size
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(Error::Config("retry_interval_ms must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.simulated_loss) {
            return Err(Error::Config(format!(
                "simulated_loss must be in [0, 1), got {}",
                self.simulated_loss
            )));
        }
        crate::message::validate_filename(&self.listing_name)
            .map_err(|e| Error::Config(format!("listing_name: {}", e)))?;
        Ok(())
    }
}

/// 클라이언트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 서버 주소
    pub server_addr: SocketAddr,

    /// 로컬 바인드 주소 (포트 0 = 자동 할당)
    pub bind_addr: SocketAddr,

    /// 다운로드 저장 디렉토리
    pub downloads_dir: PathBuf,

    /// 다운로드 워커 수 (소켓 수)
    pub workers: usize,

    /// 워커 수신 대기 타임아웃 (밀리초), 만료 시 요청 재발행
    pub request_timeout_ms: u64,

    /// 타임아웃 한 번에 보낼 최대 청크 요청 수
    pub token_limit: usize,

    /// 메타데이터 요청 재전송 주기 (밀리초)
    pub metadata_resend_ms: u64,

    /// 진행률 모니터 폴링 주기 (밀리초)
    pub progress_interval_ms: u64,

    /// 서버 -> 클라이언트 CRC 트레일러
    pub reply_checksum: bool,

    /// 클라이언트 -> 서버 CRC 트레일러
    pub request_checksum: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            downloads_dir: PathBuf::from("downloads"),
            workers: 4,
            request_timeout_ms: 200,
            token_limit: DEFAULT_TOKEN_LIMIT,
            metadata_resend_ms: 1000,
            progress_interval_ms: 500,
            reply_checksum: true,
            request_checksum: false,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn metadata_resend_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_resend_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            workers: 2,
            token_limit: 50,
            request_timeout_ms: 300,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            workers: 4,
            token_limit: 64,              // 작은 버스트
            request_timeout_ms: 500,
            metadata_resend_ms: 500,
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.token_limit == 0 {
            return Err(Error::Config("token_limit must be positive".into()));
        }
        if self.request_timeout_ms == 0 || self.metadata_resend_ms == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// 전체 설정 파일
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 기본 로그 레벨 (RUST_LOG가 우선)
    pub log_level: Option<String>,

    pub server: ServerConfig,

    pub client: ClientConfig,
}

impl Config {
    /// TOML 파일에서 로드
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// TOML 문자열에서 파싱 후 검증
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.server.validate()?;
        config.client.validate()?;
        Ok(config)
    }
}
