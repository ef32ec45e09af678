//! # CFP (Chunk Fetch Protocol)
//!
//! UDP 기반 요청/응답형 파일 다운로드 프로토콜
//!
//! ## 핵심 특징
//! - **청크 단위 요청**: 클라이언트가 필요한 청크 ID를 직접 요청
//! - **응답 ACK**: 서버 응답마다 시퀀스 번호, 클라이언트는 모든 응답에 ACK
//! - **서버 재전송**: ACK이 없으면 주기적으로 재전송, 한도 초과 시 폐기
//! - **클라이언트 재요청**: 타임아웃마다 남은 청크를 다시 요청 (토큰 한도)
//! - **병렬 다운로드**: 청크 구간(샤드)마다 워커 하나, 소켓 하나
//! - **위치 지정 쓰기**: 청크는 오프셋에 바로 기록, 중복 수신은 무시

pub mod catalog;
pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod message;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod tracker;

pub use catalog::{ChunkServer, ListingEntry};
pub use chunk::{ChunkId, Metadata};
pub use client::Client;
pub use config::{ClientConfig, Config, ServerConfig};
pub use error::{DecodeError, Error, Result};
pub use fetcher::MetadataFetcher;
pub use message::{Message, ReplyBody, WireCodec};
pub use progress::{DownloadProgress, DownloadStatus, ProgressSnapshot};
pub use scheduler::ChunkScheduler;
pub use server::Server;
pub use stats::ServerStats;
pub use tracker::ReplyTracker;

/// 기본 서버 포트
pub const DEFAULT_PORT: u16 = 12345;

/// 데이터그램 최대 크기 (헤더 + 페이로드 + 트레일러)
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// 수신 버퍼 크기 (잘린 데이터그램을 받지 않도록 UDP 최대치)
pub const RECV_BUFFER_SIZE: usize = 65535;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// 파일명 최대 길이 (바이트)
pub const MAX_FILENAME_LEN: usize = 255;

/// 파일 목록 요청용 특별 파일명
pub const DEFAULT_LISTING_NAME: &str = "server_list.txt";

/// 타임아웃 한 번에 보낼 기본 청크 요청 수
pub const DEFAULT_TOKEN_LIMIT: usize = 200;

/// 클라이언트 잘못으로 거절된 요청의 에러 사유
pub const BAD_REQUEST: &str = "BAD REQUEST";

/// 서버측 읽기 실패 시 에러 사유
pub const INTERNAL_ERROR: &str = "Internal server error";
