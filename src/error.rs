//! 에러 타입 정의

use thiserror::Error;

/// 데이터그램 디코딩 에러
///
/// 전송 계층 잡음으로 취급하며 세션을 끊지 않는다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("잘못된 메시지: {0}")]
    MalformedMessage(String),

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

/// CFP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("디코딩 에러: {0}")]
    Decode(#[from] DecodeError),

    #[error("잘못된 요청: {0}")]
    BadRequest(String),

    #[error("파일 없음: {0}")]
    NotFound(String),

    #[error("청크 범위 초과: chunk_id={chunk_id}, num_chunks={num_chunks}")]
    OutOfRange { chunk_id: u64, num_chunks: u64 },

    #[error("읽기 실패: {0}")]
    ReadError(String),

    #[error("서버 에러 응답: {0}")]
    Remote(String),

    #[error("파일 크기 불일치: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("청크 길이 불일치: chunk_id={chunk_id}, expected {expected}, got {got}")]
    ChunkLengthMismatch { chunk_id: u64, expected: u64, got: u64 },

    #[error("이미 다운로드 중: {0}")]
    AlreadyDownloading(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("취소됨")]
    Cancelled,

    #[error("워커 실패: {0}")]
    Worker(String),
}

impl Error {
    /// 클라이언트 잘못으로 생긴 에러인지 (BAD REQUEST 응답 대상)
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_) | Error::NotFound(_) | Error::OutOfRange { .. }
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
