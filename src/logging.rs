//! 로깅 설정

use tracing_subscriber::EnvFilter;

/// 전역 tracing 구독자 설치
///
/// `RUST_LOG`가 있으면 그것을, 없으면 `default_filter`를 쓴다.
/// 이미 설치돼 있으면 아무것도 하지 않는다 (테스트에서 여러 번 불려도 안전).
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
