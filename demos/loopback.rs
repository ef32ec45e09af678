//! 루프백 전송 데모 (서버 + 클라이언트를 한 프로세스에서)
//!
//! 사용법:
//!   cargo run --release --example loopback -- [SIZE_MB] [LOSS]
//!
//! 인자:
//!   SIZE_MB   테스트 파일 크기 (MB, 기본: 10)
//!   LOSS      서버 응답 손실 시뮬레이션 확률 (기본: 0.05)

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::info;

use cfp::{Client, ClientConfig, Server, ServerConfig};

/// 테스트용 텍스트 데이터 생성
fn generate_test_text(size_mb: usize) -> Vec<u8> {
    let target_size = size_mb * 1024 * 1024;
    let patterns = [
        "The quick brown fox jumps over the lazy dog. ",
        "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ",
        "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 ",
        "가나다라마바사아자차카타파하 ",
    ];

    let mut data = Vec::with_capacity(target_size);
    let mut i = 0;
    while data.len() < target_size {
        data.extend_from_slice(patterns[i % patterns.len()].as_bytes());
        i += 1;
    }
    data.truncate(target_size);
    data
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cfp::logging::init("info");

    let mut args = std::env::args().skip(1);
    let size_mb: usize = args.next().map(|s| s.parse()).transpose()?.unwrap_or(10);
    let loss: f64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(0.05);

    let workdir = std::env::temp_dir().join(format!("cfp-loopback-{}", std::process::id()));
    let files_dir = workdir.join("files");
    std::fs::create_dir_all(&files_dir)?;

    let data = generate_test_text(size_mb);
    std::fs::write(files_dir.join("test.txt"), &data)?;
    info!("테스트 파일 생성: {} MB, 손실률 {:.1}%", size_mb, loss * 100.0);

    let server = Arc::new(
        Server::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".parse()?,
            files_dir,
            listing_path: workdir.join("server_list.txt"),
            ack_timeout_ms: 300,
            retry_interval_ms: 100,
            max_retries: 10,
            simulated_loss: loss,
            ..ServerConfig::default()
        })
        .await?,
    );
    let server_addr = server.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = {
        let server = server.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    let client = Client::new(
        ClientConfig {
            server_addr,
            bind_addr: "127.0.0.1:0".parse()?,
            downloads_dir: workdir.join("downloads"),
            ..ClientConfig::default()
        },
        shutdown_rx,
    )?;

    for entry in client.list().await? {
        info!("서버 파일: {} ({} bytes)", entry.name, entry.size);
    }

    let start = Instant::now();
    let path = client.download("test.txt").await?;
    let elapsed = start.elapsed();

    let received = std::fs::read(&path)?;
    info!(
        "전송 완료: {:.2}s, {:.2} MB/s, 일치: {}",
        elapsed.as_secs_f64(),
        data.len() as f64 / 1024.0 / 1024.0 / elapsed.as_secs_f64(),
        received == data
    );
    info!("서버 통계: {}", server.stats().summary());

    let _ = shutdown_tx.send(true);
    server_task.await??;
    std::fs::remove_dir_all(&workdir)?;
    Ok(())
}
