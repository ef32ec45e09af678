//! CFP 서버 - Chunk Fetch Protocol
//!
//! 디렉토리의 파일을 청크 단위로 서비스한다.
//! - 모든 응답에 시퀀스 번호, ACK이 없으면 재전송
//! - `server_list.txt` 요청 시 파일 목록 제공
//!
//! 사용법:
//!   cargo run --release --bin cfp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 설정
//!   cargo run --release --bin cfp-server -- --files-dir ./files
//!
//!   # 10% 응답 손실 시뮬레이션
//!   cargo run --release --bin cfp-server -- --loss 0.1

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use cfp::{Config, Server};

#[derive(Parser, Debug)]
#[command(name = "cfp-server", version, about = "CFP chunk server")]
struct Args {
    /// TOML 설정 파일
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 바인드 주소
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// 서비스할 파일 디렉토리
    #[arg(short, long)]
    files_dir: Option<PathBuf>,

    /// 청크 크기 (바이트)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// 응답 손실 시뮬레이션 확률 (0.0 ~ 1.0)
    #[arg(long)]
    loss: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cfp::logging::init(config.log_level.as_deref().unwrap_or("info"));

    let server_config = &mut config.server;
    if let Some(bind) = args.bind {
        server_config.bind_addr = bind;
    }
    if let Some(dir) = args.files_dir {
        server_config.files_dir = dir;
    }
    if let Some(size) = args.chunk_size {
        server_config.chunk_size = size;
    }
    if let Some(loss) = args.loss {
        server_config.simulated_loss = loss;
    }

    info!("CFP Server starting...");
    let server = Arc::new(Server::bind(config.server).await?);
    info!("Listening on {}", server.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("종료 신호 수신"),
            Err(e) => error!("시그널 대기 실패: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}
