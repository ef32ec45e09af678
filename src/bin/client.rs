//! CFP 클라이언트 - Chunk Fetch Protocol
//!
//! 서버에서 파일을 청크 단위로 병렬 다운로드한다.
//! - 샤드마다 워커 하나, 소켓 하나
//! - 받은 청크는 바로 파일 오프셋에 기록
//!
//! 사용법:
//!   cargo run --release --bin cfp-client -- [OPTIONS] <COMMAND>
//!
//! 예시:
//!   # 파일 목록
//!   cargo run --release --bin cfp-client -- --server 192.168.1.100:12345 list
//!
//!   # 파일 두 개를 동시에 다운로드
//!   cargo run --release --bin cfp-client -- get a.bin b.bin
//!
//!   # 큐 파일 감시
//!   cargo run --release --bin cfp-client -- queue input.txt

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use cfp::{Client, Config};

#[derive(Parser, Debug)]
#[command(name = "cfp-client", version, about = "CFP download client")]
struct Args {
    /// TOML 설정 파일
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 서버 주소
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// 다운로드 저장 디렉토리
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 파일당 워커 수
    #[arg(short, long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 서버 파일 목록 출력
    List,

    /// 파일 다운로드 (여러 개면 동시에)
    Get {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// 큐 파일에 적힌 파일 중 아직 없는 것을 계속 다운로드
    Queue {
        file: PathBuf,

        /// 큐 파일 확인 주기 (초)
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cfp::logging::init(config.log_level.as_deref().unwrap_or("info"));

    if let Some(server) = args.server {
        config.client.server_addr = server;
    }
    if let Some(dir) = args.output {
        config.client.downloads_dir = dir;
    }
    if let Some(workers) = args.workers {
        config.client.workers = workers;
    }

    info!("CFP Client starting...");
    info!("Server address: {}", config.client.server_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("종료 신호 수신");
        }
        let _ = shutdown_tx.send(true);
    });

    let client = Arc::new(Client::new(config.client, shutdown_rx.clone())?);

    match args.command {
        Command::List => {
            for entry in client.list().await? {
                println!("{:<40} {:>12} bytes", entry.name, entry.size);
            }
        }
        Command::Get { files } => {
            let failed = download_all(&client, files).await;
            if failed > 0 {
                return Err(format!("{} download(s) failed", failed).into());
            }
        }
        Command::Queue { file, poll_secs } => {
            run_queue(&client, &file, Duration::from_secs(poll_secs), shutdown_rx).await;
        }
    }

    Ok(())
}

/// 파일들을 동시에 다운로드, 실패 수 반환 (중복 이름은 한 번만)
async fn download_all(client: &Arc<Client>, files: Vec<String>) -> usize {
    let mut downloads = JoinSet::new();
    for filename in dedup_names(files) {
        let client = client.clone();
        downloads.spawn(async move {
            let result = client.download(&filename).await;
            (filename, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = downloads.join_next().await {
        match joined {
            Ok((filename, Ok(path))) => info!("{} -> {}", filename, path.display()),
            Ok((filename, Err(e))) => {
                error!("{} 다운로드 실패: {}", filename, e);
                failed += 1;
            }
            Err(e) => {
                error!("다운로드 태스크 실패: {}", e);
                failed += 1;
            }
        }
    }
    failed
}

/// 처음 나온 순서를 유지하며 중복 제거
fn dedup_names(files: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// 큐 파일 감시 루프 (shutdown 신호까지)
async fn run_queue(
    client: &Arc<Client>,
    queue: &Path,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("큐 파일 감시: {}", queue.display());
    loop {
        match tokio::fs::read_to_string(queue).await {
            Ok(text) => {
                let pending = client.pending_from_queue(&text);
                if !pending.is_empty() {
                    download_all(client, pending).await;
                }
            }
            Err(e) => warn!("큐 파일 읽기 실패 {}: {}", queue.display(), e),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_names_keeps_first_occurrence() {
        let files = ["a.bin", "b.bin", "a.bin", "c.bin", "b.bin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(dedup_names(files), vec!["a.bin", "b.bin", "c.bin"]);
    }
}
