//! rUDP 수신기
//!
//! 송신기 하나로부터 스트림을 받아 파일로 저장한다.
//!
//! 사용법:
//!   rudp-receiver <port> <window-size> <output-file> [OPTIONS]
//!
//! 예시:
//!   # 두 번째 데이터 패킷마다 버리고 ACK에 50±20ms 지연
//!   rudp-receiver 9000 16 out.bin --drop 2 --delay 50 --jitter 20

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::prelude::*;

use rudp::{
    Config, FaultConfig, LossyTransport, ReceiverSession, TransferStats, Transport, UdpTransport,
};

/// 수신기 설정
struct ReceiverArgs {
    port: u16,
    window: usize,
    output: PathBuf,
    log_file: Option<PathBuf>,
    checkpoint: u8,
    drop_every: Option<u64>,
    delay_ms: u64,
    jitter_ms: u64,
}

fn print_usage() {
    println!(
        r#"rudp-receiver - rUDP 파일 수신기

사용법:
  rudp-receiver <port> <window-size> <output-file> [OPTIONS]

옵션:
  --log <FILE>          패킷 로그 파일 (type seq length checksum)
  --checkpoint <N>      기능 단계 1~5 (기본: 5, 전부 활성화)
  --drop <N>            받은 데이터 패킷 N개마다 하나 버림 (SYN/FIN 제외)
  --delay <MS>          ACK 전송 지연 (밀리초)
  --jitter <MS>         지연 흔들림 ±MS
  -h, --help            이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
    );
}

fn parse_args() -> ReceiverArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut positional = Vec::new();
    let mut parsed = ReceiverArgs {
        port: 0,
        window: 0,
        output: PathBuf::new(),
        log_file: None,
        checkpoint: 5,
        drop_every: None,
        delay_ms: 0,
        jitter_ms: 0,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--log" => {
                if i + 1 < args.len() {
                    parsed.log_file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--checkpoint" => {
                if i + 1 < args.len() {
                    parsed.checkpoint = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--drop" => {
                if i + 1 < args.len() {
                    let n: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    parsed.drop_every = (n > 0).then_some(n);
                    i += 1;
                }
            }
            "--delay" => {
                if i + 1 < args.len() {
                    parsed.delay_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--jitter" => {
                if i + 1 < args.len() {
                    parsed.jitter_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    if positional.len() != 3 {
        print_usage();
        std::process::exit(1);
    }

    parsed.port = positional[0].parse().expect("유효한 포트 필요");
    parsed.window = positional[1].parse().expect("유효한 윈도우 크기 필요");
    parsed.output = PathBuf::from(&positional[2]);
    parsed
}

fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::File::create(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .without_time()
                    .with_target(false)
                    .with_level(false)
                    .with_filter(Targets::new().with_target("rudp::wire", Level::TRACE)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// 스트림 끝까지 받아 파일에 기록
async fn receive_to_file<T: Transport>(
    transport: T,
    config: Config,
    output: &Path,
) -> Result<TransferStats, Box<dyn std::error::Error>> {
    let mut session = ReceiverSession::accept(transport, config).await?;
    let mut file = tokio::fs::File::create(output).await?;

    let mut total = 0usize;
    while let Some(payload) = session.recv().await? {
        file.write_all(&payload).await?;
        total += payload.len();
    }
    file.flush().await?;
    info!("{} bytes written to {:?}", total, output);

    Ok(session.close().await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    init_logging(args.log_file.as_deref())?;

    let config = Config::checkpoint(args.checkpoint, args.window);
    config.validate()?;

    let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("rUDP Receiver starting...");
    info!("Window: {} | Checkpoint: {}", args.window, args.checkpoint);

    let transport = UdpTransport::bind(bind).await?;

    let inbound = FaultConfig {
        drop_every_nth: args.drop_every,
        ..FaultConfig::default()
    };
    let outbound = FaultConfig::delayed(args.delay_ms, args.jitter_ms);

    let stats = if inbound.is_noop() && outbound.is_noop() {
        receive_to_file(transport, config, &args.output).await?
    } else {
        info!(
            "Fault injection: drop every {:?}, delay {}ms ±{}ms",
            args.drop_every, args.delay_ms, args.jitter_ms
        );
        let lossy = LossyTransport::new(transport, outbound, inbound, rand::random());
        receive_to_file(lossy, config, &args.output).await?
    };

    info!("Transfer complete: {}", stats.summary());
    Ok(())
}
