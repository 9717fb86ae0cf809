//! rUDP 송신기
//!
//! 파일 하나를 rUDP로 수신기에 전송한다.
//!
//! 사용법:
//!   rudp-sender <receiver-ip> <receiver-port> <window-size> <input-file> [OPTIONS]
//!
//! 예시:
//!   # 기본 전송 (모든 기능 활성화)
//!   rudp-sender 127.0.0.1 9000 16 data.bin
//!
//!   # 단계 2 동작 + 패킷 로그
//!   rudp-sender 127.0.0.1 9000 16 data.bin --checkpoint 2 --log logs/sender.log

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{info, Level};
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::prelude::*;

use rudp::{Config, Policy, SenderSession, UdpTransport};

/// 송신기 설정
struct SenderArgs {
    receiver_host: String,
    receiver_port: u16,
    window: usize,
    input: PathBuf,
    log_file: Option<PathBuf>,
    checkpoint: u8,
    rtt: bool,
    loss_recovery: bool,
    sack: bool,
}

fn print_usage() {
    println!(
        r#"rudp-sender - rUDP 파일 송신기

사용법:
  rudp-sender <receiver-ip> <receiver-port> <window-size> <input-file> [OPTIONS]

옵션:
  --log <FILE>          패킷 로그 파일 (type seq length checksum)
  --checkpoint <N>      기능 단계 1~5 (기본: 5, 전부 활성화)
  --rtt                 RTT 기반 적응형 타임아웃 (로그에 RTT 기록)
  --loss-recovery       손실 복구 (타임아웃 재전송)
  --sack                선택적 ACK
  -h, --help            이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
    );
}

fn parse_args() -> SenderArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut positional = Vec::new();
    let mut log_file = None;
    let mut checkpoint = 5;
    let mut rtt = false;
    let mut loss_recovery = false;
    let mut sack = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--log" => {
                if i + 1 < args.len() {
                    log_file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--checkpoint" => {
                if i + 1 < args.len() {
                    checkpoint = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--rtt" => rtt = true,
            "--loss-recovery" => loss_recovery = true,
            "--sack" => sack = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    if positional.len() != 4 {
        print_usage();
        std::process::exit(1);
    }

    SenderArgs {
        receiver_host: positional[0].clone(),
        receiver_port: positional[1].parse().expect("유효한 포트 필요"),
        window: positional[2].parse().expect("유효한 윈도우 크기 필요"),
        input: PathBuf::from(&positional[3]),
        log_file,
        checkpoint,
        rtt,
        loss_recovery,
        sack,
    }
}

fn build_config(args: &SenderArgs) -> Config {
    let mut config = Config::checkpoint(args.checkpoint, args.window);
    let policy: &mut Policy = &mut config.policy;
    policy.adaptive_timeout |= args.rtt;
    policy.recover_from_loss |= args.loss_recovery;
    policy.selective_ack |= args.sack;
    config
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
                    .with_filter(
                        Targets::new()
                            .with_target("rudp::wire", Level::TRACE)
                            .with_target("rudp::rtt", Level::DEBUG),
                    ),
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    init_logging(args.log_file.as_deref())?;

    let config = build_config(&args);
    config.validate()?;

    let receiver = tokio::net::lookup_host((args.receiver_host.as_str(), args.receiver_port))
        .await?
        .next()
        .ok_or("수신기 주소를 찾을 수 없음")?;
    let local: SocketAddr = if receiver.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };

    let data = tokio::fs::read(&args.input).await?;
    info!("rUDP Sender starting...");
    info!("Receiver: {}", receiver);
    info!("Window: {} | Checkpoint: {}", args.window, args.checkpoint);
    info!("Input: {:?} ({} bytes)", args.input, data.len());

    let transport = UdpTransport::connect(local, receiver).await?;
    let mut session = SenderSession::connect(transport, config).await?;
    let packets = session.send(Bytes::from(data)).await?;
    info!("{} packets queued", packets);

    let stats = session.close().await?;
    info!("Transfer complete: {}", stats.summary());
    Ok(())
}
