//! # rUDP (Reliable UDP)
//!
//! 손실/중복/지연/순서 뒤바뀜/손상이 있는 데이터그램 채널 위의 슬라이딩 윈도우 신뢰 전송 프로토콜
//!
//! ## 핵심 특징
//! - **누적 ACK**: `ACK(N)`은 N 이전 패킷 전부 수신을 의미
//! - **선택적 ACK (옵션)**: 순서 밖으로 버퍼된 패킷 목록을 ACK에 실어 재전송 제외
//! - **패킷별 재전송 타이머**: 우선순위 큐 + 세대 번호로 취소
//! - **CRC32 체크섬**: 손상 패킷은 절대 데이터/ACK로 취급하지 않음
//! - **체크포인트 정책**: 단계별 기능을 독립 플래그로 켜고 끔
//! - **sans-IO 엔진**: 송신/수신 엔진은 시각을 인자로 받고, I/O는 세션 계층이 담당

pub mod config;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod session;
pub mod state;
pub mod stats;
pub mod timer;
pub mod transport;

pub use config::{Config, Policy, WindowLimit};
pub use error::{Error, Result};
pub use packet::{Packet, PacketKind};
pub use receiver::ReceiverEngine;
pub use sender::SenderEngine;
pub use session::{ReceiverSession, SenderSession};
pub use state::SessionState;
pub use stats::TransferStats;
pub use transport::{FaultConfig, LossyTransport, MemoryTransport, Transport, UdpTransport};

/// 패킷 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 11;

/// 최대 데이터그램 크기 (바이트)
pub const MAX_DATAGRAM: usize = 1472;

/// 패킷 하나에 실을 수 있는 최대 페이로드 (바이트)
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 1456;

/// 허용되는 최대 윈도우 크기 (시퀀스 공간의 절반보다 작아야 함)
pub const MAX_WINDOW: usize = 1 << 30;
