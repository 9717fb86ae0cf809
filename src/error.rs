//! 에러 타입 정의

use thiserror::Error;

/// rUDP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("패킷이 너무 짧음: {len} bytes (헤더 {header_len} bytes 필요)")]
    Truncated { len: usize, header_len: usize },

    #[error("페이로드 길이 불일치: header={declared}, actual={actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("알 수 없는 패킷 종류/플래그: {0:#04X}")]
    UnknownKind(u8),

    #[error("체크섬 불일치 (손상된 패킷): expected {expected:08X}, got {got:08X}")]
    CorruptPacket { expected: u32, got: u32 },

    #[error("타임아웃")]
    Timeout,

    #[error("송신 윈도우 가득 참")]
    WindowFull,

    #[error("중복 전달 감지: seq={seq}")]
    DuplicateDelivery { seq: u32 },

    #[error("수신 윈도우 초과: seq={seq}, expected={expected}")]
    OutOfOrderOverflow { seq: u32, expected: u32 },

    #[error("상대방 응답 없음: seq={seq}, {retries}회 재전송 후 포기")]
    PeerUnreachable { seq: u32, retries: u32 },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_fields() {
        let msg = Error::PeerUnreachable { seq: 42, retries: 10 }.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("10"));
    }
}
