//! 패킷 코덱
//!
//! 모든 데이터그램은 고정 헤더 + 페이로드로 구성된다. 정수는 모두 big-endian.
//!
//! ```text
//!  0               1               2               3
//! +---------------+---------------+---------------+---------------+
//! |                        Sequence Number                        |
//! +---------------+---------------+---------------+---------------+
//! |  Kind/Flags   |                  Checksum (CRC32) ...         |
//! +---------------+---------------+---------------+---------------+
//! |  ... Checksum |        Payload Length         |  Payload ...  |
//! +---------------+---------------+---------------+---------------+
//! ```
//!
//! Kind/Flags: bit 0-1 종류 (0 DATA, 1 ACK), bit 4 SYN, bit 5 FIN, bit 6 SACK.
//! 체크섬은 체크섬 필드를 0으로 둔 전체 데이터그램에 대한 CRC32.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result, HEADER_LEN, MAX_PAYLOAD};

const OFF_SEQ: usize = 0;
const OFF_KIND: usize = 4;
const OFF_CHECKSUM: usize = 5;
const OFF_PAYLOAD_LEN: usize = 9;

const KIND_MASK: u8 = 0b0000_0011;

/// Kind/Flags 바이트의 플래그 비트
pub mod flags {
    /// 세션 시작 (초기 시퀀스 번호 동기화)
    pub const SYN: u8 = 0b0001_0000;
    /// 세션 종료
    pub const FIN: u8 = 0b0010_0000;
    /// ACK 페이로드에 선택적 ACK 목록 포함
    pub const SACK: u8 = 0b0100_0000;

    pub(super) const ALL: u8 = SYN | FIN | SACK;
}

/// 패킷 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Ack = 1,
}

impl PacketKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PacketKind::Data),
            1 => Some(PacketKind::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Data => write!(f, "DATA"),
            PacketKind::Ack => write!(f, "ACK"),
        }
    }
}

/// 프로토콜 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 시퀀스 번호 (ACK이면 다음에 기대하는 번호)
    pub seq: u32,

    /// 패킷 종류
    pub kind: PacketKind,

    /// [`flags`] 비트마스크
    pub flags: u8,

    /// CRC32 체크섬
    ///
    /// 생성 시 계산되고, decode 시에는 수신된 값이 들어간다.
    pub checksum: u32,

    /// 페이로드
    pub payload: Bytes,
}

impl Packet {
    /// 새 패킷 생성 (체크섬 계산 포함)
    pub fn new(seq: u32, kind: PacketKind, flags: u8, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD, "payload too large: {}", payload.len());
        let checksum = compute_checksum(seq, kind as u8 | flags, &payload);
        Self {
            seq,
            kind,
            flags,
            checksum,
            payload,
        }
    }

    /// 데이터 패킷
    pub fn data(seq: u32, payload: Bytes) -> Self {
        Self::new(seq, PacketKind::Data, 0, payload)
    }

    /// 세션 시작 패킷 (페이로드 없음)
    pub fn syn(seq: u32) -> Self {
        Self::new(seq, PacketKind::Data, flags::SYN, Bytes::new())
    }

    /// 세션 종료 패킷 (페이로드 없음)
    pub fn fin(seq: u32) -> Self {
        Self::new(seq, PacketKind::Data, flags::FIN, Bytes::new())
    }

    /// 누적 ACK. `sacked`가 비어 있지 않으면 선택적 ACK 목록을 페이로드에 싣는다.
    pub fn ack(expected_next: u32, extra_flags: u8, sacked: &[u32]) -> Self {
        if sacked.is_empty() {
            return Self::new(expected_next, PacketKind::Ack, extra_flags, Bytes::new());
        }

        let count = sacked.len().min(MAX_PAYLOAD / 4);
        let mut buf = BytesMut::with_capacity(count * 4);
        for &seq in &sacked[..count] {
            buf.put_u32(seq);
        }
        Self::new(
            expected_next,
            PacketKind::Ack,
            extra_flags | flags::SACK,
            buf.freeze(),
        )
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }

    /// 선택적 ACK 목록 (SACK 플래그가 없으면 빈 목록)
    pub fn sack_list(&self) -> Vec<u32> {
        if !self.is_ack() || self.flags & flags::SACK == 0 {
            return Vec::new();
        }
        self.payload
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// 직렬화된 크기
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// 바이트로 직렬화. 체크섬은 현재 필드 값으로 다시 계산한다.
    pub fn encode(&self) -> Bytes {
        let kind_flags = self.kind as u8 | self.flags;
        let checksum = compute_checksum(self.seq, kind_flags, &self.payload);

        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32(self.seq);
        buf.put_u8(kind_flags);
        buf.put_u32(checksum);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 바이트에서 역직렬화 (체크섬 검증)
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_with(buf, true)
    }

    /// 체크섬 검증 없이 역직렬화
    ///
    /// 손상 감지를 끈 단계별 테스트 전용. 구조 검사는 그대로 수행한다.
    pub fn decode_unverified(buf: &[u8]) -> Result<Self> {
        Self::decode_with(buf, false)
    }

    /// 헤더의 종류 바이트만 보고 DATA 패킷(SYN/FIN 제외)인지 판단
    ///
    /// 체크섬은 보지 않는다. 짧은 데이터그램은 false.
    pub fn peek_is_data(buf: &[u8]) -> bool {
        match buf.get(OFF_KIND) {
            Some(&kind_flags) if buf.len() >= HEADER_LEN => {
                kind_flags & KIND_MASK == PacketKind::Data as u8
                    && kind_flags & (flags::SYN | flags::FIN) == 0
            }
            _ => false,
        }
    }

    pub(crate) fn decode_with(buf: &[u8], verify: bool) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Truncated {
                len: buf.len(),
                header_len: HEADER_LEN,
            });
        }

        let seq = u32::from_be_bytes([
            buf[OFF_SEQ],
            buf[OFF_SEQ + 1],
            buf[OFF_SEQ + 2],
            buf[OFF_SEQ + 3],
        ]);
        let kind_flags = buf[OFF_KIND];
        let checksum = u32::from_be_bytes([
            buf[OFF_CHECKSUM],
            buf[OFF_CHECKSUM + 1],
            buf[OFF_CHECKSUM + 2],
            buf[OFF_CHECKSUM + 3],
        ]);
        let payload_len =
            u16::from_be_bytes([buf[OFF_PAYLOAD_LEN], buf[OFF_PAYLOAD_LEN + 1]]) as usize;

        if buf.len() != HEADER_LEN + payload_len {
            return Err(Error::LengthMismatch {
                declared: payload_len,
                actual: buf.len() - HEADER_LEN,
            });
        }

        let payload = &buf[HEADER_LEN..];

        if verify {
            let expected = compute_checksum(seq, kind_flags, payload);
            if expected != checksum {
                return Err(Error::CorruptPacket {
                    expected,
                    got: checksum,
                });
            }
        }

        let flag_bits = kind_flags & !KIND_MASK;
        if flag_bits & !flags::ALL != 0 {
            return Err(Error::UnknownKind(kind_flags));
        }
        let kind = PacketKind::from_bits(kind_flags & KIND_MASK)
            .ok_or(Error::UnknownKind(kind_flags))?;

        Ok(Self {
            seq,
            kind,
            flags: flag_bits,
            checksum,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// 패킷 로그 형식: `종류 시퀀스 길이 체크섬`
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.is_syn() {
            "SYN"
        } else if self.is_fin() {
            "FIN"
        } else {
            ""
        };
        write!(
            f,
            "{}{}{} {} {} {}",
            self.kind,
            if tag.is_empty() { "" } else { "+" },
            tag,
            self.seq,
            self.payload.len(),
            self.checksum
        )
    }
}

/// 체크섬 필드를 0으로 둔 헤더 + 페이로드에 대한 CRC32
fn compute_checksum(seq: u32, kind_flags: u8, payload: &[u8]) -> u32 {
    let mut header = [0u8; HEADER_LEN];
    header[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
    header[OFF_KIND] = kind_flags;
    header[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
        .copy_from_slice(&(payload.len() as u16).to_be_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(payload);
    hasher.finalize()
}
