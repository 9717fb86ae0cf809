//! 수신 엔진
//!
//! - 체크섬 검증 후 손상 패킷 폐기
//! - 순서 재정렬 버퍼, 누적 ACK (+ 선택적 ACK 목록)
//! - 각 시퀀스 번호는 정확히 한 번만 애플리케이션에 전달
//!
//! 송신 엔진과 마찬가지로 I/O를 하지 않는다.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::packet::{flags, Packet};
use crate::seq::{distance, in_window, is_before};
use crate::state::SessionState;
use crate::stats::TransferStats;
use crate::{Config, Error, Policy, Result};

/// 데이터 패킷 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// SYN 수락, 세션 수립
    Handshake,
    /// 순서대로 도착, 전달된 페이로드 수 (버퍼에서 이어진 것 포함)
    Delivered(usize),
    /// 순서 밖 패킷을 버퍼에 보관
    Buffered,
    /// 이미 받은 패킷
    Duplicate,
    /// 순서 밖 패킷 폐기 (재정렬 비활성)
    OutOfOrder,
    /// 수신 윈도우 밖
    Overflow,
    /// 손상된 데이터그램
    Corrupt,
    /// FIN 수신, 스트림 종료
    Finished,
    /// 현재 상태에서 의미 없는 패킷
    Ignored,
}

/// 수신 엔진
#[derive(Debug)]
pub struct ReceiverEngine {
    policy: Policy,

    reack_on_corrupt: bool,

    state: SessionState,

    /// 상대방 초기 시퀀스 번호
    isn: Option<u32>,

    /// 다음에 전달할 시퀀스 번호 (= 누적 ACK 값)
    expected_next: u32,

    /// 순서 밖으로 도착한 패킷
    buffer: HashMap<u32, Packet>,

    fin_seq: Option<u32>,

    /// 애플리케이션이 가져가길 기다리는 페이로드
    delivered: VecDeque<Bytes>,

    outbox: VecDeque<Bytes>,

    /// 마지막으로 보낸 ACK
    last_ack: Option<Bytes>,

    stats: TransferStats,
}

impl ReceiverEngine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            policy: config.policy,
            reack_on_corrupt: config.reack_on_corrupt,
            state: SessionState::Listen,
            isn: None,
            expected_next: 0,
            buffer: HashMap::new(),
            fin_seq: None,
            delivered: VecDeque::new(),
            outbox: VecDeque::new(),
            last_ack: None,
            stats: TransferStats::new(),
        })
    }

    /// 수신한 데이터그램 처리
    pub fn on_datagram(&mut self, buf: &[u8]) -> DataOutcome {
        self.stats.datagrams_received += 1;
        let packet = match Packet::decode_with(buf, self.policy.detect_corruption) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.corrupt_dropped += 1;
                debug!("손상된 패킷 폐기: {}", e);
                if self.reack_on_corrupt {
                    if let Some(ack) = self.last_ack.clone() {
                        self.push_ack(ack);
                    }
                }
                return DataOutcome::Corrupt;
            }
        };
        trace!(target: "rudp::wire", "{}", packet);

        match self.on_data(packet) {
            Ok(outcome) => outcome,
            Err(Error::OutOfOrderOverflow { seq, expected }) => {
                debug!("수신 윈도우 밖 패킷 폐기: seq={}, expected={}", seq, expected);
                DataOutcome::Overflow
            }
            Err(e) => {
                debug!("패킷 처리 실패: {}", e);
                DataOutcome::Ignored
            }
        }
    }

    /// 검증된 패킷 처리
    ///
    /// 윈도우 밖 패킷은 [`Error::OutOfOrderOverflow`]로 알리고 ACK하지 않는다.
    pub fn on_data(&mut self, packet: Packet) -> Result<DataOutcome> {
        if packet.is_ack() {
            return Ok(DataOutcome::Ignored);
        }

        match self.state {
            SessionState::Listen => Ok(self.on_listen(packet)),
            SessionState::Established => self.on_established(packet),
            SessionState::Closed => Ok(self.on_closed(packet)),
            _ => Ok(DataOutcome::Ignored),
        }
    }

    fn on_listen(&mut self, packet: Packet) -> DataOutcome {
        if !packet.is_syn() {
            debug!("SYN 전 데이터 무시: seq={}", packet.seq);
            return DataOutcome::Ignored;
        }
        self.isn = Some(packet.seq);
        self.expected_next = packet.seq.wrapping_add(1);
        self.state = SessionState::Established;
        info!("세션 수락: isn={}", packet.seq);
        self.send_ack(flags::SYN);
        DataOutcome::Handshake
    }

    fn on_established(&mut self, packet: Packet) -> Result<DataOutcome> {
        let seq = packet.seq;

        if packet.is_syn() {
            // SYN ACK 유실 시 송신측 재전송
            if Some(seq) == self.isn {
                self.send_ack(flags::SYN);
                return Ok(DataOutcome::Duplicate);
            }
            return Ok(DataOutcome::Ignored);
        }

        if seq == self.expected_next {
            let mut count = self.deliver_in_order(packet)?;
            while self.state == SessionState::Established {
                let Some(next) = self.buffer.remove(&self.expected_next) else {
                    break;
                };
                count += self.deliver_in_order(next)?;
            }
            if self.state == SessionState::Closed {
                self.send_ack(flags::FIN);
                return Ok(DataOutcome::Finished);
            }
            self.send_ack(0);
            return Ok(DataOutcome::Delivered(count));
        }

        if is_before(seq, self.expected_next) {
            self.stats.duplicates_dropped += 1;
            self.send_ack(0);
            return Ok(DataOutcome::Duplicate);
        }

        if !in_window(seq, self.expected_next, self.policy.window_size()) {
            self.stats.overflow_dropped += 1;
            return Err(Error::OutOfOrderOverflow {
                seq,
                expected: self.expected_next,
            });
        }

        if !self.policy.handle_reordering {
            self.stats.out_of_order_dropped += 1;
            self.send_ack(0);
            return Ok(DataOutcome::OutOfOrder);
        }

        let outcome = if self.buffer.contains_key(&seq) {
            self.stats.duplicates_dropped += 1;
            DataOutcome::Duplicate
        } else {
            self.buffer.insert(seq, packet);
            DataOutcome::Buffered
        };
        self.send_ack(0);
        Ok(outcome)
    }

    /// FIN ACK가 유실되면 송신측은 FIN이나 base 데이터를 재전송한다.
    /// 이미 받은 번호면 무엇이든 FIN ACK로 다시 응답.
    fn on_closed(&mut self, packet: Packet) -> DataOutcome {
        if self.fin_seq.is_none() || !is_before(packet.seq, self.expected_next) {
            return DataOutcome::Ignored;
        }
        if !packet.is_fin() {
            self.stats.duplicates_dropped += 1;
        }
        self.send_ack(flags::FIN);
        DataOutcome::Duplicate
    }

    /// `expected_next` 패킷 하나를 소비. FIN이면 세션을 닫는다.
    fn deliver_in_order(&mut self, packet: Packet) -> Result<usize> {
        if packet.seq != self.expected_next {
            return Err(Error::DuplicateDelivery { seq: packet.seq });
        }
        self.expected_next = self.expected_next.wrapping_add(1);

        if packet.is_fin() {
            self.fin_seq = Some(packet.seq);
            self.state = SessionState::Closed;
            self.buffer.clear();
            info!("스트림 종료: FIN seq={}", packet.seq);
            return Ok(0);
        }

        self.stats.bytes_delivered += packet.payload.len() as u64;
        self.delivered.push_back(packet.payload);
        Ok(1)
    }

    fn send_ack(&mut self, extra_flags: u8) {
        let sacked = if self.policy.selective_ack {
            let mut keys: Vec<u32> = self.buffer.keys().copied().collect();
            keys.sort_by_key(|&k| distance(self.expected_next, k));
            keys
        } else {
            Vec::new()
        };
        let ack = Packet::ack(self.expected_next, extra_flags, &sacked);
        trace!(target: "rudp::wire", "{}", ack);
        let wire = ack.encode();
        self.last_ack = Some(wire.clone());
        self.push_ack(wire);
    }

    fn push_ack(&mut self, wire: Bytes) {
        self.outbox.push_back(wire);
        self.stats.acks_sent += 1;
        self.stats.datagrams_sent += 1;
    }

    /// 전달된 페이로드 하나 꺼내기 (순서 보장)
    pub fn deliver(&mut self) -> Option<Bytes> {
        self.delivered.pop_front()
    }

    pub fn drain_delivered(&mut self) -> Vec<Bytes> {
        self.delivered.drain(..).collect()
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    pub fn drain_transmits(&mut self) -> Vec<Bytes> {
        self.outbox.drain(..).collect()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn expected_next(&self) -> u32 {
        self.expected_next
    }

    /// 재정렬 버퍼에 있는 패킷 수
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// FIN까지 받아 스트림이 끝났는지
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Closed && self.fin_seq.is_some()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISN: u32 = 500;

    fn data(seq: u32, payload: &'static [u8]) -> Bytes {
        Packet::data(seq, Bytes::from_static(payload)).encode()
    }

    fn acks(engine: &mut ReceiverEngine) -> Vec<Packet> {
        engine
            .drain_transmits()
            .iter()
            .map(|b| Packet::decode(b).unwrap())
            .collect()
    }

    fn accepted(config: Config) -> ReceiverEngine {
        let mut engine = ReceiverEngine::new(config).unwrap();
        assert_eq!(
            engine.on_datagram(&Packet::syn(ISN).encode()),
            DataOutcome::Handshake
        );
        let syn_ack = acks(&mut engine);
        assert_eq!(syn_ack.len(), 1);
        assert!(syn_ack[0].is_syn() && syn_ack[0].is_ack());
        assert_eq!(syn_ack[0].seq, ISN + 1);
        engine
    }

    #[test]
    fn test_data_before_syn_ignored() {
        let mut engine = ReceiverEngine::new(Config::default()).unwrap();
        assert_eq!(engine.on_datagram(&data(7, b"x")), DataOutcome::Ignored);
        assert_eq!(engine.state(), SessionState::Listen);
        assert!(engine.drain_transmits().is_empty());
    }

    #[test]
    fn test_in_order_delivery() {
        let mut engine = accepted(Config::default());
        assert_eq!(engine.on_datagram(&data(ISN + 1, b"A")), DataOutcome::Delivered(1));
        assert_eq!(engine.on_datagram(&data(ISN + 2, b"B")), DataOutcome::Delivered(1));
        assert_eq!(engine.drain_delivered(), vec!["A", "B"]);
        let values: Vec<u32> = acks(&mut engine).iter().map(|a| a.seq).collect();
        assert_eq!(values, vec![ISN + 2, ISN + 3]);
    }

    #[test]
    fn test_reordered_packets_delivered_in_order() {
        let mut engine = accepted(Config::default());
        engine.on_datagram(&data(ISN + 1, b"0"));
        assert_eq!(engine.on_datagram(&data(ISN + 3, b"2")), DataOutcome::Buffered);
        assert_eq!(engine.buffered(), 1);
        assert_eq!(engine.on_datagram(&data(ISN + 2, b"1")), DataOutcome::Delivered(2));
        assert_eq!(engine.drain_delivered(), vec!["0", "1", "2"]);
        assert_eq!(engine.expected_next(), ISN + 4);
        assert_eq!(engine.buffered(), 0);
    }

    #[test]
    fn test_ack_carries_sack_list() {
        let mut engine = accepted(Config::default());
        engine.on_datagram(&data(ISN + 4, b"d"));
        engine.on_datagram(&data(ISN + 2, b"b"));
        let last = acks(&mut engine).pop().unwrap();
        assert_eq!(last.seq, ISN + 1);
        assert_eq!(last.sack_list(), vec![ISN + 2, ISN + 4]);
    }

    #[test]
    fn test_no_sack_when_disabled() {
        let mut config = Config::default();
        config.policy.selective_ack = false;
        let mut engine = accepted(config);
        engine.on_datagram(&data(ISN + 3, b"c"));
        let ack = acks(&mut engine).pop().unwrap();
        assert!(ack.sack_list().is_empty());
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn test_duplicates_not_redelivered() {
        let mut engine = accepted(Config::default());
        engine.on_datagram(&data(ISN + 1, b"A"));
        engine.on_datagram(&data(ISN + 3, b"C"));
        engine.drain_transmits();

        assert_eq!(engine.on_datagram(&data(ISN + 1, b"A")), DataOutcome::Duplicate);
        assert_eq!(engine.on_datagram(&data(ISN + 3, b"C")), DataOutcome::Duplicate);
        assert_eq!(engine.drain_delivered(), vec!["A"]);
        // 중복에도 ACK는 다시 보냄
        let values: Vec<u32> = acks(&mut engine).iter().map(|a| a.seq).collect();
        assert_eq!(values, vec![ISN + 2, ISN + 2]);
        assert_eq!(engine.stats().duplicates_dropped, 2);
    }

    #[test]
    fn test_corrupt_packet_dropped_silently() {
        let mut engine = accepted(Config::default());
        let mut bytes = data(ISN + 1, b"hello").to_vec();
        bytes[12] ^= 0x01;
        assert_eq!(engine.on_datagram(&bytes), DataOutcome::Corrupt);
        assert!(engine.deliver().is_none());
        assert!(engine.drain_transmits().is_empty());
        assert_eq!(engine.stats().corrupt_dropped, 1);
    }

    #[test]
    fn test_reack_on_corrupt() {
        let mut config = Config::default();
        config.reack_on_corrupt = true;
        let mut engine = accepted(config);
        let mut bytes = data(ISN + 1, b"hello").to_vec();
        bytes[0] ^= 0x80;
        engine.on_datagram(&bytes);
        let resent = acks(&mut engine);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].seq, ISN + 1);
    }

    #[test]
    fn test_overflow_rejected_without_ack() {
        let mut engine = accepted(Config::default().with_window(4));
        assert_eq!(engine.on_datagram(&data(ISN + 5, b"x")), DataOutcome::Overflow);
        assert!(matches!(
            engine.on_data(Packet::data(ISN + 9, Bytes::new())),
            Err(Error::OutOfOrderOverflow { expected, .. }) if expected == ISN + 1
        ));
        assert!(engine.drain_transmits().is_empty());
        assert_eq!(engine.buffered(), 0);
        // 윈도우 끝자리는 허용
        assert_eq!(engine.on_datagram(&data(ISN + 4, b"y")), DataOutcome::Buffered);
    }

    #[test]
    fn test_go_back_n_discards_out_of_order() {
        let mut engine = accepted(Config::checkpoint(2, 8));
        assert_eq!(engine.on_datagram(&data(ISN + 2, b"B")), DataOutcome::OutOfOrder);
        assert_eq!(engine.buffered(), 0);
        assert_eq!(acks(&mut engine)[0].seq, ISN + 1);
        assert_eq!(engine.on_datagram(&data(ISN + 1, b"A")), DataOutcome::Delivered(1));
        assert_eq!(engine.expected_next(), ISN + 2);
    }

    #[test]
    fn test_fin_closes_and_is_reacked() {
        let mut engine = accepted(Config::default());
        engine.on_datagram(&data(ISN + 1, b"A"));
        engine.drain_transmits();

        assert_eq!(
            engine.on_datagram(&Packet::fin(ISN + 2).encode()),
            DataOutcome::Finished
        );
        assert!(engine.is_finished());
        let fin_ack = acks(&mut engine).pop().unwrap();
        assert!(fin_ack.is_fin());
        assert_eq!(fin_ack.seq, ISN + 3);

        assert_eq!(
            engine.on_datagram(&Packet::fin(ISN + 2).encode()),
            DataOutcome::Duplicate
        );
        assert_eq!(acks(&mut engine).len(), 1);
        assert_eq!(engine.on_datagram(&data(ISN + 9, b"late")), DataOutcome::Ignored);
        assert_eq!(engine.drain_delivered(), vec!["A"]);
    }

    #[test]
    fn test_closed_receiver_reacks_duplicate_data() {
        let mut engine = accepted(Config::default());
        engine.on_datagram(&data(ISN + 2, b"B"));
        engine.on_datagram(&Packet::fin(ISN + 3).encode());
        engine.on_datagram(&data(ISN + 1, b"A"));
        assert!(engine.is_finished());
        engine.drain_transmits();

        // FIN ACK 유실 후 송신측이 base 데이터를 재전송
        assert_eq!(engine.on_datagram(&data(ISN + 1, b"A")), DataOutcome::Duplicate);
        let reack = acks(&mut engine);
        assert_eq!(reack.len(), 1);
        assert!(reack[0].is_fin());
        assert_eq!(reack[0].seq, ISN + 4);
        assert!(reack[0].sack_list().is_empty());
        assert_eq!(engine.drain_delivered(), vec!["A", "B"]);
        assert_eq!(engine.stats().duplicates_dropped, 1);
    }

    #[test]
    fn test_buffered_fin_completes_after_gap() {
        let mut engine = accepted(Config::default());
        engine.on_datagram(&data(ISN + 2, b"B"));
        engine.on_datagram(&Packet::fin(ISN + 3).encode());
        assert_eq!(engine.on_datagram(&data(ISN + 1, b"A")), DataOutcome::Finished);
        assert_eq!(engine.drain_delivered(), vec!["A", "B"]);
    }

    #[test]
    fn test_duplicate_syn_reacked() {
        let mut engine = accepted(Config::default());
        assert_eq!(
            engine.on_datagram(&Packet::syn(ISN).encode()),
            DataOutcome::Duplicate
        );
        let ack = acks(&mut engine).pop().unwrap();
        assert!(ack.is_syn());
        assert_eq!(ack.seq, ISN + 1);
    }

    #[test]
    fn test_wraparound_delivery() {
        let mut engine = ReceiverEngine::new(Config::default()).unwrap();
        engine.on_datagram(&Packet::syn(u32::MAX - 1).encode());
        engine.on_datagram(&data(0, b"1"));
        engine.on_datagram(&data(u32::MAX, b"0"));
        assert_eq!(engine.drain_delivered(), vec!["0", "1"]);
        assert_eq!(engine.expected_next(), 1);
    }
}
