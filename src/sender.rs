//! 송신 엔진
//!
//! - 시퀀스 번호 할당 및 청크 분할
//! - 슬라이딩 윈도우 (`base ≤ next_to_send ≤ base + window`)
//! - 패킷별 재전송 타이머, 중복 ACK 빠른 재전송, 선택적 ACK
//!
//! I/O를 하지 않는다. 현재 시각을 인자로 받고, 보낼 데이터그램은 outbox에
//! 쌓아 두면 세션 계층이 [`SenderEngine::poll_transmit`]으로 꺼내 보낸다.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::packet::Packet;
use crate::seq::{distance, in_window, is_before, seq_le};
use crate::state::SessionState;
use crate::stats::TransferStats;
use crate::timer::{RttEstimator, TimerQueue};
use crate::{Config, Error, Policy, Result};

/// 전송되어 ACK를 기다리는 패킷
#[derive(Debug)]
struct InFlight {
    packet: Packet,
    wire: Bytes,
    /// 총 전송 횟수
    transmissions: u32,
    /// 마지막 전송 시각
    sent_at: Instant,
    /// 선택적 ACK로 수신 확인됨 (base는 아직 못 넘음)
    sacked: bool,
}

/// ACK 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 윈도우 전진, 새로 확인된 패킷 수
    Advanced(usize),
    /// base와 같은 값의 중복 ACK
    Duplicate,
    /// 이미 지난 ACK 또는 범위 밖 값
    Stale,
    /// 손상/비정상 데이터그램
    Corrupt,
    /// ACK가 아닌 패킷이거나 세션이 처리할 수 없는 상태
    Ignored,
}

/// 송신 엔진
#[derive(Debug)]
pub struct SenderEngine {
    /// 설정
    config: Config,

    /// 체크포인트 정책
    policy: Policy,

    /// 세션 상태
    state: SessionState,

    /// 초기 시퀀스 번호 (SYN)
    isn: u32,

    /// 가장 오래된 미확인 시퀀스 번호
    base: u32,

    /// 다음에 처음 전송할 시퀀스 번호
    next_to_send: u32,

    /// 다음에 할당할 시퀀스 번호
    next_seq: u32,

    /// in-flight 패킷 (index i ↔ seq base + i)
    outstanding: VecDeque<InFlight>,

    /// 번호는 할당됐지만 윈도우가 없어 대기 중인 패킷
    queue: VecDeque<Packet>,

    /// 패킷별 재전송 타이머
    timers: TimerQueue,

    /// RTT 추정기
    rtt: RttEstimator,

    /// 연속 중복 ACK 수
    dup_acks: u32,

    /// SYN 확인 여부
    syn_acked: bool,

    /// FIN 시퀀스 번호 (close 호출 후)
    fin_seq: Option<u32>,

    /// 실패 정보 (seq, 재전송 횟수)
    failure: Option<(u32, u32)>,

    /// 보낼 데이터그램
    outbox: VecDeque<Bytes>,

    /// 전송 통계
    stats: TransferStats,
}

impl SenderEngine {
    /// 임의의 초기 시퀀스 번호로 새 송신 엔진 생성
    pub fn new(config: Config) -> Result<Self> {
        let isn = rand::thread_rng().gen::<u32>();
        Self::with_isn(config, isn)
    }

    /// 초기 시퀀스 번호를 지정해 생성
    pub fn with_isn(config: Config, isn: u32) -> Result<Self> {
        config.validate()?;
        let rtt = RttEstimator::new(config.rto(), config.min_rto(), config.max_rto());
        Ok(Self {
            policy: config.policy,
            config,
            state: SessionState::Closed,
            isn,
            base: isn,
            next_to_send: isn,
            next_seq: isn,
            outstanding: VecDeque::new(),
            queue: VecDeque::new(),
            timers: TimerQueue::new(),
            rtt,
            dup_acks: 0,
            syn_acked: false,
            fin_seq: None,
            failure: None,
            outbox: VecDeque::new(),
            stats: TransferStats::new(),
        })
    }

    /// SYN 전송으로 세션 시작
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state != SessionState::Closed || self.syn_acked {
            return Err(Error::InvalidConfig(format!(
                "connect는 새 세션에서만 가능: state={}",
                self.state
            )));
        }
        self.state = SessionState::SynSent;
        let syn = Packet::syn(self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.push_back(syn);
        self.release(now);
        debug!("SYN 전송: isn={}", self.isn);
        Ok(())
    }

    /// 페이로드를 청크로 나눠 대기열에 넣고, 윈도우에 들어가는 만큼 전송
    ///
    /// 윈도우가 가득 차도 실패하지 않고 대기열에 쌓는다. 반환값은 만든 패킷 수.
    pub fn submit(&mut self, payload: Bytes, now: Instant) -> Result<usize> {
        self.check_alive()?;
        if self.fin_seq.is_some()
            || !matches!(self.state, SessionState::SynSent | SessionState::Established)
        {
            return Err(Error::ConnectionClosed);
        }

        let chunk_size = self.config.chunk_size;
        let mut count = 0;
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            let packet = Packet::data(self.next_seq, payload.slice(offset..end));
            self.next_seq = self.next_seq.wrapping_add(1);
            self.queue.push_back(packet);
            offset = end;
            count += 1;
        }
        self.stats.bytes_submitted += payload.len() as u64;

        self.release(now);
        Ok(count)
    }

    /// 논블로킹 제출: 윈도우 여유가 없으면 [`Error::WindowFull`]
    pub fn try_submit(&mut self, payload: Bytes, now: Instant) -> Result<usize> {
        self.check_alive()?;
        if !self.has_capacity() {
            return Err(Error::WindowFull);
        }
        self.submit(payload, now)
    }

    /// 새 패킷이 대기 없이 윈도우에 들어갈 수 있는지
    pub fn has_capacity(&self) -> bool {
        self.queue.is_empty() && self.outstanding.len() < self.policy.window_size()
    }

    /// FIN을 대기열에 넣어 종료 시작. 이미 호출됐으면 아무것도 하지 않음.
    pub fn close(&mut self, now: Instant) -> Result<()> {
        self.check_alive()?;
        if self.fin_seq.is_some() {
            return Ok(());
        }
        if !matches!(self.state, SessionState::SynSent | SessionState::Established) {
            return Err(Error::ConnectionClosed);
        }
        let fin = Packet::fin(self.next_seq);
        self.fin_seq = Some(self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.push_back(fin);
        if self.state == SessionState::Established {
            self.state = SessionState::FinWait;
        }
        self.release(now);
        debug!("FIN 대기열 투입: seq={}", self.next_seq.wrapping_sub(1));
        Ok(())
    }

    /// 수신한 데이터그램 처리. 손상된 것은 세고 버린다.
    pub fn on_datagram(&mut self, buf: &[u8], now: Instant) -> AckOutcome {
        self.stats.datagrams_received += 1;
        let packet = match Packet::decode_with(buf, self.policy.detect_corruption) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.corrupt_dropped += 1;
                debug!("손상된 ACK 폐기: {}", e);
                return AckOutcome::Corrupt;
            }
        };
        trace!(target: "rudp::wire", "{}", packet);
        if !packet.is_ack() {
            debug!("ACK가 아닌 패킷 무시: seq={}", packet.seq);
            return AckOutcome::Ignored;
        }
        self.on_ack(&packet, now)
    }

    /// 검증된 ACK 처리
    pub fn on_ack(&mut self, ack: &Packet, now: Instant) -> AckOutcome {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return AckOutcome::Ignored;
        }
        self.stats.acks_received += 1;

        if self.policy.selective_ack {
            for seq in ack.sack_list() {
                self.mark_sacked(seq);
            }
        }

        let value = ack.seq;
        let outcome = if is_before(self.base, value) && seq_le(value, self.next_to_send) {
            AckOutcome::Advanced(self.advance_to(value, now))
        } else if value == self.base && !self.outstanding.is_empty() {
            self.on_duplicate_ack(now);
            AckOutcome::Duplicate
        } else {
            AckOutcome::Stale
        };

        self.release(now);
        outcome
    }

    /// 타이머 만료 처리
    ///
    /// 이미 확인된 패킷이면 아무 일도 하지 않는다. 재전송 한도를 넘으면
    /// 세션이 실패하고 [`Error::PeerUnreachable`]을 돌려준다.
    pub fn on_timer_expiry(&mut self, seq: u32, now: Instant) -> Result<()> {
        self.check_alive()?;
        if !in_window(seq, self.base, self.outstanding.len()) {
            return Ok(());
        }
        let index = distance(self.base, seq) as usize;
        let entry = &self.outstanding[index];
        // 선택적 ACK된 패킷은 base일 때만 재전송 (누적 ACK 유실 대비)
        if entry.sacked && index > 0 {
            return Ok(());
        }

        self.stats.timeouts += 1;
        let retries = entry.transmissions - 1;
        if retries >= self.config.max_retries {
            return Err(self.fail(seq, retries));
        }

        if self.policy.adaptive_timeout {
            self.rtt.back_off();
        }

        if self.policy.selective_retransmit() {
            debug!("타임아웃 재전송: seq={}, rto={:?}", seq, self.current_rto());
            self.retransmit(index, now);
        } else {
            debug!(
                "타임아웃 Go-Back-N 재전송: seq={}..{}, rto={:?}",
                seq,
                self.next_to_send,
                self.current_rto()
            );
            self.retransmit(index, now);
            for i in index + 1..self.outstanding.len() {
                if !self.outstanding[i].sacked {
                    self.retransmit(i, now);
                }
            }
        }
        Ok(())
    }

    /// `now`까지 만료된 타이머 전부 처리
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        while let Some(seq) = self.timers.pop_expired(now) {
            self.on_timer_expiry(seq, now)?;
        }
        Ok(())
    }

    /// 다음 타이머 만료 시각
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// 보낼 데이터그램 하나 꺼내기
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    /// 보낼 데이터그램 전부 꺼내기
    pub fn drain_transmits(&mut self) -> Vec<Bytes> {
        self.outbox.drain(..).collect()
    }

    /// 실패한 세션이면 에러
    pub fn check_alive(&self) -> Result<()> {
        match self.failure {
            Some((seq, retries)) => Err(Error::PeerUnreachable { seq, retries }),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_to_send(&self) -> u32 {
        self.next_to_send
    }

    /// ACK를 기다리는 패킷 수
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// 윈도우를 기다리는 패킷 수
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn window_size(&self) -> usize {
        self.policy.window_size()
    }

    /// 보낸 것이 전부 확인됐는지
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty() && self.queue.is_empty()
    }

    /// FIN까지 확인되어 정상 종료됐는지
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Closed && self.fin_seq.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed
    }

    /// 현재 RTO
    pub fn current_rto(&self) -> Duration {
        if self.policy.adaptive_timeout {
            self.rtt.rto()
        } else {
            self.config.rto()
        }
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> TransferStats {
        let mut stats = self.stats.clone();
        stats.srtt = self.rtt.srtt();
        stats.rto = Some(self.current_rto());
        stats
    }

    /// 윈도우가 허용하는 만큼 대기열 패킷 전송
    fn release(&mut self, now: Instant) {
        if self.state == SessionState::Failed {
            return;
        }
        while self.outstanding.len() < self.policy.window_size() {
            let gated = match self.queue.front() {
                None => break,
                Some(packet) => !self.syn_acked && !packet.is_syn(),
            };
            if gated {
                break;
            }
            let Some(packet) = self.queue.pop_front() else {
                break;
            };
            self.transmit_new(packet, now);
        }
    }

    fn transmit_new(&mut self, packet: Packet, now: Instant) {
        debug_assert_eq!(packet.seq, self.next_to_send);
        let wire = packet.encode();
        trace!(target: "rudp::wire", "{}", packet);

        if self.timer_managed(&packet) {
            self.timers.arm(packet.seq, now + self.current_rto());
        }
        self.next_to_send = packet.seq.wrapping_add(1);
        self.outbox.push_back(wire.clone());
        self.stats.datagrams_sent += 1;
        if !packet.is_syn() && !packet.is_fin() {
            self.stats.data_packets_sent += 1;
        }
        self.outstanding.push_back(InFlight {
            packet,
            wire,
            transmissions: 1,
            sent_at: now,
            sacked: false,
        });
        debug_assert!(self.outstanding.len() <= self.policy.window_size());
    }

    fn retransmit(&mut self, index: usize, now: Instant) {
        let rto = self.current_rto();
        let managed = self.timer_managed(&self.outstanding[index].packet);
        let entry = &mut self.outstanding[index];
        entry.transmissions += 1;
        entry.sent_at = now;
        trace!(target: "rudp::wire", "{}", entry.packet);
        self.outbox.push_back(entry.wire.clone());
        let seq = entry.packet.seq;
        if managed {
            self.timers.arm(seq, now + rto);
        }
        self.stats.retransmissions += 1;
        self.stats.datagrams_sent += 1;
    }

    /// SYN/FIN은 손실 복구 설정과 무관하게 항상 재전송 대상
    fn timer_managed(&self, packet: &Packet) -> bool {
        self.policy.recover_from_loss || packet.is_syn() || packet.is_fin()
    }

    /// 누적 ACK로 base를 `value`까지 전진
    fn advance_to(&mut self, value: u32, now: Instant) -> usize {
        let mut acked = 0;
        let mut sample = None;

        while let Some(front) = self.outstanding.front() {
            if !is_before(front.packet.seq, value) {
                break;
            }
            let Some(entry) = self.outstanding.pop_front() else {
                break;
            };
            self.timers.cancel(entry.packet.seq);
            // Karn: 재전송된 패킷은 RTT 샘플에서 제외
            if entry.transmissions == 1 && !entry.sacked {
                sample = Some(now.saturating_duration_since(entry.sent_at));
            }
            if entry.packet.is_syn() {
                self.syn_acked = true;
                if self.state == SessionState::SynSent {
                    self.state = if self.fin_seq.is_some() {
                        SessionState::FinWait
                    } else {
                        SessionState::Established
                    };
                }
                info!("세션 수립: isn={}", self.isn);
            }
            if entry.packet.is_fin() {
                self.state = SessionState::Closed;
                info!("세션 종료: FIN 확인 seq={}", entry.packet.seq);
            }
            acked += 1;
        }

        self.base = value;
        self.dup_acks = 0;

        // 새 base가 이미 선택적 ACK된 패킷이면 타이머가 없으므로 다시 건다
        let orphaned = self
            .outstanding
            .front()
            .filter(|front| front.sacked && self.timer_managed(&front.packet))
            .map(|front| front.packet.seq);

        if let Some(sample) = sample {
            if self.policy.adaptive_timeout {
                self.rtt.record_sample(sample);
                debug!(
                    target: "rudp::rtt",
                    "RTT sample: {:.2}ms | estimated: {:.2}ms | rto: {:.2}ms",
                    sample.as_secs_f64() * 1000.0,
                    self.rtt.srtt().unwrap_or_default().as_secs_f64() * 1000.0,
                    self.rtt.rto().as_secs_f64() * 1000.0
                );
            }
        }

        if let Some(seq) = orphaned {
            if !self.timers.is_armed(seq) {
                let rto = self.current_rto();
                self.timers.arm(seq, now + rto);
            }
        }
        acked
    }

    fn on_duplicate_ack(&mut self, now: Instant) {
        self.dup_acks += 1;
        self.stats.duplicate_acks += 1;
        if self.policy.fast_retransmit && self.dup_acks == self.config.dup_ack_threshold {
            if let Some(front) = self.outstanding.front() {
                if !front.sacked {
                    debug!("빠른 재전송: seq={}, 중복 ACK {}회", self.base, self.dup_acks);
                    self.retransmit(0, now);
                    self.stats.fast_retransmits += 1;
                }
            }
        }
    }

    fn mark_sacked(&mut self, seq: u32) {
        if !in_window(seq, self.base, self.outstanding.len()) {
            return;
        }
        let index = distance(self.base, seq) as usize;
        let entry = &mut self.outstanding[index];
        if !entry.sacked {
            entry.sacked = true;
            if index > 0 {
                self.timers.cancel(seq);
            }
        }
    }

    fn fail(&mut self, seq: u32, retries: u32) -> Error {
        warn!("상대방 응답 없음: seq={}, {}회 재전송", seq, retries);
        self.state = SessionState::Failed;
        self.failure = Some((seq, retries));
        self.timers.clear();
        Error::PeerUnreachable { seq, retries }
    }
}
