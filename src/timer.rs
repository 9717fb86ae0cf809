//! 재전송 타이머
//!
//! - [`TimerQueue`]: 패킷별 타이머. 만료 시각 기준 최소 힙 + `seq -> 세대` 맵.
//!   취소는 맵에서 지우기만 하고, 힙에 남은 항목은 꺼낼 때 버린다.
//! - [`RttEstimator`]: RTT 샘플 기반 RTO 계산 (SRTT + 4·RTTVAR)

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// 패킷별 재전송 타이머 큐
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, u32)>>,
    armed: HashMap<u32, u64>,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// `seq` 타이머를 `deadline`에 설정. 이미 있으면 재시작.
    pub fn arm(&mut self, seq: u32, deadline: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.armed.insert(seq, generation);
        self.heap.push(Reverse((deadline, generation, seq)));
    }

    /// 타이머 취소. 있었으면 true.
    pub fn cancel(&mut self, seq: u32) -> bool {
        self.armed.remove(&seq).is_some()
    }

    /// 전부 취소
    pub fn clear(&mut self) {
        self.armed.clear();
        self.heap.clear();
    }

    pub fn is_armed(&self, seq: u32) -> bool {
        self.armed.contains_key(&seq)
    }

    /// 살아있는 타이머 수
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// 가장 이른 만료 시각
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// `now`까지 만료된 타이머 하나를 꺼냄
    pub fn pop_expired(&mut self, now: Instant) -> Option<u32> {
        self.discard_stale();
        match self.heap.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => {}
            _ => return None,
        }
        let Reverse((_, _, seq)) = self.heap.pop()?;
        self.armed.remove(&seq);
        Some(seq)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, generation, seq))) = self.heap.peek() {
            if self.armed.get(seq) == Some(generation) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// RTT 추정기 (RFC 6298)
///
/// 첫 샘플: SRTT = R, RTTVAR = R/2
/// 이후:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|, SRTT = 7/8·SRTT + 1/8·R
#[derive(Debug, Clone)]
pub struct RttEstimator {
    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
    /// 연속 타임아웃에 의한 백오프 배수 (2^n)
    backoff: u32,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            initial_rto,
            min_rto,
            max_rto,
            srtt: None,
            rttvar: Duration::ZERO,
            backoff: 0,
        }
    }

    /// RTT 샘플 기록. 백오프는 초기화된다.
    pub fn record_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = if sample > srtt {
                    sample - srtt
                } else {
                    srtt - sample
                };
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.backoff = 0;
    }

    /// 타임아웃 발생 시 RTO 두 배 (상한 있음)
    pub fn back_off(&mut self) {
        if self.rto() < self.max_rto {
            self.backoff = (self.backoff + 1).min(16);
        }
    }

    /// 현재 RTO
    pub fn rto(&self) -> Duration {
        let base = match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto),
            None => self.initial_rto,
        };
        base.saturating_mul(1 << self.backoff).min(self.max_rto)
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }
}
