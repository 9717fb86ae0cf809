//! 프로토콜 설정
//!
//! [`Policy`]는 어떤 신뢰성 보장을 켤지 고르는 체크포인트 정책이다. 단계 번호로
//! 분기하지 않고, 각 엔진 연산이 개별 플래그를 참조한다.

use std::time::Duration;

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, MAX_PAYLOAD, MAX_WINDOW};

/// 흐름 제어 윈도우
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLimit {
    /// 최대 `n`개 패킷 in-flight
    Bounded(usize),
    /// 제한 없음 ([`MAX_WINDOW`]까지)
    Unbounded,
}

impl WindowLimit {
    /// 실제로 적용되는 윈도우 크기
    pub fn size(&self) -> usize {
        match *self {
            WindowLimit::Bounded(n) => n.clamp(1, MAX_WINDOW),
            WindowLimit::Unbounded => MAX_WINDOW,
        }
    }
}

/// 체크포인트 정책 (활성화된 보장 목록)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// 체크섬 검증. 끄면 decode가 검증을 건너뜀 (단계별 테스트 전용)
    pub detect_corruption: bool,

    /// 타이머 기반 재전송
    pub recover_from_loss: bool,

    /// 수신측 순서 밖 패킷 버퍼링. 끄면 Go-Back-N
    pub handle_reordering: bool,

    /// 흐름 제어 윈도우
    pub flow_control_window: WindowLimit,

    /// 중복 ACK 기반 빠른 재전송
    pub fast_retransmit: bool,

    /// 선택적 ACK 확장
    pub selective_ack: bool,

    /// RTT 기반 적응형 재전송 타임아웃
    pub adaptive_timeout: bool,
}

impl Policy {
    /// 모든 보장 활성화
    pub fn full(window: usize) -> Self {
        Self {
            detect_corruption: true,
            recover_from_loss: true,
            handle_reordering: true,
            flow_control_window: WindowLimit::Bounded(window),
            fast_retransmit: true,
            selective_ack: true,
            adaptive_timeout: true,
        }
    }

    /// 번호가 매겨진 체크포인트 단계를 플래그 조합으로 변환
    ///
    /// - 0, 1: 체크섬만
    /// - 2: + 손실 복구
    /// - 3: + 순서 재정렬
    /// - 4: + 윈도우 흐름 제어
    /// - 5 이상: + 빠른 재전송, 선택적 ACK, 적응형 타임아웃
    pub fn checkpoint(level: u8, window: usize) -> Self {
        Self {
            detect_corruption: true,
            recover_from_loss: level >= 2,
            handle_reordering: level >= 3,
            flow_control_window: if level >= 4 {
                WindowLimit::Bounded(window)
            } else {
                WindowLimit::Unbounded
            },
            fast_retransmit: level >= 5,
            selective_ack: level >= 5,
            adaptive_timeout: level >= 5,
        }
    }

    /// 적용 윈도우 크기
    pub fn window_size(&self) -> usize {
        self.flow_control_window.size()
    }

    /// 재전송 시 해당 패킷만 다시 보내는지 (아니면 Go-Back-N)
    pub fn selective_retransmit(&self) -> bool {
        self.handle_reordering
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::full(DEFAULT_WINDOW)
    }
}

/// 기본 윈도우 크기 (패킷 수)
pub const DEFAULT_WINDOW: usize = 32;

/// rUDP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 체크포인트 정책
    pub policy: Policy,

    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 재전송 타임아웃 (밀리초)
    /// 적응형이면 첫 RTT 샘플 전까지의 초기값
    pub rto_ms: u64,

    /// 적응형 RTO 하한 (밀리초)
    pub min_rto_ms: u64,

    /// RTO 상한 (밀리초)
    pub max_rto_ms: u64,

    /// 패킷당 최대 재전송 횟수
    pub max_retries: u32,

    /// 빠른 재전송을 일으키는 중복 ACK 수
    pub dup_ack_threshold: u32,

    /// 타이머가 없을 때 수신 대기 간격 (밀리초)
    pub poll_interval_ms: u64,

    /// 아무 패킷도 오지 않을 때 세션 포기까지 (밀리초)
    pub idle_timeout_ms: u64,

    /// 수신측 FIN 이후 재전송된 FIN에 응답하며 머무는 시간 (밀리초)
    pub linger_ms: u64,

    /// 손상 패킷 수신 시 마지막 ACK 재전송
    pub reack_on_corrupt: bool,

    /// 애플리케이션 전달 큐 크기 (페이로드 수)
    pub delivery_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            rto_ms: 500,             // 500ms
            min_rto_ms: 100,         // 100ms
            max_rto_ms: 5000,        // 5초
            max_retries: 10,
            dup_ack_threshold: 3,
            poll_interval_ms: 10,    // 10ms
            idle_timeout_ms: 10_000, // 10초
            linger_ms: 1000,
            reack_on_corrupt: false,
            delivery_queue: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 체크포인트 단계용 설정
    pub fn checkpoint(level: u8, window: usize) -> Self {
        Self {
            policy: Policy::checkpoint(level, window),
            ..Self::default()
        }
    }

    /// 저지연 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            rto_ms: 100,
            min_rto_ms: 20,
            max_rto_ms: 1000,
            poll_interval_ms: 5,
            ..Self::default()
        }
    }

    /// 손실이 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            policy: Policy::full(16),
            rto_ms: 800,
            min_rto_ms: 200,
            max_rto_ms: 10_000,
            max_retries: 20,
            dup_ack_threshold: 2,
            reack_on_corrupt: true,
            ..Self::default()
        }
    }

    /// 윈도우 크기 변경
    pub fn with_window(mut self, window: usize) -> Self {
        self.policy.flow_control_window = WindowLimit::Bounded(window);
        self
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_PAYLOAD {
            return Err(Error::InvalidConfig(format!(
                "chunk_size는 1..={} 범위여야 함: {}",
                MAX_PAYLOAD, self.chunk_size
            )));
        }
        if let WindowLimit::Bounded(n) = self.policy.flow_control_window {
            if n == 0 || n > MAX_WINDOW {
                return Err(Error::InvalidConfig(format!(
                    "window는 1..={} 범위여야 함: {}",
                    MAX_WINDOW, n
                )));
            }
        }
        if self.rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(Error::InvalidConfig(format!(
                "RTO 범위 오류: rto={}ms, min={}ms, max={}ms",
                self.rto_ms, self.min_rto_ms, self.max_rto_ms
            )));
        }
        if self.policy.fast_retransmit && self.dup_ack_threshold == 0 {
            return Err(Error::InvalidConfig("dup_ack_threshold는 1 이상이어야 함".into()));
        }
        if self.delivery_queue == 0 {
            return Err(Error::InvalidConfig("delivery_queue는 1 이상이어야 함".into()));
        }
        Ok(())
    }

    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    pub fn min_rto(&self) -> Duration {
        Duration::from_millis(self.min_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_levels_are_cumulative() {
        let p1 = Policy::checkpoint(1, 8);
        assert!(p1.detect_corruption);
        assert!(!p1.recover_from_loss);
        assert_eq!(p1.flow_control_window, WindowLimit::Unbounded);

        let p3 = Policy::checkpoint(3, 8);
        assert!(p3.recover_from_loss && p3.handle_reordering);
        assert!(!p3.fast_retransmit);

        let p4 = Policy::checkpoint(4, 8);
        assert_eq!(p4.window_size(), 8);

        let p5 = Policy::checkpoint(5, 8);
        assert_eq!(p5, Policy::full(8));
    }

    #[test]
    fn test_unbounded_window_is_capped() {
        assert_eq!(WindowLimit::Unbounded.size(), MAX_WINDOW);
        assert_eq!(WindowLimit::Bounded(0).size(), 1);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::lan().validate().is_ok());
        assert!(Config::lossy_network().validate().is_ok());

        let bad_chunk = Config {
            chunk_size: MAX_PAYLOAD + 1,
            ..Config::default()
        };
        assert!(matches!(bad_chunk.validate(), Err(Error::InvalidConfig(_))));

        let bad_window = Config::default().with_window(0);
        assert!(bad_window.validate().is_err());

        let bad_rto = Config {
            min_rto_ms: 10_000,
            max_rto_ms: 100,
            ..Config::default()
        };
        assert!(bad_rto.validate().is_err());
    }
}
