//! 세션 상태

use std::fmt;

/// 세션 생명주기
///
/// ```text
/// 송신측: Closed ──connect──▶ SynSent ──SYN ACK──▶ Established ──close──▶ FinWait ──FIN ACK──▶ Closed
/// 수신측: Listen ──SYN──▶ Established ──FIN──▶ Closed
///                  재전송 한도 초과 ──▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// 세션 없음 (시작 전 또는 정상 종료 후)
    #[default]
    Closed,
    /// 수신측: SYN 대기
    Listen,
    /// 송신측: SYN 전송, ACK 대기
    SynSent,
    /// 데이터 전송 중
    Established,
    /// 송신측: FIN 대기열 투입, ACK 대기
    FinWait,
    /// 재전송 한도 초과로 세션 실패
    Failed,
}

impl SessionState {
    /// 더 이상 진행할 수 없는 상태인지
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "CLOSED",
            SessionState::Listen => "LISTEN",
            SessionState::SynSent => "SYN_SENT",
            SessionState::Established => "ESTABLISHED",
            SessionState::FinWait => "FIN_WAIT",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
