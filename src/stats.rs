//! 전송 통계

use std::time::{Duration, Instant};

/// 세션별 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 보낸 데이터그램 수 (재전송, ACK 포함)
    pub datagrams_sent: u64,

    /// 받은 데이터그램 수
    pub datagrams_received: u64,

    /// 처음 전송된 데이터 패킷 수
    pub data_packets_sent: u64,

    /// 재전송 수 (타임아웃 + 빠른 재전송)
    pub retransmissions: u64,

    /// 빠른 재전송 수
    pub fast_retransmits: u64,

    /// 타이머 만료 수
    pub timeouts: u64,

    /// 수신한 유효 ACK 수
    pub acks_received: u64,

    /// 중복 ACK 수
    pub duplicate_acks: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 체크섬 불일치로 버린 패킷 수
    pub corrupt_dropped: u64,

    /// 중복으로 버린 데이터 패킷 수
    pub duplicates_dropped: u64,

    /// 순서 밖으로 버린 패킷 수 (재정렬 비활성)
    pub out_of_order_dropped: u64,

    /// 수신 윈도우를 넘어 버린 패킷 수
    pub overflow_dropped: u64,

    /// 애플리케이션에 전달된 바이트
    pub bytes_delivered: u64,

    /// 애플리케이션이 제출한 바이트
    pub bytes_submitted: u64,

    /// 최근 평활 RTT
    pub srtt: Option<Duration>,

    /// 현재 RTO
    pub rto: Option<Duration>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            datagrams_sent: 0,
            datagrams_received: 0,
            data_packets_sent: 0,
            retransmissions: 0,
            fast_retransmits: 0,
            timeouts: 0,
            acks_received: 0,
            duplicate_acks: 0,
            acks_sent: 0,
            corrupt_dropped: 0,
            duplicates_dropped: 0,
            out_of_order_dropped: 0,
            overflow_dropped: 0,
            bytes_delivered: 0,
            bytes_submitted: 0,
            srtt: None,
            rto: None,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율 (재전송 / 첫 전송)
    pub fn retransmit_ratio(&self) -> f64 {
        if self.data_packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.data_packets_sent as f64
    }

    /// 실효 처리율 (bytes/sec, 전달 또는 제출 바이트 중 큰 쪽)
    pub fn goodput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_delivered.max(self.bytes_submitted) as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Goodput: {:.1} KB/s | Sent: {} | Retx: {} ({} fast, {:.1}%) | ACKs: {}/{} dup | Dropped: {} corrupt, {} dup, {} ooo, {} overflow | Delivered: {} B | RTT: {}",
            self.elapsed().as_secs_f64(),
            self.goodput() / 1024.0,
            self.datagrams_sent,
            self.retransmissions,
            self.fast_retransmits,
            self.retransmit_ratio() * 100.0,
            self.acks_received,
            self.duplicate_acks,
            self.corrupt_dropped,
            self.duplicates_dropped,
            self.out_of_order_dropped,
            self.overflow_dropped,
            self.bytes_delivered,
            self.srtt
                .map(|d| format!("{:.2}ms", d.as_secs_f64() * 1000.0))
                .unwrap_or_else(|| "-".into()),
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
