//! 데이터그램 전송 계층
//!
//! 엔진은 전송 계층을 모른다. 세션이 [`Transport`]를 통해 데이터그램을 주고받는다.
//!
//! - [`UdpTransport`]: 실제 UDP 소켓
//! - [`MemoryTransport`]: 프로세스 내 채널 쌍 (테스트용)
//! - [`LossyTransport`]: 손실/중복/손상/지연을 주입하는 래퍼

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::packet::Packet;
use crate::{Error, Result};

/// 수신 버퍼 크기 (UDP 최대 페이로드)
const RECV_BUFFER_SIZE: usize = 65535;

/// 신뢰성 없는 데이터그램 채널
///
/// `recv_datagram`의 타임아웃은 에러가 아니라 `Ok(None)`이다.
pub trait Transport: Send + Sync + 'static {
    /// 데이터그램 하나 전송 (도착 보장 없음)
    fn send_datagram(&self, buf: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// 최대 `timeout` 동안 데이터그램 하나 수신
    fn recv_datagram(&self, timeout: Duration)
        -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// UDP 소켓 전송
///
/// 상대 주소를 모르고 시작하면 첫 데이터그램의 발신지를 상대로 고정한다.
/// 이후 다른 주소에서 온 데이터그램은 무시한다.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl UdpTransport {
    /// 수신측: 로컬 주소에 바인딩하고 첫 송신자를 기다림
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        info!("UDP 바인딩: {}", socket.local_addr()?);
        Ok(Self {
            socket,
            peer: Mutex::new(None),
        })
    }

    /// 송신측: 상대 주소 고정
    pub async fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        debug!("UDP 바인딩: {} → {}", socket.local_addr()?, peer);
        Ok(Self {
            socket,
            peer: Mutex::new(Some(peer)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }
}

impl Transport for UdpTransport {
    async fn send_datagram(&self, buf: &[u8]) -> Result<()> {
        let peer = *self.peer.lock();
        let Some(peer) = peer else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "상대 주소를 아직 모름",
            )));
        };
        self.socket.send_to(buf, peer).await?;
        Ok(())
    }

    async fn recv_datagram(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, from) = match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await
        {
            Ok(result) => result?,
            Err(_) => return Ok(None),
        };

        {
            let mut peer = self.peer.lock();
            match *peer {
                None => {
                    info!("상대 주소 확정: {}", from);
                    *peer = Some(from);
                }
                Some(addr) if addr != from => {
                    debug!("알 수 없는 발신지 무시: {}", from);
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        buf.truncate(len);
        Ok(Some(Bytes::from(buf)))
    }
}

/// 프로세스 내 데이터그램 채널의 한쪽 끝
///
/// 상대가 사라지면 보내는 데이터그램은 조용히 버려진다.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MemoryTransport {
    /// 서로 연결된 양 끝 생성
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(a_rx),
            },
        )
    }
}

impl Transport for MemoryTransport {
    async fn send_datagram(&self, buf: &[u8]) -> Result<()> {
        if self.tx.send(Bytes::copy_from_slice(buf)).is_err() {
            trace!("상대 없음, 데이터그램 폐기");
        }
        Ok(())
    }

    async fn recv_datagram(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => {
                // 채널이 닫혀도 UDP처럼 타임아웃까지 기다림
                drop(rx);
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }
}

/// 결함 주입 설정 (한 방향)
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// 손실 확률 (0.0 ~ 1.0)
    pub loss_rate: f64,

    /// N번째 DATA 패킷마다 버림 (SYN/FIN/ACK는 세지 않음)
    pub drop_every_nth: Option<u64>,

    /// 중복 확률
    pub duplicate_rate: f64,

    /// 임의 비트 하나를 뒤집을 확률
    pub corrupt_rate: f64,

    /// 고정 지연 (밀리초)
    pub delay_ms: u64,

    /// 지연 흔들림 ±(밀리초)
    pub jitter_ms: u64,
}

impl FaultConfig {
    /// 결함 없음
    pub fn none() -> Self {
        Self::default()
    }

    /// 확률적 손실
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::default()
        }
    }

    /// N번째 DATA 패킷마다 버림
    pub fn drop_every(n: u64) -> Self {
        Self {
            drop_every_nth: Some(n),
            ..Self::default()
        }
    }

    /// 지연 + 흔들림
    pub fn delayed(delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            delay_ms,
            jitter_ms,
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.loss_rate <= 0.0
            && self.drop_every_nth.unwrap_or(0) == 0
            && self.duplicate_rate <= 0.0
            && self.corrupt_rate <= 0.0
            && self.delay_ms == 0
            && self.jitter_ms == 0
    }

    /// `data_count`: DATA 패킷이면 이 방향에서 몇 번째인지
    fn decide(&self, rng: &mut StdRng, data_count: Option<u64>, len: usize) -> Fate {
        let nth = match (self.drop_every_nth, data_count) {
            (Some(n), Some(count)) => n > 0 && count % n == 0,
            _ => false,
        };
        if nth || chance(rng, self.loss_rate) {
            return Fate::Drop;
        }

        let copies = if chance(rng, self.duplicate_rate) { 2 } else { 1 };
        let flip_bit = if len > 0 && chance(rng, self.corrupt_rate) {
            Some(rng.gen_range(0..len * 8))
        } else {
            None
        };

        let mut delay_ms = self.delay_ms as i64;
        if self.jitter_ms > 0 {
            let jitter = self.jitter_ms as i64;
            delay_ms += rng.gen_range(-jitter..=jitter);
        }

        Fate::Deliver {
            copies,
            flip_bit,
            delay: Duration::from_millis(delay_ms.max(0) as u64),
        }
    }
}

fn chance(rng: &mut StdRng, rate: f64) -> bool {
    rate > 0.0 && rng.gen_bool(rate.min(1.0))
}

/// 데이터그램 하나의 운명
enum Fate {
    Drop,
    Deliver {
        copies: usize,
        flip_bit: Option<usize>,
        delay: Duration,
    },
}

struct FaultState {
    rng: StdRng,
    data_sent: u64,
    data_received: u64,
}

impl FaultState {
    fn count_data(counter: &mut u64, buf: &[u8]) -> Option<u64> {
        if !Packet::peek_is_data(buf) {
            return None;
        }
        *counter += 1;
        Some(*counter)
    }
}

/// 결함 주입 래퍼
///
/// 송신 방향은 손실, 중복, 손상, 지연을 모두 지원한다. 지연된 데이터그램은
/// 별도 태스크에서 보내므로 순서가 뒤바뀔 수 있다. 수신 방향은 손실과 손상만.
pub struct LossyTransport<T> {
    inner: Arc<T>,
    outbound: FaultConfig,
    inbound: FaultConfig,
    state: Mutex<FaultState>,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, outbound: FaultConfig, inbound: FaultConfig, seed: u64) -> Self {
        Self {
            inner: Arc::new(inner),
            outbound,
            inbound,
            state: Mutex::new(FaultState {
                rng: StdRng::seed_from_u64(seed),
                data_sent: 0,
                data_received: 0,
            }),
        }
    }
}

fn flip(buf: &[u8], bit: Option<usize>) -> Bytes {
    let mut data = buf.to_vec();
    if let Some(bit) = bit {
        data[bit / 8] ^= 1 << (bit % 8);
    }
    Bytes::from(data)
}

impl<T: Transport> Transport for LossyTransport<T> {
    async fn send_datagram(&self, buf: &[u8]) -> Result<()> {
        let fate = {
            let mut state = self.state.lock();
            let count = FaultState::count_data(&mut state.data_sent, buf);
            self.outbound.decide(&mut state.rng, count, buf.len())
        };

        let (copies, flip_bit, delay) = match fate {
            Fate::Drop => {
                trace!("송신 데이터그램 폐기 ({} bytes)", buf.len());
                return Ok(());
            }
            Fate::Deliver {
                copies,
                flip_bit,
                delay,
            } => (copies, flip_bit, delay),
        };

        let data = flip(buf, flip_bit);
        if delay.is_zero() {
            for _ in 0..copies {
                self.inner.send_datagram(&data).await?;
            }
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for _ in 0..copies {
                if let Err(e) = inner.send_datagram(&data).await {
                    debug!("지연 전송 실패: {}", e);
                }
            }
        });
        Ok(())
    }

    async fn recv_datagram(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let Some(datagram) = self.inner.recv_datagram(timeout).await? else {
            return Ok(None);
        };

        let fate = {
            let mut state = self.state.lock();
            let count = FaultState::count_data(&mut state.data_received, &datagram);
            self.inbound.decide(&mut state.rng, count, datagram.len())
        };

        match fate {
            Fate::Drop => {
                trace!("수신 데이터그램 폐기 ({} bytes)", datagram.len());
                Ok(None)
            }
            Fate::Deliver { flip_bit: None, .. } => Ok(Some(datagram)),
            Fate::Deliver { flip_bit, .. } => Ok(Some(flip(&datagram, flip_bit))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_memory_pair_roundtrip() {
        let (a, b) = MemoryTransport::pair();
        a.send_datagram(b"ping").await.unwrap();
        assert_eq!(b.recv_datagram(WAIT).await.unwrap().unwrap(), "ping");
        b.send_datagram(b"pong").await.unwrap();
        assert_eq!(a.recv_datagram(WAIT).await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_memory_timeout_is_none() {
        let (a, _b) = MemoryTransport::pair();
        assert!(a.recv_datagram(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_send_to_dropped_peer_is_silent() {
        let (a, b) = MemoryTransport::pair();
        drop(b);
        a.send_datagram(b"lost").await.unwrap();
        assert!(a.recv_datagram(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_udp_learns_peer() {
        let server = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpTransport::connect("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();

        assert!(server.send_datagram(b"early").await.is_err());

        client.send_datagram(b"hello").await.unwrap();
        let got = server.recv_datagram(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.unwrap(), "hello");
        assert_eq!(server.peer_addr(), Some(client.local_addr().unwrap()));

        server.send_datagram(b"world").await.unwrap();
        let got = client.recv_datagram(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.unwrap(), "world");
    }

    async fn recv_seqs(transport: &impl Transport) -> Vec<u32> {
        let mut seqs = Vec::new();
        while let Some(datagram) = transport.recv_datagram(Duration::from_millis(5)).await.unwrap() {
            seqs.push(Packet::decode(&datagram).unwrap().seq);
        }
        seqs
    }

    #[tokio::test]
    async fn test_drop_every_nth_counts_data_only() {
        let (a, b) = MemoryTransport::pair();
        let lossy = LossyTransport::new(a, FaultConfig::drop_every(2), FaultConfig::none(), 7);
        lossy.send_datagram(&Packet::syn(0).encode()).await.unwrap();
        for seq in 1..=4 {
            let packet = Packet::data(seq, Bytes::from_static(b"d"));
            lossy.send_datagram(&packet.encode()).await.unwrap();
        }
        lossy.send_datagram(&Packet::fin(5).encode()).await.unwrap();
        // SYN, FIN은 세지 않으므로 두 번째와 네 번째 데이터만 버려짐
        assert_eq!(recv_seqs(&b).await, vec![0, 1, 3, 5]);
    }

    #[tokio::test]
    async fn test_inbound_drop_skips_acks() {
        let (a, b) = MemoryTransport::pair();
        let lossy = LossyTransport::new(b, FaultConfig::none(), FaultConfig::drop_every(1), 8);
        a.send_datagram(&Packet::ack(10, 0, &[]).encode()).await.unwrap();
        a.send_datagram(&Packet::syn(9).encode()).await.unwrap();
        a.send_datagram(&Packet::data(11, Bytes::from_static(b"d")).encode())
            .await
            .unwrap();
        assert_eq!(recv_seqs(&lossy).await, vec![10, 9]);
        assert_eq!(lossy.state.lock().data_received, 1);
    }

    #[tokio::test]
    async fn test_corruption_flips_one_bit() {
        let (a, b) = MemoryTransport::pair();
        let outbound = FaultConfig {
            corrupt_rate: 1.0,
            ..FaultConfig::default()
        };
        let lossy = LossyTransport::new(a, outbound, FaultConfig::none(), 42);
        let original = [0u8; 16];
        lossy.send_datagram(&original).await.unwrap();
        let got = b.recv_datagram(WAIT).await.unwrap().unwrap();
        let flipped: u32 = got.iter().map(|b| b.count_ones()).sum();
        assert_eq!(flipped, 1);
    }

    #[tokio::test]
    async fn test_duplication() {
        let (a, b) = MemoryTransport::pair();
        let outbound = FaultConfig {
            duplicate_rate: 1.0,
            ..FaultConfig::default()
        };
        let lossy = LossyTransport::new(a, outbound, FaultConfig::none(), 1);
        lossy.send_datagram(b"x").await.unwrap();
        assert!(b.recv_datagram(WAIT).await.unwrap().is_some());
        assert!(b.recv_datagram(WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delayed_delivery() {
        let (a, b) = MemoryTransport::pair();
        let lossy = LossyTransport::new(a, FaultConfig::delayed(30, 0), FaultConfig::none(), 3);
        lossy.send_datagram(b"slow").await.unwrap();
        assert!(b.recv_datagram(Duration::from_millis(5)).await.unwrap().is_none());
        let got = b.recv_datagram(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.unwrap(), "slow");
    }

    #[tokio::test]
    async fn test_inbound_loss() {
        let (a, b) = MemoryTransport::pair();
        let lossy = LossyTransport::new(b, FaultConfig::none(), FaultConfig::lossy(1.0), 9);
        a.send_datagram(b"gone").await.unwrap();
        assert!(lossy.recv_datagram(WAIT).await.unwrap().is_none());
    }

    #[test]
    fn test_noop_detection() {
        assert!(FaultConfig::none().is_noop());
        assert!(FaultConfig::drop_every(0).is_noop());
        assert!(!FaultConfig::drop_every(3).is_noop());
        assert!(!FaultConfig::delayed(0, 5).is_noop());
    }
}
