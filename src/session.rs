//! 비동기 세션
//!
//! 엔진을 `parking_lot::Mutex`로 감싸 공유하고, 구동 태스크 하나가
//! 데이터그램 수신, 타이머 만료, outbox 전송을 담당한다.
//!
//! - 수신 처리가 타이머보다 먼저 (`select!` biased): 같은 순간이면 ACK가 이긴다
//! - 잠금은 await 전에 항상 해제

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::receiver::ReceiverEngine;
use crate::sender::SenderEngine;
use crate::state::SessionState;
use crate::stats::TransferStats;
use crate::transport::Transport;
use crate::{Config, Error, Result};

struct SenderShared<T> {
    engine: Mutex<SenderEngine>,
    transport: T,
    config: Config,
    /// 엔진 상태가 바뀔 때마다 (애플리케이션 대기 해제)
    progress: Notify,
    /// 애플리케이션이 새 데이터를 넣었을 때 (구동 태스크 깨움)
    wake: Notify,
    terminated: AtomicBool,
}

/// 송신 세션
pub struct SenderSession<T: Transport> {
    shared: Arc<SenderShared<T>>,
    driver: Option<JoinHandle<Result<()>>>,
}

impl<T: Transport> SenderSession<T> {
    /// SYN 교환까지 마친 세션 생성
    pub async fn connect(transport: T, config: Config) -> Result<Self> {
        let mut engine = SenderEngine::new(config.clone())?;
        engine.connect(Instant::now())?;

        let shared = Arc::new(SenderShared {
            engine: Mutex::new(engine),
            transport,
            config,
            progress: Notify::new(),
            wake: Notify::new(),
            terminated: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive_sender(Arc::clone(&shared)));

        let mut session = Self {
            shared,
            driver: Some(driver),
        };
        session
            .wait_for(|engine| engine.state() != SessionState::SynSent)
            .await?;
        info!("송신 세션 수립");
        Ok(session)
    }

    /// 데이터 전송. 윈도우에 여유가 생길 때까지 기다린다.
    ///
    /// 취소해도 안전하다 (대기 중 취소되면 아무것도 제출되지 않음).
    pub async fn send(&mut self, data: Bytes) -> Result<usize> {
        self.wait_for(|engine| engine.has_capacity()).await?;
        let count = self.shared.engine.lock().submit(data, Instant::now())?;
        self.shared.wake.notify_one();
        Ok(count)
    }

    /// 기다리지 않는 전송. 여유가 없으면 [`Error::WindowFull`].
    pub fn try_send(&self, data: Bytes) -> Result<usize> {
        let count = self.shared.engine.lock().try_submit(data, Instant::now())?;
        self.shared.wake.notify_one();
        Ok(count)
    }

    /// 보낸 데이터가 전부 확인될 때까지 대기
    pub async fn flush(&mut self) -> Result<()> {
        self.wait_for(|engine| engine.is_idle()).await
    }

    /// FIN 교환으로 종료하고 최종 통계 반환
    pub async fn close(mut self) -> Result<TransferStats> {
        self.shared.engine.lock().close(Instant::now())?;
        self.shared.wake.notify_one();
        self.wait_for(|engine| engine.is_finished()).await?;
        self.join_driver().await?;

        let stats = self.stats();
        info!("송신 세션 종료: {}", stats.summary());
        Ok(stats)
    }

    pub fn stats(&self) -> TransferStats {
        self.shared.engine.lock().stats()
    }

    pub fn state(&self) -> SessionState {
        self.shared.engine.lock().state()
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    async fn wait_for<F>(&mut self, mut ready: F) -> Result<()>
    where
        F: FnMut(&SenderEngine) -> bool,
    {
        let shared = Arc::clone(&self.shared);
        loop {
            // 상태 확인 전에 만들어야 그 사이의 알림을 놓치지 않음
            let notified = shared.progress.notified();
            {
                let engine = shared.engine.lock();
                engine.check_alive()?;
                if ready(&*engine) {
                    return Ok(());
                }
            }
            if shared.terminated.load(Ordering::SeqCst) {
                self.join_driver().await?;
                return Err(Error::ConnectionClosed);
            }
            notified.await;
        }
    }

    async fn join_driver(&mut self) -> Result<()> {
        match self.driver.take() {
            Some(handle) => join(handle).await,
            None => Ok(()),
        }
    }
}

impl<T: Transport> Drop for SenderSession<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

async fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))),
    }
}

async fn drive_sender<T: Transport>(shared: Arc<SenderShared<T>>) -> Result<()> {
    let result = sender_loop(&shared).await;
    if let Err(e) = &result {
        warn!("송신 세션 중단: {}", e);
    }
    shared.terminated.store(true, Ordering::SeqCst);
    shared.progress.notify_waiters();
    result
}

async fn sender_loop<T: Transport>(shared: &SenderShared<T>) -> Result<()> {
    let poll_interval = shared.config.poll_interval();
    loop {
        let (datagrams, deadline, done) = {
            let mut engine = shared.engine.lock();
            (
                engine.drain_transmits(),
                engine.poll_timeout(),
                engine.state().is_terminal(),
            )
        };
        for datagram in &datagrams {
            // 유실과 같게 취급, 재전송 타이머가 복구
            if let Err(e) = shared.transport.send_datagram(datagram).await {
                debug!("데이터그램 전송 실패: {}", e);
            }
        }
        if done {
            return shared.engine.lock().check_alive();
        }

        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => poll_interval,
        };

        tokio::select! {
            biased;
            received = shared.transport.recv_datagram(wait) => {
                if let Some(datagram) = received? {
                    shared.engine.lock().on_datagram(&datagram, Instant::now());
                }
            }
            _ = shared.wake.notified() => {}
        }

        let expired = shared.engine.lock().handle_timeout(Instant::now());
        shared.progress.notify_waiters();
        expired?;
    }
}

struct ReceiverShared<T> {
    engine: Mutex<ReceiverEngine>,
    transport: T,
    config: Config,
    progress: Notify,
    terminated: AtomicBool,
}

/// 수신 세션
pub struct ReceiverSession<T: Transport> {
    shared: Arc<ReceiverShared<T>>,
    deliveries: mpsc::Receiver<Bytes>,
    driver: Option<JoinHandle<Result<()>>>,
}

impl<T: Transport> ReceiverSession<T> {
    /// SYN을 받을 때까지 대기
    pub async fn accept(transport: T, config: Config) -> Result<Self> {
        let engine = ReceiverEngine::new(config.clone())?;
        let (tx, rx) = mpsc::channel(config.delivery_queue);

        let shared = Arc::new(ReceiverShared {
            engine: Mutex::new(engine),
            transport,
            config,
            progress: Notify::new(),
            terminated: AtomicBool::new(false),
        });
        let driver = tokio::spawn(drive_receiver(Arc::clone(&shared), tx));

        let mut session = Self {
            shared,
            deliveries: rx,
            driver: Some(driver),
        };

        let shared = Arc::clone(&session.shared);
        loop {
            let notified = shared.progress.notified();
            if shared.engine.lock().state() != SessionState::Listen {
                break;
            }
            if shared.terminated.load(Ordering::SeqCst) {
                session.join_driver().await?;
                return Err(Error::ConnectionClosed);
            }
            notified.await;
        }
        info!("수신 세션 수립");
        Ok(session)
    }

    /// 다음 페이로드. 상대가 정상 종료하면 `Ok(None)`.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        if let Some(payload) = self.deliveries.recv().await {
            return Ok(Some(payload));
        }
        if self.shared.engine.lock().is_finished() {
            return Ok(None);
        }
        self.join_driver().await?;
        Err(Error::ConnectionClosed)
    }

    /// 스트림 끝까지 받아 이어 붙임
    pub async fn recv_all(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(payload) = self.recv().await? {
            data.extend_from_slice(&payload);
        }
        Ok(data)
    }

    /// 세션 종료. 스트림이 끝났으면 FIN 재전송 응답 대기 시간까지 기다린다.
    pub async fn close(mut self) -> Result<TransferStats> {
        let finished = self.shared.engine.lock().is_finished();
        if finished {
            self.join_driver().await?;
        } else if let Some(handle) = self.driver.take() {
            debug!("스트림 종료 전 수신 세션 닫음");
            handle.abort();
        }
        let stats = self.stats();
        info!("수신 세션 종료: {}", stats.summary());
        Ok(stats)
    }

    pub fn stats(&self) -> TransferStats {
        self.shared.engine.lock().stats()
    }

    pub fn state(&self) -> SessionState {
        self.shared.engine.lock().state()
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    async fn join_driver(&mut self) -> Result<()> {
        match self.driver.take() {
            Some(handle) => join(handle).await,
            None => Ok(()),
        }
    }
}

impl<T: Transport> Drop for ReceiverSession<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
        }
    }
}

async fn drive_receiver<T: Transport>(
    shared: Arc<ReceiverShared<T>>,
    tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let result = receiver_loop(&shared, tx).await;
    if let Err(e) = &result {
        warn!("수신 세션 중단: {}", e);
    }
    shared.terminated.store(true, Ordering::SeqCst);
    shared.progress.notify_waiters();
    result
}

async fn receiver_loop<T: Transport>(
    shared: &ReceiverShared<T>,
    tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let idle_timeout = shared.config.idle_timeout();
    let mut tx = Some(tx);
    let mut linger_until: Option<Instant> = None;
    let mut last_activity = Instant::now();

    loop {
        let now = Instant::now();
        let wait = match linger_until {
            Some(until) if now >= until => return Ok(()),
            Some(until) => until - now,
            None => idle_timeout,
        };

        let Some(datagram) = shared.transport.recv_datagram(wait).await? else {
            let established = shared.engine.lock().state() == SessionState::Established;
            if linger_until.is_none() && established && last_activity.elapsed() >= idle_timeout {
                warn!("수신 대기 시간 초과: {:?}", idle_timeout);
                return Err(Error::Timeout);
            }
            continue;
        };
        last_activity = Instant::now();

        let (acks, delivered, state) = {
            let mut engine = shared.engine.lock();
            engine.on_datagram(&datagram);
            (
                engine.drain_transmits(),
                engine.drain_delivered(),
                engine.state(),
            )
        };
        for ack in &acks {
            if let Err(e) = shared.transport.send_datagram(ack).await {
                debug!("ACK 전송 실패: {}", e);
            }
        }
        shared.progress.notify_waiters();

        if let Some(sender) = &tx {
            for payload in delivered {
                if sender.send(payload).await.is_err() {
                    debug!("애플리케이션이 수신을 멈춤, 페이로드 폐기");
                }
            }
        }

        if state == SessionState::Closed && linger_until.is_none() {
            // 채널을 닫아 recv가 끝을 보게 함
            tx = None;
            linger_until = Some(Instant::now() + shared.config.linger());
            info!("스트림 수신 완료, {:?} 동안 FIN 재전송 응답", shared.config.linger());
        }
    }
}
