//! 메시지 큐 -- 룰셋 앞단의 비동기 큐 협력자
//!
//! 큐의 실제 의미론(영속화, 재시도 등)은 협력자의 몫이고, 수집 코어는
//! [`MsgQueue`] trait을 통해 최소 한 번(at-least-once) 전달만 보장합니다.
//! 기본 구현 [`ChannelQueue`]는 `tokio::mpsc` 채널 기반입니다.
//!
//! 룰셋에 전용 큐가 없으면 공유 메인 큐를 사용합니다. 메인 큐는 여러
//! 룰셋의 메시지가 섞이므로, 디스패처가 만드는 배치는 다중 룰셋 분할
//! 경로를 탈 수 있습니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use logport_core::error::QueueError;
use logport_core::pipeline::BoxFuture;
use logport_core::types::FlowClass;

use crate::batch::{Batch, BatchElem, process_batch};
use crate::ruleset::Ruleset;

/// 메시지 큐 trait
///
/// `enqueue`는 수신 경로(세션)에서, `dequeue_batch`는 디스패처에서
/// 호출됩니다. `close` 이후에도 이미 들어간 요소는 모두 드레인됩니다.
pub trait MsgQueue: Send + Sync {
    /// 큐 이름 (로그 식별용)
    fn name(&self) -> &str;

    /// 요소를 큐에 넣습니다.
    ///
    /// 흐름 제어 등급이 `LightDelay`인 요소는 자리가 날 때까지 기다릴 수
    /// 있고, `NoDelay` 요소는 큐가 가득 차면 드롭됩니다 (드롭은 내부에서
    /// 집계되며 에러가 아닙니다).
    fn enqueue(&self, elem: BatchElem) -> BoxFuture<'_, Result<(), QueueError>>;

    /// 요소가 들어올 때까지 기다렸다가 준비된 요소를 최대 `max`개까지
    /// 모아 반환합니다. 큐가 닫히고 비었으면 `None`입니다.
    fn dequeue_batch(&self, max: usize) -> BoxFuture<'_, Option<Vec<BatchElem>>>;

    /// 큐를 닫습니다. 이후 `enqueue`는 거부되지만 남은 요소는 드레인됩니다.
    fn close(&self);

    /// 현재 큐 길이
    fn len(&self) -> usize;

    /// 큐가 비어 있는지 확인합니다.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// mpsc 채널 기반 큐
pub struct ChannelQueue {
    name: String,
    capacity: usize,
    tx: mpsc::Sender<BatchElem>,
    rx: tokio::sync::Mutex<mpsc::Receiver<BatchElem>>,
    depth: AtomicUsize,
    dropped: AtomicU64,
    closed: CancellationToken,
    last_drop_warn: std::sync::Mutex<Option<Instant>>,
}

impl ChannelQueue {
    /// 지정된 용량의 채널 큐를 생성합니다.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            closed: CancellationToken::new(),
            last_drop_warn: std::sync::Mutex::new(None),
        }
    }

    /// 지금까지 드롭된 요소 수
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 드롭 경고를 초당 한 번으로 제한해 남깁니다.
    fn note_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_drop_warn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        if last.is_none_or(|t| now.duration_since(t) >= Duration::from_secs(1)) {
            *last = Some(now);
            tracing::warn!(
                queue = %self.name,
                capacity = self.capacity,
                dropped = self.dropped.load(Ordering::Relaxed),
                "queue full, dropping non-delayable message"
            );
        }
    }
}

impl MsgQueue for ChannelQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, elem: BatchElem) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            if self.closed.is_cancelled() {
                return Err(QueueError::Closed {
                    name: self.name.clone(),
                });
            }
            match elem.msg.flow {
                FlowClass::LightDelay => {
                    // 지연 허용 메시지는 자리가 날 때까지 송신측을 막는다
                    self.tx
                        .send(elem)
                        .await
                        .map_err(|_| QueueError::Closed {
                            name: self.name.clone(),
                        })?;
                    self.depth.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                FlowClass::NoDelay => match self.tx.try_send(elem) {
                    Ok(()) => {
                        self.depth.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.note_drop();
                        Ok(())
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed {
                        name: self.name.clone(),
                    }),
                },
            }
        })
    }

    fn dequeue_batch(&self, max: usize) -> BoxFuture<'_, Option<Vec<BatchElem>>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            let mut batch = Vec::new();

            if !self.closed.is_cancelled() {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(elem) => {
                            self.depth.fetch_sub(1, Ordering::Relaxed);
                            batch.push(elem);
                        }
                        None => return None,
                    },
                    () = self.closed.cancelled() => {}
                }
            }

            // 준비된 요소를 최대 크기까지 그리디하게 수집
            while batch.len() < max {
                match rx.try_recv() {
                    Ok(elem) => {
                        self.depth.fetch_sub(1, Ordering::Relaxed);
                        batch.push(elem);
                    }
                    Err(_) => break,
                }
            }

            if batch.is_empty() { None } else { Some(batch) }
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// 큐 디스패처 -- 큐에서 배치를 꺼내 배치 라우터로 밀어 넣는 태스크
///
/// 큐 하나당 디스패처 하나가 돌며, 큐가 닫히고 비워지면 종료합니다.
pub struct QueueDispatcher {
    queue: Arc<dyn MsgQueue>,
    default_ruleset: Arc<Ruleset>,
    batch_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl QueueDispatcher {
    /// 새 디스패처를 생성합니다.
    pub fn new(
        queue: Arc<dyn MsgQueue>,
        default_ruleset: Arc<Ruleset>,
        batch_size: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            default_ruleset,
            batch_size: batch_size.max(1),
            shutdown,
        }
    }

    /// 디스패처 태스크를 스폰합니다.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::debug!(queue = self.queue.name(), "queue dispatcher started");
        while let Some(elems) = self.queue.dequeue_batch(self.batch_size).await {
            let mut batch = Batch::from_elems(elems, Arc::clone(&self.shutdown));
            match process_batch(&mut batch, &self.default_ruleset).await {
                Ok(outcome) => {
                    tracing::trace!(queue = self.queue.name(), ?outcome, "batch processed");
                }
                Err(e) => {
                    tracing::warn!(queue = self.queue.name(), error = %e, "batch dispatch failed");
                }
            }
        }
        tracing::debug!(queue = self.queue.name(), "queue dispatcher stopped");
    }
}
