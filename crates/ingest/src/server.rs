//! TCP 서버 -- 리스닝 소켓, 세션 테이블, 수락 루프
//!
//! 모듈 인스턴스당 서버는 하나입니다. 리스너 스펙은
//! [`configure_listen`](TcpServer::configure_listen)으로 쌓이고,
//! [`open_listen_sockets`](TcpServer::open_listen_sockets)이 권한 강하
//! 이전에 모든 소켓을 바인드합니다.
//!
//! 수락 정책: 세션 수가 상한에 도달하면 새 스트림은 세션 생성 없이 즉시
//! 닫히고, 경고는 로그 폭주를 막기 위해 초당 한 번으로 제한됩니다.
//!
//! 서버의 동작(수락 필터, 메시지 제출, 종료 통지)은 생성 시점에 전달되는
//! [`ServerHooks`] 레코드로 고정됩니다. 실행 중에 바뀌는 콜백은 없습니다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use logport_core::error::QueueError;
use logport_core::pipeline::BoxFuture;
use logport_core::types::{CloseReason, FlowClass};

use crate::batch::BatchElem;
use crate::error::IngestError;
use crate::framing::FramingPolicy;
use crate::ruleset::Ruleset;
use crate::session::{PeerInfo, Session};
use crate::stream::StreamDriver;

/// 피어 FQDN 해석 협력자
pub type FqdnResolver = Arc<dyn Fn(std::net::IpAddr) -> Option<String> + Send + Sync>;

/// 서버 동작을 고정하는 훅 레코드
///
/// 수락 필터(ACL), 메시지 제출(큐), 세션 종료 통지를 하나의 capability
/// 레코드로 묶어 서버 생성 시점에 전달합니다.
pub trait ServerHooks: Send + Sync {
    /// 수락 필터. `false`면 세션 생성 없이 연결을 닫습니다.
    ///
    /// 평문 연결은 수락 직후 한 번, TLS 연결은 핸드셰이크 후 검증된 피어
    /// 이름이 채워진 상태로 한 번 더 호출됩니다.
    fn accept_allowed(&self, peer: &PeerInfo) -> bool;

    /// 완성된 메시지를 큐로 제출합니다.
    fn submit(&self, elem: BatchElem) -> BoxFuture<'_, Result<(), QueueError>>;

    /// 세션 종료 통지. 설정에 따라 합성 메시지를 주입할 수 있습니다.
    fn session_closed<'a>(
        &'a self,
        peer: &'a PeerInfo,
        input_name: &'a str,
        ruleset: &'a Arc<Ruleset>,
        reason: CloseReason,
    ) -> BoxFuture<'a, ()>;
}

/// 서버 실행 스냅샷 설정
#[derive(Clone)]
pub struct ServerConfig {
    /// 동시 세션 상한
    pub max_sessions: usize,
    /// 리스너 상한
    pub max_listeners: usize,
    /// 수락된 스트림에 TCP keep-alive 설정
    pub keep_alive: bool,
    /// keep-alive 미사용 시 유휴 세션 정리 시간 (`None`이면 없음)
    pub idle_timeout: Option<Duration>,
    /// 리스너 공통 프레이밍 정책 (인스턴스별 octet 허용 여부는 스펙에서 덮어씀)
    pub base_framing: FramingPolicy,
    /// 수신 메시지의 흐름 제어 등급
    pub flow: FlowClass,
    /// 피어 FQDN 해석기 (없으면 FQDN 없이 진행)
    pub fqdn_resolver: Option<FqdnResolver>,
}

/// 대기 중인 리스너 스펙
struct ListenerSpec {
    bind_addr: String,
    support_octet_framing: bool,
    ruleset: Arc<Ruleset>,
    input_name: String,
}

/// 바인드된 리스너
struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    spec: ListenerSpec,
}

/// 단일 TCP 서버
pub struct TcpServer {
    cfg: ServerConfig,
    driver: Arc<StreamDriver>,
    hooks: Arc<dyn ServerHooks>,
    specs: Vec<ListenerSpec>,
    listeners: Vec<Listener>,
    bound_addrs: Vec<SocketAddr>,
    session_permits: Arc<Semaphore>,
    session_count: Arc<AtomicUsize>,
    sessions: TaskTracker,
    accept_tasks: Vec<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
    last_cap_warn: Arc<std::sync::Mutex<Option<Instant>>>,
    ready: bool,
}

impl TcpServer {
    /// 새 서버를 생성합니다. 훅 레코드는 이후 변경되지 않습니다.
    pub fn new(cfg: ServerConfig, driver: Arc<StreamDriver>, hooks: Arc<dyn ServerHooks>) -> Self {
        let session_permits = Arc::new(Semaphore::new(cfg.max_sessions));
        Self {
            cfg,
            driver,
            hooks,
            specs: Vec::new(),
            listeners: Vec::new(),
            bound_addrs: Vec::new(),
            session_permits,
            session_count: Arc::new(AtomicUsize::new(0)),
            sessions: TaskTracker::new(),
            accept_tasks: Vec::new(),
            cancel: CancellationToken::new(),
            last_cap_warn: Arc::new(std::sync::Mutex::new(None)),
            ready: false,
        }
    }

    /// 리스너 스펙을 추가합니다. 소켓은 아직 열리지 않습니다.
    pub fn configure_listen(
        &mut self,
        bind_addr: impl Into<String>,
        support_octet_framing: bool,
        ruleset: Arc<Ruleset>,
        input_name: impl Into<String>,
    ) {
        self.specs.push(ListenerSpec {
            bind_addr: bind_addr.into(),
            support_octet_framing,
            ruleset,
            input_name: input_name.into(),
        });
    }

    /// 대기 중인 모든 스펙을 바인드합니다.
    ///
    /// 권한 강하 이전에 호출되어야 합니다. 리스너 상한을 넘는 스펙은
    /// 경고와 함께 무시됩니다.
    pub async fn open_listen_sockets(&mut self) -> Result<(), IngestError> {
        let specs: Vec<ListenerSpec> = self.specs.drain(..).collect();
        for (i, spec) in specs.into_iter().enumerate() {
            if i >= self.cfg.max_listeners {
                tracing::warn!(
                    addr = %spec.bind_addr,
                    max = self.cfg.max_listeners,
                    "listener limit reached, ignoring listener"
                );
                continue;
            }
            let socket = self
                .driver
                .open_listener(&spec.bind_addr)
                .await
                .map_err(|e| IngestError::Listener {
                    addr: spec.bind_addr.clone(),
                    reason: e.to_string(),
                })?;
            let local_addr = socket.local_addr().map_err(|e| IngestError::Listener {
                addr: spec.bind_addr.clone(),
                reason: e.to_string(),
            })?;
            tracing::info!(addr = %local_addr, input = %spec.input_name, "listening");
            self.bound_addrs.push(local_addr);
            self.listeners.push(Listener {
                socket,
                local_addr,
                spec,
            });
        }
        Ok(())
    }

    /// 서버를 실행 준비 상태로 전환합니다.
    pub fn construct_finalize(&mut self) -> Result<(), IngestError> {
        if self.listeners.is_empty() {
            return Err(IngestError::Listener {
                addr: "-".to_owned(),
                reason: "no listen sockets opened".to_owned(),
            });
        }
        self.ready = true;
        Ok(())
    }

    /// 바인드된 로컬 주소 목록 (포트 0 바인드 시 실제 포트 확인용)
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.bound_addrs
    }

    /// 현재 세션 수
    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    /// 세션 상한
    pub fn max_sessions(&self) -> usize {
        self.cfg.max_sessions
    }

    /// 리스너별 수락 루프를 스폰합니다.
    pub fn start(&mut self) {
        debug_assert!(self.ready, "construct_finalize must run before start");
        for listener in self.listeners.drain(..) {
            let ctx = AcceptCtx {
                cfg: self.cfg.clone(),
                driver: Arc::clone(&self.driver),
                hooks: Arc::clone(&self.hooks),
                permits: Arc::clone(&self.session_permits),
                count: Arc::clone(&self.session_count),
                sessions: self.sessions.clone(),
                cancel: self.cancel.clone(),
                last_cap_warn: Arc::clone(&self.last_cap_warn),
            };
            self.accept_tasks.push(tokio::spawn(accept_loop(listener, ctx)));
        }
    }

    /// 수락 루프를 스폰하고 셧다운될 때까지 대기합니다.
    pub async fn run(&mut self) {
        self.start();
        self.cancel.cancelled().await;
    }

    /// 서버를 해체합니다: 수락 중단, 모든 세션 취소 후 대기.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.accept_tasks.drain(..) {
            let _ = task.await;
        }
        self.sessions.close();
        self.sessions.wait().await;
        tracing::info!("tcp server stopped");
    }
}

/// 수락 루프가 공유하는 컨텍스트
struct AcceptCtx {
    cfg: ServerConfig,
    driver: Arc<StreamDriver>,
    hooks: Arc<dyn ServerHooks>,
    permits: Arc<Semaphore>,
    count: Arc<AtomicUsize>,
    sessions: TaskTracker,
    cancel: CancellationToken,
    last_cap_warn: Arc<std::sync::Mutex<Option<Instant>>>,
}

async fn accept_loop(listener: Listener, ctx: AcceptCtx) {
    loop {
        tokio::select! {
            res = listener.socket.accept() => match res {
                Ok((stream, peer_addr)) => {
                    handle_accept(&listener.spec, stream, peer_addr, &ctx).await;
                }
                Err(e) => {
                    tracing::warn!(addr = %listener.local_addr, error = %e, "accept failed");
                }
            },
            () = ctx.cancel.cancelled() => {
                tracing::info!(addr = %listener.local_addr, "listener shutting down");
                break;
            }
        }
    }
}

async fn handle_accept(
    spec: &ListenerSpec,
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: &AcceptCtx,
) {
    // 세션 상한 먼저 -- 초과 시 즉시 닫고 경고는 초당 한 번
    let Ok(permit) = Arc::clone(&ctx.permits).try_acquire_owned() else {
        warn_session_cap(&ctx.last_cap_warn, peer_addr);
        drop(stream);
        return;
    };

    let fqdn = ctx
        .cfg
        .fqdn_resolver
        .as_ref()
        .and_then(|resolve| resolve(peer_addr.ip()));

    let mut peer = PeerInfo {
        addr: peer_addr.ip(),
        fqdn,
        tls_name: None,
    };

    // 수락 시점 ACL
    if !ctx.hooks.accept_allowed(&peer) {
        tracing::info!(peer = %peer_addr, "peer denied by acl");
        drop(stream);
        return;
    }

    if ctx.cfg.keep_alive
        && let Err(e) = SockRef::from(&stream).set_keepalive(true)
    {
        tracing::warn!(peer = %peer_addr, error = %e, "failed to set keepalive");
    }

    // TLS 핸드셰이크 + 피어 검증 (평문이면 통과)
    let (peer_stream, tls_name) = match ctx.driver.secure(stream, peer_addr).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::info!(peer = %peer_addr, error = %e, "connection rejected");
            return;
        }
    };

    // 검증된 피어 이름으로 ACL 재판정
    if tls_name.is_some() {
        peer.tls_name = tls_name;
        if !ctx.hooks.accept_allowed(&peer) {
            tracing::info!(peer = %peer_addr, "peer denied by acl after handshake");
            return;
        }
    }

    let policy = FramingPolicy {
        support_octet: spec.support_octet_framing,
        ..ctx.cfg.base_framing.clone()
    };
    let idle_timeout = if ctx.cfg.keep_alive {
        None
    } else {
        ctx.cfg.idle_timeout
    };

    let session = Session::new(
        peer_stream,
        peer,
        spec.input_name.clone(),
        Arc::clone(&spec.ruleset),
        policy,
        ctx.cfg.flow,
        Arc::clone(&ctx.hooks),
    );

    let count = Arc::clone(&ctx.count);
    let cancel = ctx.cancel.clone();
    count.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(peer = %peer_addr, "session opened");
    ctx.sessions.spawn(async move {
        let reason = session.run(cancel, idle_timeout).await;
        tracing::debug!(peer = %peer_addr, %reason, "session closed");
        count.fetch_sub(1, Ordering::Relaxed);
        drop(permit);
    });
}

fn warn_session_cap(last: &std::sync::Mutex<Option<Instant>>, peer: SocketAddr) {
    let mut guard = last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let now = Instant::now();
    if guard.is_none_or(|t| now.duration_since(t) >= Duration::from_secs(1)) {
        *guard = Some(now);
        tracing::warn!(peer = %peer, "session limit reached, rejecting connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_warning_is_rate_limited() {
        let last = std::sync::Mutex::new(None);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        warn_session_cap(&last, peer);
        let first = last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unwrap();

        // 1초 안의 두 번째 호출은 타임스탬프를 갱신하지 않음
        warn_session_cap(&last, peer);
        let second = last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unwrap();
        assert_eq!(first, second);
    }
}
