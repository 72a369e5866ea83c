//! 입력 모듈 파사드 -- 구성 스냅샷을 실행 중인 서버로 활성화합니다.
//!
//! 활성화 순서는 다음과 같습니다:
//!
//! 1. 인스턴스가 하나도 없으면 `NoListeners`로 중단
//! 2. 모듈 설정 검증, 룰셋 레지스트리 마무리
//! 3. 인스턴스의 바인드 룰셋 해석 (미등록 이름은 경고 후 default 사용)
//! 4. 메인 큐 생성, 룰셋 전용 큐 수집
//! 5. 훅 레코드와 함께 단일 TCP 서버 구성, 인스턴스별 리스너 등록
//! 6. 권한 강하 이전 단계로 모든 리스닝 소켓 오픈
//!
//! 이후 로드 스냅샷은 소비되어 불변 실행 스냅샷이 됩니다. 실행 중에
//! 레지스트리를 변경하는 경로는 없습니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio_rustls::TlsAcceptor;

use logport_core::action::Action;
use logport_core::error::{ConfigError, InputError, LogportError, QueueError};
use logport_core::pipeline::{BoxFuture, HealthStatus, Pipeline};
use logport_core::types::{CloseReason, FlowClass, MsgRecord};

use crate::acl::PeerAcl;
use crate::batch::BatchElem;
use crate::config::{ConfLoader, DFLT_INPUT_NAME, ModuleConfig};
use crate::framing::{FramingPolicy, MAX_FRAME_SIZE};
use crate::queue::{ChannelQueue, MsgQueue, QueueDispatcher};
use crate::ruleset::{ParserCatalog, Ruleset, RulesetRegistry};
use crate::server::{FqdnResolver, ServerConfig, ServerHooks, TcpServer};
use crate::session::PeerInfo;
use crate::stream::{AuthMode, StreamDriver};

/// 모듈 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    /// 활성화 완료, 시작 전
    Ready,
    /// 실행 중
    Running,
    /// 정지됨 (재시작 불가 -- 큐가 닫힘)
    Stopped,
}

/// TCP 입력 모듈 빌더
///
/// 로드 스냅샷([`ConfLoader`])과 협력자(TLS acceptor, FQDN 해석기)를
/// 받아 활성화를 수행합니다.
pub struct TcpInputBuilder {
    loader: ConfLoader,
    tls_acceptor: Option<TlsAcceptor>,
    fqdn_resolver: Option<FqdnResolver>,
}

impl TcpInputBuilder {
    /// 로드 스냅샷에서 빌더를 생성합니다.
    pub fn from_loader(loader: ConfLoader) -> Self {
        Self {
            loader,
            tls_acceptor: None,
            fqdn_resolver: None,
        }
    }

    /// TLS acceptor 협력자를 설정합니다. TLS 드라이버 모드에서 필수입니다.
    pub fn tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// 피어 FQDN 해석 협력자를 설정합니다.
    pub fn fqdn_resolver(mut self, resolver: FqdnResolver) -> Self {
        self.fqdn_resolver = Some(resolver);
        self
    }

    /// 활성화: 설정을 검증하고 리스닝 소켓을 연 모듈을 만듭니다.
    pub async fn build(self) -> Result<TcpInput, LogportError> {
        let (conf, mut instances, mut registry, catalog, acl) = self.loader.into_parts();

        if instances.is_empty() {
            return Err(ConfigError::NoListeners.into());
        }
        conf.validate().map_err(LogportError::Config)?;
        registry.finalize().map_err(LogportError::Config)?;

        let default_ruleset = registry
            .default_ruleset()
            .ok_or(ConfigError::NoRulesets)
            .map_err(LogportError::Config)?;

        // 바인드 룰셋 해석 -- 미등록 이름은 경고 후 default로 대체
        for inst in &mut instances {
            if let Some(name) = &inst.bind_ruleset_name {
                match registry.get(name) {
                    Some(ruleset) => inst.resolved_ruleset = Arc::downgrade(&ruleset),
                    None => {
                        tracing::warn!(
                            ruleset = %name,
                            port = %inst.bind_port,
                            "ruleset not found - using default ruleset instead"
                        );
                    }
                }
            }
        }

        let driver = match conf.driver_mode {
            crate::stream::DriverMode::Plain => StreamDriver::plain(),
            mode => {
                let acceptor = self.tls_acceptor.ok_or_else(|| {
                    LogportError::Config(ConfigError::InvalidValue {
                        directive: "inputtcpserverstreamdrivermode".to_owned(),
                        reason: "tls driver mode requires a tls acceptor".to_owned(),
                    })
                })?;
                StreamDriver::tls(
                    mode,
                    conf.auth_mode.unwrap_or(AuthMode::Anon),
                    acceptor,
                    conf.permitted_peers.clone(),
                )
            }
        };

        // 메인 큐 + 룰셋 전용 큐
        let main_queue: Arc<dyn MsgQueue> =
            Arc::new(ChannelQueue::new("main", conf.queue_capacity));
        let mut queues: Vec<Arc<dyn MsgQueue>> = vec![Arc::clone(&main_queue)];
        for ruleset in registry.iter() {
            if let Some(queue) = ruleset.queue() {
                queues.push(Arc::clone(queue));
            }
        }

        let flow = if conf.use_flow_control {
            FlowClass::LightDelay
        } else {
            FlowClass::NoDelay
        };

        let hooks: Arc<dyn ServerHooks> = Arc::new(InputHooks {
            acl,
            main_queue: Arc::clone(&main_queue),
            emit_msg_on_close: conf.emit_msg_on_close,
        });

        let server_cfg = ServerConfig {
            max_sessions: conf.max_sessions,
            max_listeners: conf.max_listeners,
            keep_alive: conf.keep_alive,
            idle_timeout: (conf.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(conf.idle_timeout_secs)),
            base_framing: FramingPolicy {
                support_octet: conf.default_octet_framing,
                disable_lf_delim: conf.disable_lf_delim,
                addtl_delim: conf.addtl_frame_delim,
                max_frame: MAX_FRAME_SIZE,
            },
            flow,
            fqdn_resolver: self.fqdn_resolver,
        };

        let mut server = TcpServer::new(server_cfg, Arc::new(driver), Arc::clone(&hooks));
        for inst in &instances {
            let ruleset = inst
                .resolved_ruleset
                .upgrade()
                .unwrap_or_else(|| Arc::clone(&default_ruleset));
            let input_name = inst
                .input_name
                .clone()
                .unwrap_or_else(|| DFLT_INPUT_NAME.to_owned());
            tracing::debug!(port = %inst.bind_port, ruleset = ruleset.name(), "adding listener");
            server.configure_listen(
                format!("{}:{}", conf.bind_host, inst.bind_port),
                inst.support_octet_framing,
                ruleset,
                input_name,
            );
        }

        server
            .open_listen_sockets()
            .await
            .map_err(LogportError::from)?;
        server.construct_finalize().map_err(LogportError::from)?;

        Ok(TcpInput {
            conf,
            registry,
            catalog,
            main_queue,
            queues,
            default_ruleset,
            server,
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatchers: Vec::new(),
            state: InputState::Ready,
        })
    }
}

/// TCP 입력 모듈
///
/// 활성화된 실행 스냅샷 전부(설정, 레지스트리, 큐, 서버)를 소유합니다.
impl std::fmt::Debug for TcpInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpInput").finish_non_exhaustive()
    }
}

pub struct TcpInput {
    conf: ModuleConfig,
    registry: RulesetRegistry,
    catalog: ParserCatalog,
    main_queue: Arc<dyn MsgQueue>,
    queues: Vec<Arc<dyn MsgQueue>>,
    default_ruleset: Arc<Ruleset>,
    server: TcpServer,
    shutdown: Arc<AtomicBool>,
    dispatchers: Vec<tokio::task::JoinHandle<()>>,
    state: InputState,
}

impl TcpInput {
    /// 바인드된 리스너 주소 목록
    pub fn local_addrs(&self) -> &[std::net::SocketAddr] {
        self.server.local_addrs()
    }

    /// 현재 세션 수
    pub fn session_count(&self) -> usize {
        self.server.session_count()
    }

    /// 공유 메인 큐
    ///
    /// 전용 큐가 없는 룰셋의 메시지가 모이는 큐입니다. 프로세스 내
    /// 전달자(forwarder) 같은 다른 입력 경로가 메시지를 직접 주입할 때도
    /// 사용할 수 있습니다.
    pub fn main_queue(&self) -> &Arc<dyn MsgQueue> {
        &self.main_queue
    }

    /// 실행 스냅샷의 모듈 설정
    pub fn config(&self) -> &ModuleConfig {
        &self.conf
    }

    /// 룰셋 레지스트리 (읽기 전용)
    pub fn rulesets(&self) -> &RulesetRegistry {
        &self.registry
    }

    /// 파서 카탈로그 (읽기 전용)
    pub fn parsers(&self) -> &ParserCatalog {
        &self.catalog
    }

    /// 시스템의 모든 액션을 한 번씩 방문합니다 (HUP/셧다운 처리용).
    pub fn for_each_action<F>(&self, f: F)
    where
        F: FnMut(&Arc<dyn Action>),
    {
        self.registry.for_each_action(f);
    }

    /// 배치 라우터에 즉시 중단을 요청합니다.
    ///
    /// 진행 중인 배치는 현재 룰 호출이 끝나는 대로 부분 완료로 반환됩니다.
    pub fn request_immediate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Pipeline for TcpInput {
    async fn start(&mut self) -> Result<(), LogportError> {
        if self.state == InputState::Running {
            return Err(InputError::AlreadyRunning.into());
        }
        if self.state == InputState::Stopped {
            // 큐가 이미 닫혀 있어 재시작할 수 없다
            return Err(InputError::InitFailed("module already stopped".to_owned()).into());
        }

        tracing::info!(
            listeners = self.server.local_addrs().len(),
            max_sessions = self.conf.max_sessions,
            "starting tcp input"
        );

        for queue in &self.queues {
            let dispatcher = QueueDispatcher::new(
                Arc::clone(queue),
                Arc::clone(&self.default_ruleset),
                self.conf.batch_size,
                Arc::clone(&self.shutdown),
            );
            self.dispatchers.push(dispatcher.spawn());
        }
        self.server.start();

        self.state = InputState::Running;
        tracing::info!("tcp input started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), LogportError> {
        if self.state != InputState::Running {
            return Err(InputError::NotRunning.into());
        }

        tracing::info!("stopping tcp input");

        // 1. 수락 중단, 모든 세션을 에러 경로로 종료
        self.server.shutdown().await;

        // 2. 큐를 닫아 디스패처가 잔여 메시지를 드레인하고 종료하게 함
        for queue in &self.queues {
            queue.close();
        }
        for task in self.dispatchers.drain(..) {
            let _ = task.await;
        }

        self.state = InputState::Stopped;
        tracing::info!("tcp input stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            InputState::Running => {
                let used = self.server.session_count();
                let max = self.server.max_sessions();
                if used * 10 >= max * 9 {
                    HealthStatus::Degraded(format!("sessions nearly exhausted: {used}/{max}"))
                } else {
                    HealthStatus::Healthy
                }
            }
            InputState::Ready => HealthStatus::Unhealthy("not started".to_owned()),
            InputState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 파사드가 TCP 서버에 설치하는 훅 레코드
///
/// 수락 필터는 피어 ACL로, 제출은 룰셋의 큐(전용 큐 또는 공유 메인
/// 큐)로 연결됩니다.
struct InputHooks {
    acl: PeerAcl,
    main_queue: Arc<dyn MsgQueue>,
    emit_msg_on_close: bool,
}

impl InputHooks {
    fn queue_for(&self, ruleset: &Ruleset) -> Arc<dyn MsgQueue> {
        ruleset
            .queue()
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.main_queue))
    }
}

impl ServerHooks for InputHooks {
    fn accept_allowed(&self, peer: &PeerInfo) -> bool {
        // 핸드셰이크 후 재판정에서는 검증된 TLS 피어 이름이 역방향 조회
        // 결과보다 우선한다
        let host = peer.tls_name.as_deref().or(peer.fqdn.as_deref());
        self.acl.is_allowed("TCP", peer.addr, host, true)
    }

    fn submit(&self, elem: BatchElem) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            let queue = self.queue_for(&elem.ruleset);
            queue.enqueue(elem).await
        })
    }

    fn session_closed<'a>(
        &'a self,
        peer: &'a PeerInfo,
        input_name: &'a str,
        ruleset: &'a Arc<Ruleset>,
        reason: CloseReason,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.emit_msg_on_close {
                return;
            }
            let text = format!("connection from {} closed: {}", peer.addr, reason);
            let msg = MsgRecord::new(Bytes::from(text), peer.addr, input_name.to_owned())
                .with_fqdn(peer.fqdn.clone())
                .with_tls_name(peer.tls_name.clone());
            let elem = BatchElem::new(Arc::new(msg), Arc::clone(ruleset));
            let queue = self.queue_for(ruleset);
            if let Err(e) = queue.enqueue(elem).await {
                tracing::debug!(error = %e, "close notification dropped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builder_without_listeners_fails() {
        let loader = ConfLoader::new();
        let result = TcpInputBuilder::from_loader(loader).build().await;
        assert!(matches!(
            result.unwrap_err(),
            LogportError::Config(ConfigError::NoListeners)
        ));
    }

    #[tokio::test]
    async fn tls_mode_without_acceptor_fails() {
        let mut loader = ConfLoader::new();
        loader
            .apply_directive("inputtcpserverstreamdrivermode 1")
            .unwrap();
        loader.apply_directive("inputtcpserverrun 0").unwrap();

        let err = TcpInputBuilder::from_loader(loader).build().await.unwrap_err();
        assert!(matches!(err, LogportError::Config(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn unknown_bind_ruleset_falls_back_to_default() {
        let mut loader = ConfLoader::new();
        loader
            .load_str(
                "inputtcpserverbindruleset does-not-exist\n\
                 inputtcpserverrun 0\n",
            )
            .unwrap();

        // 경고와 함께 default 룰셋으로 대체되어 활성화는 성공한다
        let input = TcpInputBuilder::from_loader(loader).build().await.unwrap();
        assert_eq!(input.local_addrs().len(), 1);
    }

    #[test]
    fn verified_tls_name_overrides_fqdn_in_acl_recheck() {
        use crate::acl::PeerPattern;
        use std::net::{IpAddr, Ipv4Addr};

        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("*.trusted.example").unwrap());
        let hooks = InputHooks {
            acl,
            main_queue: Arc::new(ChannelQueue::new("main", 4)),
            emit_msg_on_close: false,
        };

        // 역방향 조회 이름은 허용 목록에 없지만 인증서 이름이 매칭되면 허용
        let mut peer = PeerInfo {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            fqdn: Some("host.other.example".to_owned()),
            tls_name: None,
        };
        assert!(!hooks.accept_allowed(&peer));
        peer.tls_name = Some("client.trusted.example".to_owned());
        assert!(hooks.accept_allowed(&peer));

        // 반대로, 역방향 조회 이름이 우연히 매칭되어도 검증된 인증서
        // 이름이 아니면 거부
        let peer = PeerInfo {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            fqdn: Some("spoofed.trusted.example".to_owned()),
            tls_name: Some("client.other.example".to_owned()),
        };
        assert!(!hooks.accept_allowed(&peer));
    }

    #[tokio::test]
    async fn lifecycle_start_stop() {
        let mut loader = ConfLoader::new();
        loader.apply_directive("inputtcpserverrun 0").unwrap();

        let mut input = TcpInputBuilder::from_loader(loader).build().await.unwrap();
        assert!(input.health_check().await.is_unhealthy());

        input.start().await.unwrap();
        assert!(input.health_check().await.is_healthy());
        assert!(input.start().await.is_err());

        input.stop().await.unwrap();
        assert!(input.health_check().await.is_unhealthy());
        assert!(input.stop().await.is_err());

        // 큐가 닫혔으므로 재시작은 거부된다
        assert!(input.start().await.is_err());
    }

    #[tokio::test]
    async fn listener_limit_drops_extra_instances() {
        let mut loader = ConfLoader::new();
        loader.apply_directive("inputtcpmaxlisteners 1").unwrap();
        loader.apply_directive("inputtcpserverrun 0").unwrap();
        loader.apply_directive("inputtcpserverrun 0").unwrap();

        let input = TcpInputBuilder::from_loader(loader).build().await.unwrap();
        assert_eq!(input.local_addrs().len(), 1);
    }
}
