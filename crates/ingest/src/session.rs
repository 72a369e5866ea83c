//! 세션 -- 수락된 연결 하나의 수명주기
//!
//! 세션은 스트림과 프레임 재조립기, 바인딩된 룰셋, 입력 이름 태그를
//! 소유합니다. 상태는 `Init → Open → Closing → Closed`로만 진행합니다.
//!
//! 종료 경로는 두 가지입니다:
//! - **정상 종료** (피어 FIN): 재조립기에 남은 미완성 프레임을 마지막
//!   메시지로 플러시한 뒤 해체합니다.
//! - **에러 종료** (읽기 에러, 프레이밍 위반, 셧다운, 유휴 초과): 플러시
//!   없이 해체합니다. 셧다운 시 에러 경로를 타는 것은 해체 시간을
//!   한정하기 위함입니다.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use logport_core::types::{CloseReason, FlowClass, MsgRecord};

use crate::error::IngestError;
use crate::framing::{Frame, FrameReassembler, FramingPolicy};
use crate::server::ServerHooks;
use crate::stream::PeerStream;

/// 세션별 수신 버퍼 크기
const RECV_BUF_SIZE: usize = 16 * 1024;

/// 피어 신원 정보
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// 피어 IP 주소
    pub addr: IpAddr,
    /// 피어 FQDN (역방향 조회가 된 경우)
    pub fqdn: Option<String>,
    /// TLS 핸드셰이크에서 검증된 피어 이름
    pub tls_name: Option<String>,
}

/// 세션 상태. 전이는 되돌릴 수 없습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 수락 직후, 핸드셰이크/ACL 통과 전
    Init,
    /// 데이터 수신 중
    Open,
    /// 종료 처리 중 (플러시 또는 폐기)
    Closing,
    /// 리소스 반환 완료
    Closed,
}

/// TCP 세션
pub struct Session {
    stream: PeerStream,
    peer: PeerInfo,
    input_name: String,
    ruleset: Arc<crate::ruleset::Ruleset>,
    reasm: FrameReassembler,
    flow: FlowClass,
    state: SessionState,
    hooks: Arc<dyn ServerHooks>,
}

impl Session {
    /// 새 세션을 생성합니다. 상태는 `Init`입니다.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: PeerStream,
        peer: PeerInfo,
        input_name: String,
        ruleset: Arc<crate::ruleset::Ruleset>,
        policy: FramingPolicy,
        flow: FlowClass,
        hooks: Arc<dyn ServerHooks>,
    ) -> Self {
        Self {
            stream,
            peer,
            input_name,
            ruleset,
            reasm: FrameReassembler::new(policy),
            flow,
            state: SessionState::Init,
            hooks,
        }
    }

    /// 현재 세션 상태
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 피어 정보
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// 수신 루프를 실행합니다. 세션이 닫힌 사유를 반환합니다.
    ///
    /// 셧다운 토큰은 매 수신 후 비차단으로 확인되며, 설정되면 에러 종료
    /// 경로를 탑니다. `idle_timeout`이 지정되면 keep-alive가 꺼진 구성에서
    /// 유휴 연결을 정리합니다.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        idle_timeout: Option<Duration>,
    ) -> CloseReason {
        self.state = SessionState::Open;
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        let reason = loop {
            let event = self.next_event(&cancel, idle_timeout, &mut buf).await;
            match event {
                ReadEvent::Data(0) => {
                    self.on_close_regular().await;
                    break CloseReason::Regular;
                }
                ReadEvent::Data(n) => {
                    if let Err(e) = self.on_data(&buf[..n]).await {
                        tracing::warn!(peer = %self.peer.addr, error = %e, "session error");
                        self.on_close_error().await;
                        break CloseReason::Error;
                    }
                }
                ReadEvent::Failed(e) => {
                    tracing::warn!(peer = %self.peer.addr, error = %e, "read error");
                    self.on_close_error().await;
                    break CloseReason::Error;
                }
                ReadEvent::IdleExpired => {
                    tracing::debug!(peer = %self.peer.addr, "idle timeout");
                    self.on_close_error().await;
                    break CloseReason::IdleTimeout;
                }
                ReadEvent::Cancelled => {
                    self.on_close_error().await;
                    break CloseReason::Shutdown;
                }
            }
        };

        self.hooks
            .session_closed(&self.peer, &self.input_name, &self.ruleset, reason)
            .await;
        reason
    }

    async fn next_event(
        &mut self,
        cancel: &CancellationToken,
        idle_timeout: Option<Duration>,
        buf: &mut [u8],
    ) -> ReadEvent {
        match idle_timeout {
            Some(limit) => {
                tokio::select! {
                    res = tokio::time::timeout(limit, self.stream.recv(buf)) => match res {
                        Ok(Ok(n)) => ReadEvent::Data(n),
                        Ok(Err(e)) => ReadEvent::Failed(e),
                        Err(_) => ReadEvent::IdleExpired,
                    },
                    () = cancel.cancelled() => ReadEvent::Cancelled,
                }
            }
            None => {
                tokio::select! {
                    res = self.stream.recv(buf) => match res {
                        Ok(n) => ReadEvent::Data(n),
                        Err(e) => ReadEvent::Failed(e),
                    },
                    () = cancel.cancelled() => ReadEvent::Cancelled,
                }
            }
        }
    }

    /// 수신 청크를 재조립기에 넣고 완성된 프레임을 제출합니다.
    async fn on_data(&mut self, chunk: &[u8]) -> Result<(), IngestError> {
        let mut frames = Vec::new();
        self.reasm
            .push(chunk, &mut frames)
            .map_err(|e| IngestError::FrameMalformed {
                peer: self.peer.addr.to_string(),
                reason: e.to_string(),
            })?;
        for frame in frames {
            self.submit(frame).await?;
        }
        Ok(())
    }

    /// 완성된 프레임을 메시지 레코드로 만들어 룰셋 큐에 제출합니다.
    async fn submit(&self, frame: Frame) -> Result<(), IngestError> {
        let msg = MsgRecord::new(frame.payload, self.peer.addr, self.input_name.clone())
            .with_fqdn(self.peer.fqdn.clone())
            .with_tls_name(self.peer.tls_name.clone())
            .with_flow(self.flow)
            .with_oversized(frame.oversized);
        self.hooks
            .submit(crate::batch::BatchElem::new(
                Arc::new(msg),
                Arc::clone(&self.ruleset),
            ))
            .await?;
        Ok(())
    }

    /// 정상 종료: 미완성 프레임을 플러시한 뒤 스트림을 반환합니다.
    async fn on_close_regular(&mut self) {
        self.state = SessionState::Closing;
        if let Some(frame) = self.reasm.finish_regular() {
            tracing::debug!(peer = %self.peer.addr, "flushing trailing frame on close");
            if let Err(e) = self.submit(frame).await {
                tracing::warn!(peer = %self.peer.addr, error = %e, "trailing frame lost");
            }
        }
        let _ = self.stream.shutdown().await;
        self.state = SessionState::Closed;
    }

    /// 에러 종료: 플러시 없이 스트림을 반환합니다.
    async fn on_close_error(&mut self) {
        self.state = SessionState::Closing;
        self.reasm.discard();
        let _ = self.stream.shutdown().await;
        self.state = SessionState::Closed;
    }
}

enum ReadEvent {
    /// n 바이트 수신 (0은 정상 종료)
    Data(usize),
    /// 읽기 에러
    Failed(std::io::Error),
    /// 유휴 시간 초과
    IdleExpired,
    /// 셧다운 토큰 설정됨
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use logport_core::error::QueueError;
    use logport_core::pipeline::BoxFuture;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::batch::BatchElem;
    use crate::ruleset::{Ruleset, RulesetRegistry};

    /// 제출된 메시지를 기록만 하는 훅
    struct RecordingHooks {
        msgs: Mutex<Vec<MsgRecord>>,
        closes: Mutex<Vec<CloseReason>>,
    }

    impl RecordingHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                msgs: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
            })
        }

        fn payloads(&self) -> Vec<String> {
            self.msgs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
                .collect()
        }
    }

    impl ServerHooks for RecordingHooks {
        fn accept_allowed(&self, _peer: &PeerInfo) -> bool {
            true
        }

        fn submit(&self, elem: BatchElem) -> BoxFuture<'_, Result<(), QueueError>> {
            Box::pin(async move {
                self.msgs
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push((*elem.msg).clone());
                Ok(())
            })
        }

        fn session_closed<'a>(
            &'a self,
            _peer: &'a PeerInfo,
            _input_name: &'a str,
            _ruleset: &'a Arc<Ruleset>,
            reason: CloseReason,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.closes
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(reason);
            })
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn test_ruleset() -> Arc<Ruleset> {
        let mut registry = RulesetRegistry::new();
        registry.construct("test").unwrap()
    }

    fn make_session(server: TcpStream, hooks: Arc<RecordingHooks>) -> Session {
        Session::new(
            PeerStream::Plain(server),
            PeerInfo {
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                fqdn: None,
                tls_name: None,
            },
            "tcp".to_owned(),
            test_ruleset(),
            FramingPolicy::default(),
            FlowClass::NoDelay,
            hooks,
        )
    }

    #[tokio::test]
    async fn session_delivers_frames_in_order() {
        let (mut client, server) = socket_pair().await;
        let hooks = RecordingHooks::new();
        let session = make_session(server, Arc::clone(&hooks));

        let task = tokio::spawn(session.run(CancellationToken::new(), None));

        client.write_all(b"one\ntwo\n").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::Regular);
        assert_eq!(hooks.payloads(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn regular_close_flushes_partial_frame() {
        let (mut client, server) = socket_pair().await;
        let hooks = RecordingHooks::new();
        let session = make_session(server, Arc::clone(&hooks));

        let task = tokio::spawn(session.run(CancellationToken::new(), None));

        client.write_all(b"partial").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::Regular);
        assert_eq!(hooks.payloads(), vec!["partial"]);
    }

    #[tokio::test]
    async fn shutdown_discards_partial_frame() {
        let (mut client, server) = socket_pair().await;
        let hooks = RecordingHooks::new();
        let session = make_session(server, Arc::clone(&hooks));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(session.run(cancel.clone(), None));

        client.write_all(b"partial").await.unwrap();
        // 세션이 청크를 소화할 시간을 준 뒤 셧다운
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::Shutdown);
        assert!(hooks.payloads().is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_closes_session_without_flush() {
        let (mut client, server) = socket_pair().await;
        let hooks = RecordingHooks::new();
        let session = make_session(server, Arc::clone(&hooks));

        let task = tokio::spawn(session.run(CancellationToken::new(), None));

        // octet count 자리에 잘못된 바이트
        client.write_all(b"12x3 hello").await.unwrap();

        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::Error);
        assert!(hooks.payloads().is_empty());
    }

    #[tokio::test]
    async fn idle_timeout_closes_session() {
        let (client, server) = socket_pair().await;
        let hooks = RecordingHooks::new();
        let session = make_session(server, Arc::clone(&hooks));

        let task = tokio::spawn(session.run(
            CancellationToken::new(),
            Some(Duration::from_millis(50)),
        ));

        let reason = task.await.unwrap();
        assert_eq!(reason, CloseReason::IdleTimeout);
        drop(client);
    }

    #[tokio::test]
    async fn close_reason_reported_to_hooks() {
        let (mut client, server) = socket_pair().await;
        let hooks = RecordingHooks::new();
        let session = make_session(server, Arc::clone(&hooks));

        let task = tokio::spawn(session.run(CancellationToken::new(), None));
        client.write_all(b"msg\n").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        task.await.unwrap();

        let closes = hooks
            .closes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(closes, vec![CloseReason::Regular]);
    }
}
