//! 도메인 타입 — 시스템 전역에서 사용되는 공통 타입
//!
//! 수집기와 룰셋 라우터, 액션 플러그인이 교환하는 메시지 레코드와
//! 부속 열거형을 정의합니다.

use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 메시지 흐름 제어 등급
///
/// 큐가 가득 찬 경우의 처리 방식을 결정합니다.
/// TCP 입력은 송신측이 재전송할 수 있으므로 `LightDelay`로 표시할 수 있습니다.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowClass {
    /// 지연 불가 — 큐가 가득 차면 드롭됩니다.
    #[default]
    NoDelay,
    /// 가벼운 지연 허용 — 큐에 자리가 날 때까지 송신측을 막을 수 있습니다.
    LightDelay,
}

/// 세션 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 원격 피어의 정상 종료 (FIN)
    Regular,
    /// 읽기 에러 또는 프레이밍 위반
    Error,
    /// 서버 셧다운
    Shutdown,
    /// 유휴 시간 초과
    IdleTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular => write!(f, "closed by remote peer"),
            Self::Error => write!(f, "connection error"),
            Self::Shutdown => write!(f, "server shutdown"),
            Self::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// 수신된 메시지 레코드
///
/// 프레임 재조립기가 완성한 페이로드 하나가 레코드 하나가 됩니다.
/// 세션의 피어 정보와 입력 이름 태그를 함께 담아 룰셋 라우터로 전달됩니다.
#[derive(Debug, Clone)]
pub struct MsgRecord {
    /// 메시지 페이로드 (프레이밍이 제거된 원시 바이트)
    pub payload: Bytes,
    /// 피어 IP 주소
    pub peer_addr: IpAddr,
    /// 피어 FQDN (역방향 조회가 된 경우)
    pub peer_fqdn: Option<String>,
    /// TLS 핸드셰이크에서 검증된 피어 이름
    pub peer_tls_name: Option<String>,
    /// 수신 리스너를 식별하는 입력 이름 태그
    pub input_name: String,
    /// 흐름 제어 등급
    pub flow: FlowClass,
    /// 최대 길이 초과로 잘린 메시지 여부
    pub oversized: bool,
    /// 수신 시각
    pub received_at: SystemTime,
}

impl MsgRecord {
    /// 새 메시지 레코드를 생성합니다.
    pub fn new(payload: Bytes, peer_addr: IpAddr, input_name: impl Into<String>) -> Self {
        Self {
            payload,
            peer_addr,
            peer_fqdn: None,
            peer_tls_name: None,
            input_name: input_name.into(),
            flow: FlowClass::NoDelay,
            oversized: false,
            received_at: SystemTime::now(),
        }
    }

    /// 피어 FQDN을 설정합니다.
    pub fn with_fqdn(mut self, fqdn: Option<String>) -> Self {
        self.peer_fqdn = fqdn;
        self
    }

    /// 검증된 TLS 피어 이름을 설정합니다.
    pub fn with_tls_name(mut self, name: Option<String>) -> Self {
        self.peer_tls_name = name;
        self
    }

    /// 흐름 제어 등급을 설정합니다.
    pub fn with_flow(mut self, flow: FlowClass) -> Self {
        self.flow = flow;
        self
    }

    /// 초과 길이 플래그를 설정합니다.
    pub fn with_oversized(mut self, oversized: bool) -> Self {
        self.oversized = oversized;
        self
    }
}

impl fmt::Display for MsgRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} bytes)",
            self.input_name,
            self.peer_addr,
            self.payload.len(),
        )
    }
}
