//! 수집 코어 에러 타입
//!
//! [`IngestError`]는 TCP 수집 코어 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<IngestError> for LogportError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.
//!
//! 전파 정책: I/O와 프레이밍 에러는 세션 안에서 소비되고(세션만 닫힘),
//! 설정 에러는 활성화를 중단시키며, 큐/액션 에러는 룰 단위로 기록될 뿐
//! 배치 처리를 중단하지 않습니다.

use logport_core::error::{ConfigError, InputError, LogportError, QueueError};

/// 수집 코어 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// ACL 또는 TLS 피어 검증 실패 — 세션을 만들지 않고 연결을 닫습니다.
    #[error("peer denied: {peer}: {reason}")]
    PeerDenied {
        /// 피어 주소 또는 이름
        peer: String,
        /// 거부 사유
        reason: String,
    },

    /// 프레이밍 위반 — 해당 세션을 에러 경로로 닫습니다.
    #[error("malformed frame from {peer}: {reason}")]
    FrameMalformed {
        /// 피어 주소
        peer: String,
        /// 위반 내용
        reason: String,
    },

    /// 리스너 바인드/수락 에러
    #[error("listener error on {addr}: {reason}")]
    Listener {
        /// 바인드 주소
        addr: String,
        /// 에러 사유
        reason: String,
    },

    /// TLS 핸드셰이크 에러
    #[error("tls error: {0}")]
    Tls(String),

    /// 세션 I/O 에러 (재접속으로 복구 가능)
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),

    /// 큐 에러
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// 설정 에러
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<IngestError> for LogportError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Config(e) => LogportError::Config(e),
            IngestError::Queue(e) => LogportError::Queue(e),
            IngestError::Io(e) => LogportError::Io(e),
            other => LogportError::Input(InputError::InitFailed(other.to_string())),
        }
    }
}
