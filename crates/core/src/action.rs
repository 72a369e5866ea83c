//! 액션 trait — 출력 플러그인 확장 포인트
//!
//! 룰의 각 액션은 외부 출력 플러그인(파일, 전달, 데이터베이스 등)이
//! 구현합니다. 배치 라우터는 룰에 등록된 액션을 삽입 순서대로 호출합니다.

use crate::error::LogportError;
use crate::pipeline::BoxFuture;
use crate::types::MsgRecord;

/// 액션 처리 결과
///
/// 액션이 메시지를 처리한 뒤 배치 요소의 후속 처리를 결정합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerdict {
    /// 같은 룰의 다음 액션과 이후 룰이 계속 처리합니다.
    Continue,
    /// 이 메시지를 완료로 표시합니다. 이후 룰은 이 요소를 건너뜁니다.
    Discard,
}

/// 출력 액션 trait
///
/// 새로운 출력 대상을 지원하려면 이 trait을 구현합니다.
/// `process`는 메시지당 한 번 호출되며, 에러는 해당 룰 수준에서
/// 기록될 뿐 배치 처리를 중단하지 않습니다.
///
/// # 구현 예시
/// ```ignore
/// struct ForwardAction { target: String }
///
/// impl Action for ForwardAction {
///     fn name(&self) -> &str { "forward" }
///
///     fn process<'a>(&'a self, msg: &'a MsgRecord)
///         -> BoxFuture<'a, Result<ActionVerdict, LogportError>>
///     {
///         Box::pin(async move {
///             // 메시지를 원격 수신자에게 전달
///             Ok(ActionVerdict::Continue)
///         })
///     }
/// }
/// ```
pub trait Action: Send + Sync {
    /// 액션 이름
    fn name(&self) -> &str;

    /// 메시지 하나를 처리합니다.
    fn process<'a>(
        &'a self,
        msg: &'a MsgRecord,
    ) -> BoxFuture<'a, Result<ActionVerdict, LogportError>>;
}
