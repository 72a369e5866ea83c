//! 배치 라우터 -- 메시지 배치를 룰셋의 룰 체인으로 디스패치합니다.
//!
//! 두 가지 경로가 있습니다:
//!
//! - **단일 룰셋 고속 경로**: 배치 전체가 한 룰셋에 속하면 배치를
//!   통째로 룰 체인에 넘깁니다. 각 룰은 다음 룰로 넘어가기 전에 모든
//!   READY 요소를 처리합니다.
//! - **다중 룰셋 분할**: 배치가 여러 룰셋에 걸치면, 첫 미처리 요소의
//!   룰셋을 기준으로 같은 룰셋의 요소를 부분 배치로 떼어내 고속 경로로
//!   처리하고, 원본에서 DISCARDED로 표시합니다. 미처리 요소가 없어질
//!   때까지 반복하므로 각 요소는 정확히 한 번씩, 자신의 룰셋이 처음
//!   등장한 순서대로 디스패치됩니다.
//!
//! 공유 셧다운 플래그는 룰 호출 사이와 부분 배치 사이에서 확인되며,
//! 설정되면 남은 요소를 처리하지 않고 즉시 반환합니다 (부분 완료 --
//! 에러가 아닙니다).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use logport_core::action::ActionVerdict;
use logport_core::types::MsgRecord;

use crate::error::IngestError;
use crate::ruleset::{Rule, Ruleset};

/// 배치 요소 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemState {
    /// 처리 대상
    Ready,
    /// 처리 완료 또는 디스패치 대상에서 제외됨
    Discarded,
}

/// 배치 요소
pub struct BatchElem {
    /// 메시지 레코드
    pub msg: Arc<MsgRecord>,
    /// 이 메시지가 바인딩된 룰셋
    pub ruleset: Arc<Ruleset>,
    /// 요소 상태
    pub state: ElemState,
}

impl BatchElem {
    /// READY 상태의 새 배치 요소를 생성합니다.
    pub fn new(msg: Arc<MsgRecord>, ruleset: Arc<Ruleset>) -> Self {
        Self {
            msg,
            ruleset,
            state: ElemState::Ready,
        }
    }
}

/// 배치 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// 모든 요소가 처리됨
    Completed,
    /// 셧다운 플래그로 중단됨 -- 남은 요소는 처리되지 않은 채 남습니다
    Interrupted,
}

/// 메시지 배치
pub struct Batch {
    elems: Vec<BatchElem>,
    single_ruleset: bool,
    /// 단일 룰셋 배치의 대상 룰셋 (`None`이면 default 사용)
    ruleset: Option<Arc<Ruleset>>,
    shutdown: Arc<AtomicBool>,
}

impl Batch {
    /// 요소 목록에서 배치를 만듭니다.
    ///
    /// 모든 요소가 같은 룰셋이면 단일 룰셋 배치가 됩니다.
    pub fn from_elems(elems: Vec<BatchElem>, shutdown: Arc<AtomicBool>) -> Self {
        let single_ruleset = match elems.first() {
            Some(first) => elems
                .iter()
                .all(|e| Arc::ptr_eq(&e.ruleset, &first.ruleset)),
            None => true,
        };
        let ruleset = if single_ruleset {
            elems.first().map(|e| Arc::clone(&e.ruleset))
        } else {
            None
        };
        Self {
            elems,
            single_ruleset,
            ruleset,
            shutdown,
        }
    }

    /// 요소 수
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// 배치가 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// READY 상태 요소 수
    pub fn ready_count(&self) -> usize {
        self.elems
            .iter()
            .filter(|e| e.state == ElemState::Ready)
            .count()
    }

    /// 단일 룰셋 배치 여부
    pub fn is_single_ruleset(&self) -> bool {
        self.single_ruleset
    }

    /// 요소 접근 (테스트/검증용)
    pub fn elems(&self) -> &[BatchElem] {
        &self.elems
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// 배치를 소비합니다.
///
/// 단일 룰셋 배치는 고속 경로로, 그 외에는 룰셋별 분할 경로로
/// 처리합니다. `default`는 배치에 룰셋 지정이 없을 때 사용됩니다.
pub async fn process_batch(
    batch: &mut Batch,
    default: &Arc<Ruleset>,
) -> Result<BatchOutcome, IngestError> {
    tracing::debug!(elems = batch.len(), "processing batch");
    if batch.single_ruleset {
        process_single_ruleset(batch, default).await
    } else {
        process_multi_ruleset(batch, default).await
    }
}

/// 단일 룰셋 고속 경로.
///
/// 룰셋의 디스패치 게이트를 잡아 같은 룰셋에 대한 동시 디스패치를
/// 직렬화합니다 (액션은 배치 내 순서 가시성을 가정합니다).
async fn process_single_ruleset(
    batch: &mut Batch,
    default: &Arc<Ruleset>,
) -> Result<BatchOutcome, IngestError> {
    let ruleset = batch
        .ruleset
        .clone()
        .unwrap_or_else(|| Arc::clone(default));

    let _gate = ruleset.dispatch_gate().lock().await;
    let rules = ruleset.rules_snapshot();
    for rule in rules {
        if batch.shutdown_requested() {
            tracing::debug!(ruleset = ruleset.name(), "batch dispatch interrupted");
            return Ok(BatchOutcome::Interrupted);
        }
        process_rule(&rule, batch).await;
    }
    Ok(BatchOutcome::Completed)
}

/// 룰 하나가 배치의 모든 READY 요소를 처리합니다.
///
/// 액션 에러는 룰 수준에서 기록될 뿐 배치를 중단하지 않습니다.
async fn process_rule(rule: &Rule, batch: &mut Batch) {
    for elem in &mut batch.elems {
        if elem.state != ElemState::Ready {
            continue;
        }
        for action in rule.actions() {
            match action.process(&elem.msg).await {
                Ok(ActionVerdict::Continue) => {}
                Ok(ActionVerdict::Discard) => {
                    elem.state = ElemState::Discarded;
                    break;
                }
                Err(e) => {
                    tracing::warn!(action = action.name(), error = %e, "action failed");
                }
            }
        }
    }
}

/// 다중 룰셋 분할 경로.
///
/// 원본 배치를 제자리에서 분할합니다: 부분 배치로 복사된 요소는 원본에서
/// DISCARDED로 표시되어 다시 고려되지 않습니다.
async fn process_multi_ruleset(
    batch: &mut Batch,
    default: &Arc<Ruleset>,
) -> Result<BatchOutcome, IngestError> {
    loop {
        // 첫 미처리 요소 탐색
        let Some(start) = batch
            .elems
            .iter()
            .position(|e| e.state != ElemState::Discarded)
        else {
            return Ok(BatchOutcome::Completed);
        };

        if batch.shutdown_requested() {
            return Ok(BatchOutcome::Interrupted);
        }

        let current = Arc::clone(&batch.elems[start].ruleset);
        let mut sub_elems = Vec::with_capacity(batch.elems.len());
        for elem in &mut batch.elems[start..] {
            if Arc::ptr_eq(&elem.ruleset, &current) {
                sub_elems.push(BatchElem {
                    msg: Arc::clone(&elem.msg),
                    ruleset: Arc::clone(&elem.ruleset),
                    state: elem.state,
                });
                // 부분 배치로 넘어간 요소는 원본에서 완료 표시
                elem.state = ElemState::Discarded;
            }
        }

        let mut sub = Batch {
            elems: sub_elems,
            single_ruleset: true,
            ruleset: Some(current),
            shutdown: Arc::clone(&batch.shutdown),
        };
        if process_single_ruleset(&mut sub, default).await? == BatchOutcome::Interrupted {
            return Ok(BatchOutcome::Interrupted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    use bytes::Bytes;
    use logport_core::action::Action;
    use logport_core::error::LogportError;
    use logport_core::pipeline::BoxFuture;

    use crate::ruleset::RulesetRegistry;

    /// 처리 순서를 기록하는 액션
    struct RecordAction {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Action for RecordAction {
        fn name(&self) -> &str {
            self.label
        }

        fn process<'a>(
            &'a self,
            msg: &'a MsgRecord,
        ) -> BoxFuture<'a, Result<ActionVerdict, LogportError>> {
            Box::pin(async move {
                let text = String::from_utf8_lossy(&msg.payload).into_owned();
                self.log
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(format!("{}:{}", self.label, text));
                Ok(ActionVerdict::Continue)
            })
        }
    }

    /// 매칭되는 페이로드를 완료 표시하는 액션
    struct DiscardAction {
        needle: &'static str,
    }

    impl Action for DiscardAction {
        fn name(&self) -> &str {
            "discard"
        }

        fn process<'a>(
            &'a self,
            msg: &'a MsgRecord,
        ) -> BoxFuture<'a, Result<ActionVerdict, LogportError>> {
            Box::pin(async move {
                if msg.payload.as_ref() == self.needle.as_bytes() {
                    Ok(ActionVerdict::Discard)
                } else {
                    Ok(ActionVerdict::Continue)
                }
            })
        }
    }

    /// 셧다운 플래그를 세우는 액션
    struct ShutdownAction {
        flag: Arc<AtomicBool>,
    }

    impl Action for ShutdownAction {
        fn name(&self) -> &str {
            "shutdown"
        }

        fn process<'a>(
            &'a self,
            _msg: &'a MsgRecord,
        ) -> BoxFuture<'a, Result<ActionVerdict, LogportError>> {
            Box::pin(async move {
                self.flag.store(true, Ordering::Release);
                Ok(ActionVerdict::Continue)
            })
        }
    }

    fn msg(text: &str) -> Arc<MsgRecord> {
        Arc::new(MsgRecord::new(
            Bytes::copy_from_slice(text.as_bytes()),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "tcp",
        ))
    }

    fn record_rule(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Rule {
        Rule::new(vec![Arc::new(RecordAction {
            label,
            log: Arc::clone(log),
        })])
    }

    fn log_contents(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[tokio::test]
    async fn single_ruleset_fast_path_runs_rules_in_order() {
        let mut registry = RulesetRegistry::new();
        let ruleset = registry.construct("remote").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_rule(&ruleset, record_rule("r1", &log));
        registry.add_rule(&ruleset, record_rule("r2", &log));

        let elems = vec![
            BatchElem::new(msg("m1"), Arc::clone(&ruleset)),
            BatchElem::new(msg("m2"), Arc::clone(&ruleset)),
        ];
        let mut batch = Batch::from_elems(elems, Arc::new(AtomicBool::new(false)));
        assert!(batch.is_single_ruleset());

        let outcome = process_batch(&mut batch, &ruleset).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Completed);
        // 룰 하나가 모든 요소를 처리한 다음에야 다음 룰이 실행됨
        assert_eq!(
            log_contents(&log),
            vec!["r1:m1", "r1:m2", "r2:m1", "r2:m2"]
        );
    }

    #[tokio::test]
    async fn multi_ruleset_partition_dispatches_each_element_once() {
        let mut registry = RulesetRegistry::new();
        let rs_a = registry.construct("a").unwrap();
        let rs_b = registry.construct("b").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_rule(&rs_a, record_rule("a", &log));
        registry.add_rule(&rs_b, record_rule("b", &log));

        // A, B, A, B, A 순서의 혼합 배치
        let elems = vec![
            BatchElem::new(msg("m1"), Arc::clone(&rs_a)),
            BatchElem::new(msg("m2"), Arc::clone(&rs_b)),
            BatchElem::new(msg("m3"), Arc::clone(&rs_a)),
            BatchElem::new(msg("m4"), Arc::clone(&rs_b)),
            BatchElem::new(msg("m5"), Arc::clone(&rs_a)),
        ];
        let mut batch = Batch::from_elems(elems, Arc::new(AtomicBool::new(false)));
        assert!(!batch.is_single_ruleset());

        let outcome = process_batch(&mut batch, &rs_a).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Completed);

        // A의 부분 배치(원본 순서 유지)가 먼저, 그다음 B의 부분 배치
        assert_eq!(
            log_contents(&log),
            vec!["a:m1", "a:m3", "a:m5", "b:m2", "b:m4"]
        );
        // 원본 배치의 모든 요소가 완료 표시됨
        assert_eq!(batch.ready_count(), 0);
    }

    #[tokio::test]
    async fn empty_batch_uses_default_ruleset() {
        let mut registry = RulesetRegistry::new();
        let ruleset = registry.construct("default").unwrap();
        let mut batch = Batch::from_elems(Vec::new(), Arc::new(AtomicBool::new(false)));
        let outcome = process_batch(&mut batch, &ruleset).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Completed);
    }

    #[tokio::test]
    async fn discard_verdict_skips_later_rules() {
        let mut registry = RulesetRegistry::new();
        let ruleset = registry.construct("remote").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_rule(
            &ruleset,
            Rule::new(vec![Arc::new(DiscardAction { needle: "drop-me" })]),
        );
        registry.add_rule(&ruleset, record_rule("after", &log));

        let elems = vec![
            BatchElem::new(msg("keep"), Arc::clone(&ruleset)),
            BatchElem::new(msg("drop-me"), Arc::clone(&ruleset)),
        ];
        let mut batch = Batch::from_elems(elems, Arc::new(AtomicBool::new(false)));
        process_batch(&mut batch, &ruleset).await.unwrap();

        assert_eq!(log_contents(&log), vec!["after:keep"]);
        assert_eq!(batch.ready_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_flag_interrupts_between_rules() {
        let mut registry = RulesetRegistry::new();
        let ruleset = registry.construct("remote").unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(Vec::new()));

        // 첫 룰이 플래그를 세우면 두 번째 룰은 실행되지 않아야 함
        registry.add_rule(
            &ruleset,
            Rule::new(vec![Arc::new(ShutdownAction {
                flag: Arc::clone(&flag),
            })]),
        );
        registry.add_rule(&ruleset, record_rule("never", &log));

        let elems = vec![BatchElem::new(msg("m1"), Arc::clone(&ruleset))];
        let mut batch = Batch::from_elems(elems, Arc::clone(&flag));
        let outcome = process_batch(&mut batch, &ruleset).await.unwrap();

        assert_eq!(outcome, BatchOutcome::Interrupted);
        assert!(log_contents(&log).is_empty());
    }

    #[tokio::test]
    async fn shutdown_flag_interrupts_between_sub_batches() {
        let mut registry = RulesetRegistry::new();
        let rs_a = registry.construct("a").unwrap();
        let rs_b = registry.construct("b").unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add_rule(
            &rs_a,
            Rule::new(vec![
                Arc::new(ShutdownAction {
                    flag: Arc::clone(&flag),
                }) as Arc<dyn Action>,
            ]),
        );
        registry.add_rule(&rs_b, record_rule("b", &log));

        let elems = vec![
            BatchElem::new(msg("m1"), Arc::clone(&rs_a)),
            BatchElem::new(msg("m2"), Arc::clone(&rs_b)),
        ];
        let mut batch = Batch::from_elems(elems, Arc::clone(&flag));
        let outcome = process_batch(&mut batch, &rs_a).await.unwrap();

        // A의 부분 배치 처리 중 플래그가 설정되어 B는 시작되지 않음
        assert_eq!(outcome, BatchOutcome::Interrupted);
        assert!(log_contents(&log).is_empty());
    }
}
