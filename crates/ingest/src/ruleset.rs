//! 룰셋 레지스트리 -- 이름으로 키된 룰셋 모음과 파서 카탈로그
//!
//! 룰셋은 이름이 붙은 룰 체인으로, 자체 파서 체인과 전용 큐를 가질 수
//! 있습니다. 레지스트리는 구성 로드 동안 단일 작성자 원칙으로만 변경되고
//! (`&mut self` 연산), 활성화 후에는 `Arc` 뒤에서 읽기 전용으로
//! 공유됩니다.
//!
//! - *default* 룰셋: 바인딩이 지정되지 않은 리스너가 사용. 최초 생성된
//!   룰셋이 기본값이 됩니다.
//! - *current* 룰셋: 구성 로드 중 룰셋 단위 디렉티브(`rulesetparser`,
//!   `rulesetcreatemainqueue`)가 적용되는 대상. 가장 최근에 생성된
//!   룰셋입니다.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use logport_core::action::Action;
use logport_core::error::ConfigError;
use logport_core::parser::MsgParser;

use crate::queue::MsgQueue;

/// 룰 -- 순서 있는 액션 목록
///
/// 액션이 하나도 없는 룰은 등록 시점에 경고와 함께 버려집니다.
pub struct Rule {
    actions: Vec<Arc<dyn Action>>,
}

impl Rule {
    /// 새 룰을 생성합니다.
    pub fn new(actions: Vec<Arc<dyn Action>>) -> Self {
        Self { actions }
    }

    /// 등록된 액션 목록
    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    /// 액션 수
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }
}

/// 룰셋
///
/// 세션과 배치 요소가 `Arc<Ruleset>`으로 공유합니다. 내부 변경은 구성
/// 로드 중에만 일어납니다.
impl std::fmt::Debug for Ruleset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ruleset").field("name", &self.name).finish_non_exhaustive()
    }
}

pub struct Ruleset {
    name: String,
    rules: RwLock<Vec<Arc<Rule>>>,
    /// `None`이면 기본 파서 체인을 상속
    parser_chain: RwLock<Option<Vec<Arc<dyn MsgParser>>>>,
    /// `None`이면 공유 메인 큐를 사용
    queue: OnceLock<Arc<dyn MsgQueue>>,
    /// 같은 룰셋에 대한 배치 디스패치를 직렬화하는 게이트
    dispatch_gate: tokio::sync::Mutex<()>,
}

impl Ruleset {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: RwLock::new(Vec::new()),
            parser_chain: RwLock::new(None),
            queue: OnceLock::new(),
            dispatch_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// 룰셋 이름
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 현재 룰 목록의 스냅샷을 반환합니다.
    pub fn rules_snapshot(&self) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 등록된 룰 수
    pub fn rule_count(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 전용 큐 (없으면 공유 메인 큐 사용)
    pub fn queue(&self) -> Option<&Arc<dyn MsgQueue>> {
        self.queue.get()
    }

    /// 룰셋 전용 파서 체인 (`None`이면 기본 체인 상속)
    pub fn parser_chain(&self) -> Option<Vec<Arc<dyn MsgParser>>> {
        self.parser_chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn dispatch_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.dispatch_gate
    }
}

/// 파서 카탈로그 -- 이름으로 등록된 파서와 기본 체인
///
/// `rulesetparser` 디렉티브가 이름으로 파서를 찾을 때 사용합니다.
#[derive(Default)]
pub struct ParserCatalog {
    by_name: HashMap<String, Arc<dyn MsgParser>>,
    default_chain: Vec<Arc<dyn MsgParser>>,
}

impl ParserCatalog {
    /// 빈 카탈로그를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 파서를 등록합니다.
    pub fn register(&mut self, parser: Arc<dyn MsgParser>) {
        self.by_name
            .insert(parser.name().to_ascii_lowercase(), parser);
    }

    /// 파서를 등록하고 기본 체인에도 추가합니다.
    pub fn register_default(&mut self, parser: Arc<dyn MsgParser>) {
        self.default_chain.push(Arc::clone(&parser));
        self.register(parser);
    }

    /// 이름으로 파서를 찾습니다 (대소문자 무시).
    pub fn find(&self, name: &str) -> Option<Arc<dyn MsgParser>> {
        self.by_name.get(&name.to_ascii_lowercase()).cloned()
    }

    /// 기본 파서 체인
    pub fn default_chain(&self) -> &[Arc<dyn MsgParser>] {
        &self.default_chain
    }

    /// 룰셋에 적용될 파서 체인을 반환합니다.
    ///
    /// 룰셋 전용 체인이 없으면 기본 체인을 상속합니다.
    pub fn chain_for(&self, ruleset: &Ruleset) -> Vec<Arc<dyn MsgParser>> {
        ruleset
            .parser_chain()
            .unwrap_or_else(|| self.default_chain.clone())
    }
}

/// 룰셋 레지스트리
///
/// 이름(대소문자 무시)으로 키된 룰셋 모음입니다. 삽입 순서를 보존하며,
/// 전체 액션 순회는 레지스트리 순서 → 룰 순서 → 액션 순서를 따릅니다.
#[derive(Default)]
pub struct RulesetRegistry {
    rulesets: Vec<Arc<Ruleset>>,
    index: HashMap<String, usize>,
    default_idx: Option<usize>,
    current_idx: Option<usize>,
}

impl RulesetRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 새 룰셋을 생성해 등록합니다.
    ///
    /// 같은 이름(대소문자 무시)이 이미 있으면 에러입니다. 새 룰셋이
    /// *current*가 되고, 아직 default가 없으면 default도 됩니다.
    pub fn construct(&mut self, name: &str) -> Result<Arc<Ruleset>, ConfigError> {
        let key = name.to_ascii_lowercase();
        if self.index.contains_key(&key) {
            return Err(ConfigError::DuplicateRuleset {
                name: name.to_owned(),
            });
        }
        let ruleset = Arc::new(Ruleset::new(name));
        let idx = self.rulesets.len();
        self.rulesets.push(Arc::clone(&ruleset));
        self.index.insert(key, idx);
        self.current_idx = Some(idx);
        if self.default_idx.is_none() {
            self.default_idx = Some(idx);
        }
        tracing::debug!(ruleset = name, "ruleset created");
        Ok(ruleset)
    }

    /// 이름으로 룰셋을 찾습니다 (대소문자 무시).
    pub fn get(&self, name: &str) -> Option<Arc<Ruleset>> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&idx| Arc::clone(&self.rulesets[idx]))
    }

    /// default 룰셋을 변경합니다.
    ///
    /// 이름을 찾지 못하면 아무 변경 없이 `false`를 반환합니다
    /// (레거시 의미 보존, 경고만 남김).
    pub fn set_default(&mut self, name: &str) -> bool {
        match self.index.get(&name.to_ascii_lowercase()) {
            Some(&idx) => {
                self.default_idx = Some(idx);
                true
            }
            None => {
                tracing::warn!(ruleset = name, "set_default: ruleset not found, unchanged");
                false
            }
        }
    }

    /// current 룰셋을 변경합니다. 의미는 [`set_default`](Self::set_default)와 같습니다.
    pub fn set_current(&mut self, name: &str) -> bool {
        match self.index.get(&name.to_ascii_lowercase()) {
            Some(&idx) => {
                self.current_idx = Some(idx);
                true
            }
            None => {
                tracing::warn!(ruleset = name, "set_current: ruleset not found, unchanged");
                false
            }
        }
    }

    /// default 룰셋
    pub fn default_ruleset(&self) -> Option<Arc<Ruleset>> {
        self.default_idx.map(|idx| Arc::clone(&self.rulesets[idx]))
    }

    /// current 룰셋
    pub fn current(&self) -> Option<Arc<Ruleset>> {
        self.current_idx.map(|idx| Arc::clone(&self.rulesets[idx]))
    }

    /// 등록된 룰셋 수
    pub fn len(&self) -> usize {
        self.rulesets.len()
    }

    /// 레지스트리가 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.rulesets.is_empty()
    }

    /// 삽입 순서대로 룰셋을 순회합니다.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Ruleset>> {
        self.rulesets.iter()
    }

    /// 룰을 룰셋 끝에 추가합니다.
    ///
    /// 액션이 없는 룰은 경고와 함께 버려지고 `false`를 반환합니다.
    pub fn add_rule(&self, ruleset: &Ruleset, rule: Rule) -> bool {
        if rule.action_count() == 0 {
            tracing::warn!(
                ruleset = ruleset.name(),
                "rule without actions will be discarded"
            );
            return false;
        }
        ruleset
            .rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(rule));
        true
    }

    /// current 룰셋에 파서를 추가합니다.
    ///
    /// 첫 번째 추가는 상속된 기본 체인을 대체하고, 이후 추가는 체인 끝에
    /// 덧붙습니다. 등록되지 않은 파서 이름이면 `ParserNotFound`입니다.
    pub fn add_parser(&self, catalog: &ParserCatalog, name: &str) -> Result<(), ConfigError> {
        let Some(current) = self.current() else {
            return Err(ConfigError::NoCurrentRuleset);
        };
        let Some(parser) = catalog.find(name) else {
            return Err(ConfigError::ParserNotFound {
                name: name.to_owned(),
            });
        };
        let mut chain = current
            .parser_chain
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match chain.as_mut() {
            Some(list) => list.push(parser),
            None => *chain = Some(vec![parser]),
        }
        tracing::debug!(parser = name, ruleset = current.name(), "parser added to ruleset");
        Ok(())
    }

    /// current 룰셋에 전용 큐를 연결합니다.
    ///
    /// current가 없으면 `NoCurrentRuleset`, 이미 큐가 있으면
    /// `QueueExists`입니다.
    pub fn attach_queue(&self, queue: Arc<dyn MsgQueue>) -> Result<(), ConfigError> {
        let Some(current) = self.current() else {
            return Err(ConfigError::NoCurrentRuleset);
        };
        current
            .queue
            .set(queue)
            .map_err(|_| ConfigError::QueueExists {
                ruleset: current.name().to_owned(),
            })?;
        tracing::debug!(ruleset = current.name(), "ruleset queue attached");
        Ok(())
    }

    /// 구성 로드를 마무리합니다.
    ///
    /// 룰셋이 하나도 없으면 에러이고, default가 아직 없으면 최초 생성된
    /// 룰셋이 default가 됩니다.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.rulesets.is_empty() {
            return Err(ConfigError::NoRulesets);
        }
        if self.default_idx.is_none() {
            self.default_idx = Some(0);
        }
        Ok(())
    }

    /// 시스템 전체의 모든 액션을 정확히 한 번씩 방문합니다.
    ///
    /// HUP 처리나 셧다운 시 사용합니다. 순서는 레지스트리 삽입 순서,
    /// 그 안에서 룰 삽입 순서, 그 안에서 액션 삽입 순서입니다.
    pub fn for_each_action<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<dyn Action>),
    {
        for ruleset in &self.rulesets {
            for rule in ruleset.rules_snapshot() {
                for action in rule.actions() {
                    f(action);
                }
            }
        }
    }

    /// 모든 룰셋과 전용 큐를 해체합니다.
    ///
    /// 해체 중 default/current가 이미 제거된 룰셋을 가리키는 일이 없도록
    /// 포인터를 먼저 비웁니다. 구성 리로드 중에도 호출할 수 있습니다.
    pub fn destroy_all(&mut self) {
        self.default_idx = None;
        self.current_idx = None;
        self.index.clear();
        for ruleset in self.rulesets.drain(..) {
            if let Some(queue) = ruleset.queue() {
                queue.close();
            }
        }
    }
}
