//! 모듈 설정과 레거시 디렉티브 로더
//!
//! 설정은 두 스냅샷으로 존재합니다: 로드 중의 가변 스냅샷
//! ([`ConfLoader`])과 활성화 이후의 불변 실행 스냅샷. 로더는 디렉티브를
//! 한 줄씩 받아 모듈 전역 설정, 리스너 인스턴스, 룰셋 레지스트리에
//! 반영하고, 활성화 시점에 통째로 소비됩니다.
//!
//! 디렉티브는 대소문자를 구분하지 않으며 선행 `$`는 무시됩니다.
//! `inputtcpserverinputname`, `inputtcpserverbindruleset`,
//! `inputtcpserversupportoctetcountedframing`은 스크래치 변수로, 다음
//! `inputtcpserverrun`이 소비합니다. `resetconfigvariables`는 스크래치
//! 상태를 기본값으로 되돌립니다.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use logport_core::error::ConfigError;

use crate::acl::PeerAcl;
use crate::queue::ChannelQueue;
use crate::ruleset::{ParserCatalog, Ruleset, RulesetRegistry};
use crate::stream::{AuthMode, DriverMode};

/// 기본 세션 상한
pub const DFLT_SESS_MAX: usize = 200;
/// 기본 리스너 상한
pub const DFLT_LSTN_MAX: usize = 20;
/// `inputtcpserverrun`에 포트가 없을 때의 기본 포트
pub const DFLT_PORT: &str = "10514";
/// 기본 입력 이름 태그
pub const DFLT_INPUT_NAME: &str = "tcp";
/// 초기 룰셋 이름
pub const DFLT_RULESET_NAME: &str = "default";

/// 모듈 전역 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 동시 세션 상한
    pub max_sessions: usize,
    /// 리스너 상한
    pub max_listeners: usize,
    /// 스트림 드라이버 모드
    pub driver_mode: DriverMode,
    /// TLS 피어 인증 방식 (미지정이면 드라이버 기본값)
    pub auth_mode: Option<AuthMode>,
    /// TLS 허용 피어 패턴
    pub permitted_peers: Vec<String>,
    /// 추가 프레임 구분자 바이트
    pub addtl_frame_delim: Option<u8>,
    /// LF 구분자 비활성화
    pub disable_lf_delim: bool,
    /// 수신 메시지를 light-delayable로 표시
    pub use_flow_control: bool,
    /// 수락된 스트림에 TCP keep-alive 설정
    pub keep_alive: bool,
    /// 세션 종료 시 합성 통지 메시지 주입
    pub emit_msg_on_close: bool,
    /// 리스너 기본 octet-counting 허용 여부
    pub default_octet_framing: bool,
    /// keep-alive 미사용 시 유휴 세션 정리 시간 (0이면 없음)
    pub idle_timeout_secs: u64,
    /// 큐 용량 (메인 큐와 룰셋 전용 큐 공통)
    pub queue_capacity: usize,
    /// 디스패치 배치 크기
    pub batch_size: usize,
    /// 리스너 바인드 호스트
    pub bind_host: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            max_sessions: DFLT_SESS_MAX,
            max_listeners: DFLT_LSTN_MAX,
            driver_mode: DriverMode::Plain,
            auth_mode: None,
            permitted_peers: Vec::new(),
            addtl_frame_delim: None,
            disable_lf_delim: false,
            use_flow_control: false,
            keep_alive: false,
            emit_msg_on_close: false,
            default_octet_framing: true,
            idle_timeout_secs: 0,
            queue_capacity: 10_000,
            batch_size: 128,
            bind_host: "0.0.0.0".to_owned(),
        }
    }
}

impl ModuleConfig {
    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const MAX_SESSIONS_LIMIT: usize = 100_000;
        const MAX_LISTENERS_LIMIT: usize = 1_000;
        const MAX_IDLE_SECS: u64 = 86_400;

        if self.max_sessions == 0 || self.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidValue {
                directive: "inputtcpmaxsessions".to_owned(),
                reason: format!("must be 1-{MAX_SESSIONS_LIMIT}"),
            });
        }
        if self.max_listeners == 0 || self.max_listeners > MAX_LISTENERS_LIMIT {
            return Err(ConfigError::InvalidValue {
                directive: "inputtcpmaxlisteners".to_owned(),
                reason: format!("must be 1-{MAX_LISTENERS_LIMIT}"),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                directive: "queue_capacity".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                directive: "batch_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.idle_timeout_secs > MAX_IDLE_SECS {
            return Err(ConfigError::InvalidValue {
                directive: "idle_timeout_secs".to_owned(),
                reason: format!("must be 0-{MAX_IDLE_SECS}"),
            });
        }
        if matches!(self.auth_mode, Some(AuthMode::Name | AuthMode::Fingerprint))
            && self.driver_mode != DriverMode::TlsX509
        {
            return Err(ConfigError::InvalidValue {
                directive: "inputtcpserverstreamdriverauthmode".to_owned(),
                reason: "name/fingerprint auth requires x509 driver mode".to_owned(),
            });
        }
        Ok(())
    }
}

/// 리스너 인스턴스 설정
///
/// 구성 로드 중 생성되어 활성화 시점에 한 번 소비됩니다.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// 바인드 포트 (문자열 -- 숫자 포트)
    pub bind_port: String,
    /// 바인딩할 룰셋 이름 (미지정이면 default)
    pub bind_ruleset_name: Option<String>,
    /// 활성화 시점에 해석된 룰셋
    pub resolved_ruleset: Weak<Ruleset>,
    /// 입력 이름 태그 (미지정이면 기본 태그)
    pub input_name: Option<String>,
    /// octet-counting 프레이밍 허용 여부
    pub support_octet_framing: bool,
}

/// `inputtcpserverrun`이 소비하는 스크래치 디렉티브 상태
#[derive(Debug)]
struct ScratchVars {
    input_name: Option<String>,
    bind_ruleset: Option<String>,
    octet_framing: bool,
}

impl ScratchVars {
    fn reset(&mut self) {
        self.input_name = None;
        self.bind_ruleset = None;
        self.octet_framing = true;
    }
}

impl Default for ScratchVars {
    fn default() -> Self {
        Self {
            input_name: None,
            bind_ruleset: None,
            octet_framing: true,
        }
    }
}

/// 구성 로드 스냅샷
///
/// 디렉티브 적용 대상이 되는 가변 상태 전부(모듈 설정, 인스턴스 목록,
/// 룰셋 레지스트리, 파서 카탈로그, ACL)를 소유합니다. 전역 상태는
/// 없습니다.
pub struct ConfLoader {
    conf: ModuleConfig,
    scratch: ScratchVars,
    instances: Vec<InstanceConfig>,
    rulesets: RulesetRegistry,
    parsers: ParserCatalog,
    acl: PeerAcl,
}

impl ConfLoader {
    /// 새 로더를 생성합니다.
    ///
    /// 초기 룰셋(`default`)이 만들어져 default이자 current가 됩니다.
    pub fn new() -> Self {
        let mut rulesets = RulesetRegistry::new();
        // 빈 이름 공간에서 시작하므로 실패하지 않는다
        let _ = rulesets.construct(DFLT_RULESET_NAME);
        Self {
            conf: ModuleConfig::default(),
            scratch: ScratchVars::default(),
            instances: Vec::new(),
            rulesets,
            parsers: ParserCatalog::new(),
            acl: PeerAcl::new(),
        }
    }

    /// 모듈 설정
    pub fn config(&self) -> &ModuleConfig {
        &self.conf
    }

    /// 모듈 설정 (프로그램적 구성용)
    pub fn config_mut(&mut self) -> &mut ModuleConfig {
        &mut self.conf
    }

    /// 리스너 인스턴스 목록
    pub fn instances(&self) -> &[InstanceConfig] {
        &self.instances
    }

    /// 룰셋 레지스트리
    pub fn rulesets(&self) -> &RulesetRegistry {
        &self.rulesets
    }

    /// 룰셋 레지스트리 (프로그램적 구성용)
    pub fn rulesets_mut(&mut self) -> &mut RulesetRegistry {
        &mut self.rulesets
    }

    /// 파서 카탈로그 (프로그램적 구성용)
    pub fn parsers_mut(&mut self) -> &mut ParserCatalog {
        &mut self.parsers
    }

    /// 피어 ACL (프로그램적 구성용)
    pub fn acl_mut(&mut self) -> &mut PeerAcl {
        &mut self.acl
    }

    /// 로더를 구성 요소로 분해합니다. 활성화 경로가 사용합니다.
    pub(crate) fn into_parts(
        self,
    ) -> (
        ModuleConfig,
        Vec<InstanceConfig>,
        RulesetRegistry,
        ParserCatalog,
        PeerAcl,
    ) {
        (
            self.conf,
            self.instances,
            self.rulesets,
            self.parsers,
            self.acl,
        )
    }

    /// 여러 줄의 디렉티브 텍스트를 적용합니다.
    ///
    /// 빈 줄과 `#` 주석은 무시합니다. 룰셋 단위 디렉티브의 거부
    /// (`NoCurrentRuleset`, `ParserNotFound`, `QueueExists`)는 경고 후
    /// 계속 진행하고, 그 외 에러는 로드를 중단시킵니다.
    pub fn load_str(&mut self, text: &str) -> Result<(), ConfigError> {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.apply_directive(line) {
                Ok(()) => {}
                Err(e) if directive_is_skippable(&e) => {
                    tracing::warn!(line = lineno + 1, error = %e, "directive rejected");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 디렉티브 한 줄을 적용합니다.
    pub fn apply_directive(&mut self, line: &str) -> Result<(), ConfigError> {
        let line = line.trim();
        let line = line.strip_prefix('$').unwrap_or(line);
        let (name, arg) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let lname = name.to_ascii_lowercase();

        match lname.as_str() {
            "inputtcpserverrun" => {
                let port = if arg.is_empty() { DFLT_PORT } else { arg };
                self.instances.push(InstanceConfig {
                    bind_port: port.to_owned(),
                    bind_ruleset_name: self.scratch.bind_ruleset.clone(),
                    resolved_ruleset: Weak::new(),
                    input_name: self.scratch.input_name.clone(),
                    support_octet_framing: self.scratch.octet_framing,
                });
                Ok(())
            }
            "inputtcpserverkeepalive" => {
                self.conf.keep_alive = parse_bool(&lname, arg)?;
                Ok(())
            }
            "inputtcpserversupportoctetcountedframing" => {
                let value = parse_bool(&lname, arg)?;
                self.scratch.octet_framing = value;
                self.conf.default_octet_framing = value;
                Ok(())
            }
            "inputtcpmaxsessions" => {
                self.conf.max_sessions = parse_positive(&lname, arg)?;
                Ok(())
            }
            "inputtcpmaxlisteners" => {
                self.conf.max_listeners = parse_positive(&lname, arg)?;
                Ok(())
            }
            "inputtcpservernotifyonconnectionclose" => {
                self.conf.emit_msg_on_close = parse_bool(&lname, arg)?;
                Ok(())
            }
            "inputtcpserverstreamdrivermode" => {
                let code = parse_int(&lname, arg)?;
                self.conf.driver_mode =
                    DriverMode::from_code(code).ok_or_else(|| ConfigError::InvalidValue {
                        directive: lname.clone(),
                        reason: format!("unknown driver mode {code}"),
                    })?;
                Ok(())
            }
            "inputtcpserverstreamdriverauthmode" => {
                let word = parse_word(&lname, arg)?;
                self.conf.auth_mode =
                    Some(AuthMode::parse(word).ok_or_else(|| ConfigError::InvalidValue {
                        directive: lname.clone(),
                        reason: format!("unknown auth mode '{word}'"),
                    })?);
                Ok(())
            }
            "inputtcpserverstreamdriverpermittedpeer" => {
                let word = parse_word(&lname, arg)?;
                self.conf.permitted_peers.push(word.to_owned());
                Ok(())
            }
            "inputtcpserveraddtlframedelimiter" => {
                let value = parse_int(&lname, arg)?;
                self.conf.addtl_frame_delim = match value {
                    -1 => None,
                    0..=255 => Some(value as u8),
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            directive: lname.clone(),
                            reason: "must be -1 or a byte value 0-255".to_owned(),
                        });
                    }
                };
                Ok(())
            }
            "inputtcpserverdisablelfdelimiter" => {
                self.conf.disable_lf_delim = parse_bool(&lname, arg)?;
                Ok(())
            }
            "inputtcpserverinputname" => {
                self.scratch.input_name = Some(parse_word(&lname, arg)?.to_owned());
                Ok(())
            }
            "inputtcpserverbindruleset" => {
                self.scratch.bind_ruleset = Some(parse_word(&lname, arg)?.to_owned());
                Ok(())
            }
            "inputtcpflowcontrol" => {
                self.conf.use_flow_control = parse_bool(&lname, arg)?;
                Ok(())
            }
            "ruleset" => {
                let word = parse_word(&lname, arg)?;
                self.rulesets.construct(word)?;
                Ok(())
            }
            "rulesetparser" => {
                let word = parse_word(&lname, arg)?;
                self.rulesets.add_parser(&self.parsers, word)
            }
            "rulesetcreatemainqueue" => {
                if !parse_bool(&lname, arg)? {
                    // 꺼져 있으면 아무것도 바꾸지 않는다
                    return Ok(());
                }
                let Some(current) = self.rulesets.current() else {
                    return Err(ConfigError::NoCurrentRuleset);
                };
                let queue = ChannelQueue::new(
                    format!("ruleset:{}", current.name()),
                    self.conf.queue_capacity,
                );
                self.rulesets.attach_queue(Arc::new(queue))
            }
            "resetconfigvariables" => {
                self.scratch.reset();
                Ok(())
            }
            _ => Err(ConfigError::UnknownDirective {
                directive: name.to_owned(),
            }),
        }
    }
}

impl Default for ConfLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// 거부되어도 구성 로드를 중단시키지 않는 디렉티브 에러인지 판별합니다.
fn directive_is_skippable(err: &ConfigError) -> bool {
    matches!(
        err,
        ConfigError::NoCurrentRuleset
            | ConfigError::ParserNotFound { .. }
            | ConfigError::QueueExists { .. }
    )
}

fn parse_bool(directive: &str, arg: &str) -> Result<bool, ConfigError> {
    match arg.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            directive: directive.to_owned(),
            reason: format!("expected on/off, got '{arg}'"),
        }),
    }
}

fn parse_int(directive: &str, arg: &str) -> Result<i64, ConfigError> {
    arg.parse().map_err(|_| ConfigError::InvalidValue {
        directive: directive.to_owned(),
        reason: format!("expected integer, got '{arg}'"),
    })
}

fn parse_positive(directive: &str, arg: &str) -> Result<usize, ConfigError> {
    let value = parse_int(directive, arg)?;
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            directive: directive.to_owned(),
            reason: "must be greater than 0".to_owned(),
        })
}

fn parse_word<'a>(directive: &str, arg: &'a str) -> Result<&'a str, ConfigError> {
    if arg.is_empty() {
        return Err(ConfigError::InvalidValue {
            directive: directive.to_owned(),
            reason: "missing argument".to_owned(),
        });
    }
    Ok(arg)
}
