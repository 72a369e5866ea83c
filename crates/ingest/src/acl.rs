//! 피어 ACL — 접속 허용 여부 판정
//!
//! 전송 계층 레이블("TCP" 등)별로 허용/거부 패턴 목록을 유지하고,
//! 연결 수락 시점과 TLS 핸드셰이크 완료 후(검증된 피어 이름으로)
//! 각각 한 번씩 판정합니다.
//!
//! 판정 규칙:
//! - 해당 레이블에 패턴이 하나도 없으면 모두 허용
//! - 거부 패턴 매칭이 허용 패턴 매칭보다 우선
//! - 허용 패턴이 하나라도 있으면, 어떤 허용 패턴에도 걸리지 않는 피어는 거부
//! - 호스트명 패턴 판정에 FQDN이 필요한데 확보되지 않았으면 거부

use std::collections::HashMap;
use std::net::IpAddr;

/// 피어 매칭 패턴
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPattern {
    /// 단일 IP 주소
    Ip(IpAddr),
    /// IP 프리픽스 (`addr/len`)
    Prefix {
        /// 네트워크 주소
        addr: IpAddr,
        /// 프리픽스 길이
        bits: u8,
    },
    /// 호스트명 패턴. 선행 `*` 와일드카드를 지원합니다.
    Host(String),
}

impl PeerPattern {
    /// 문자열에서 패턴을 파싱합니다.
    ///
    /// `"10.0.0.0/8"`, `"192.168.1.5"`, `"*.example.com"`,
    /// `"host.example.com"` 형태를 받아들입니다.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty peer pattern".to_owned());
        }

        if let Some((addr_part, bits_part)) = text.split_once('/') {
            let addr: IpAddr = addr_part
                .parse()
                .map_err(|_| format!("invalid prefix address '{addr_part}'"))?;
            let bits: u8 = bits_part
                .parse()
                .map_err(|_| format!("invalid prefix length '{bits_part}'"))?;
            let max = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if bits > max {
                return Err(format!("prefix length {bits} exceeds {max}"));
            }
            return Ok(Self::Prefix { addr, bits });
        }

        if let Ok(addr) = text.parse::<IpAddr>() {
            return Ok(Self::Ip(addr));
        }

        Ok(Self::Host(text.to_ascii_lowercase()))
    }

    /// 피어 주소/호스트명이 이 패턴에 매칭되는지 확인합니다.
    ///
    /// 호스트명 패턴인데 `host`가 없으면 `None`을 반환합니다
    /// (판정 불가 — 호출측이 해석합니다).
    fn matches(&self, peer_addr: IpAddr, host: Option<&str>) -> Option<bool> {
        match self {
            Self::Ip(addr) => Some(*addr == peer_addr),
            Self::Prefix { addr, bits } => Some(prefix_matches(*addr, *bits, peer_addr)),
            Self::Host(pattern) => host.map(|h| host_matches(pattern, h)),
        }
    }

    fn needs_host(&self) -> bool {
        matches!(self, Self::Host(_))
    }
}

/// 프리픽스 매칭. 주소 패밀리가 다르면 매칭되지 않습니다.
fn prefix_matches(net: IpAddr, bits: u8, peer: IpAddr) -> bool {
    match (net, peer) {
        (IpAddr::V4(n), IpAddr::V4(p)) => {
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - u32::from(bits));
            (u32::from(n) & mask) == (u32::from(p) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(p)) => {
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - u32::from(bits));
            (u128::from(n) & mask) == (u128::from(p) & mask)
        }
        _ => false,
    }
}

/// 호스트명 매칭. 패턴은 소문자로 저장되며, 선행 `*`는 접미사 매칭입니다.
fn host_matches(pattern: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix('*') {
        host.ends_with(suffix)
    } else {
        host == *pattern
    }
}

/// 패턴 극성
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Allow,
    Deny,
}

/// 전송 계층별 피어 ACL
#[derive(Debug, Default)]
pub struct PeerAcl {
    /// 전송 레이블(대문자) -> 순서 있는 패턴 목록
    rules: HashMap<String, Vec<(Polarity, PeerPattern)>>,
}

impl PeerAcl {
    /// 빈 ACL을 생성합니다. 빈 ACL은 모든 피어를 허용합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 허용 패턴을 추가합니다.
    pub fn allow(&mut self, transport: &str, pattern: PeerPattern) {
        self.rules
            .entry(transport.to_ascii_uppercase())
            .or_default()
            .push((Polarity::Allow, pattern));
    }

    /// 거부 패턴을 추가합니다.
    pub fn deny(&mut self, transport: &str, pattern: PeerPattern) {
        self.rules
            .entry(transport.to_ascii_uppercase())
            .or_default()
            .push((Polarity::Deny, pattern));
    }

    /// 해당 전송 레이블에 패턴이 등록되어 있는지 확인합니다.
    pub fn has_rules(&self, transport: &str) -> bool {
        self.rules
            .get(&transport.to_ascii_uppercase())
            .is_some_and(|r| !r.is_empty())
    }

    /// 피어의 접속 허용 여부를 판정합니다.
    ///
    /// `host`에는 피어 FQDN 또는 (TLS 재판정 시) 검증된 피어 이름을
    /// 전달합니다. `resolve_dns`가 참인데 호스트명 패턴 판정에 필요한
    /// 이름이 없으면 허용하지 않습니다.
    pub fn is_allowed(
        &self,
        transport: &str,
        peer_addr: IpAddr,
        host: Option<&str>,
        resolve_dns: bool,
    ) -> bool {
        let Some(rules) = self.rules.get(&transport.to_ascii_uppercase()) else {
            return true;
        };
        if rules.is_empty() {
            return true;
        }

        if resolve_dns && host.is_none() && rules.iter().any(|(_, p)| p.needs_host()) {
            tracing::warn!(
                peer = %peer_addr,
                "hostname pattern requires a resolved name, denying peer"
            );
            return false;
        }

        let mut allow_present = false;
        let mut allowed = false;
        for (polarity, pattern) in rules {
            if *polarity == Polarity::Allow {
                allow_present = true;
            }
            if pattern.matches(peer_addr, host) == Some(true) {
                match polarity {
                    // 거부가 우선
                    Polarity::Deny => return false,
                    Polarity::Allow => allowed = true,
                }
            }
        }

        !allow_present || allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_acl_allows_everyone() {
        let acl = PeerAcl::new();
        assert!(acl.is_allowed("TCP", ip("203.0.113.9"), None, true));
    }

    #[test]
    fn single_ip_allow() {
        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("192.168.1.5").unwrap());
        assert!(acl.is_allowed("TCP", ip("192.168.1.5"), None, true));
        assert!(!acl.is_allowed("TCP", ip("192.168.1.6"), None, true));
    }

    #[test]
    fn prefix_allow() {
        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("10.0.0.0/8").unwrap());
        assert!(acl.is_allowed("TCP", ip("10.200.3.4"), None, true));
        assert!(!acl.is_allowed("TCP", ip("11.0.0.1"), None, true));
    }

    #[test]
    fn ipv6_prefix() {
        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("fd00::/8").unwrap());
        assert!(acl.is_allowed("TCP", ip("fd12::1"), None, true));
        assert!(!acl.is_allowed("TCP", ip("fe80::1"), None, true));
    }

    #[test]
    fn deny_wins_over_allow() {
        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("10.0.0.0/8").unwrap());
        acl.deny("TCP", PeerPattern::parse("10.1.2.3").unwrap());
        assert!(acl.is_allowed("TCP", ip("10.1.2.4"), None, true));
        assert!(!acl.is_allowed("TCP", ip("10.1.2.3"), None, true));
    }

    #[test]
    fn hostname_glob() {
        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("*.example.com").unwrap());
        assert!(acl.is_allowed("TCP", ip("10.0.0.1"), Some("Host1.Example.Com"), true));
        assert!(!acl.is_allowed("TCP", ip("10.0.0.1"), Some("host1.example.org"), true));
    }

    #[test]
    fn unresolved_host_is_denied_when_required() {
        let mut acl = PeerAcl::new();
        acl.allow("TCP", PeerPattern::parse("*.example.com").unwrap());
        assert!(!acl.is_allowed("TCP", ip("10.0.0.1"), None, true));
    }

    #[test]
    fn deny_only_list_defaults_to_allow() {
        let mut acl = PeerAcl::new();
        acl.deny("TCP", PeerPattern::parse("192.0.2.0/24").unwrap());
        assert!(acl.is_allowed("TCP", ip("198.51.100.1"), None, true));
        assert!(!acl.is_allowed("TCP", ip("192.0.2.17"), None, true));
    }

    #[test]
    fn transport_labels_are_case_insensitive_and_separate() {
        let mut acl = PeerAcl::new();
        acl.allow("tcp", PeerPattern::parse("192.168.1.5").unwrap());
        assert!(!acl.is_allowed("TCP", ip("192.168.1.6"), None, true));
        // 다른 전송 레이블에는 규칙이 없으므로 모두 허용
        assert!(acl.is_allowed("UDP", ip("192.168.1.6"), None, true));
    }

    #[test]
    fn pattern_parse_errors() {
        assert!(PeerPattern::parse("").is_err());
        assert!(PeerPattern::parse("10.0.0.0/33").is_err());
        assert!(PeerPattern::parse("10.0.0.0/x").is_err());
        assert!(PeerPattern::parse("nonsense/8").is_err());
    }

    #[test]
    fn zero_bit_prefix_matches_all_of_family() {
        assert!(prefix_matches(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
            ip("203.0.113.9")
        ));
        assert!(!prefix_matches(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, ip("::1")));
    }
}
