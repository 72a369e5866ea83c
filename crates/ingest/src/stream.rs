//! 스트림 드라이버 어댑터 -- 평문/TLS I/O와 피어 신원을 추상화합니다.
//!
//! TCP 서버는 이 어댑터를 통해서만 연결을 다룹니다. TLS 변형에서는
//! 수락이 핸드셰이크 완료까지를 포함하며, 클라이언트 인증서에서 검증된
//! 피어 이름(CN, DNS SAN) 또는 인증서 지문을 추출해 허용 피어 목록과
//! 대조합니다. 검증 실패 시 스트림은 버려지고 세션은 생성되지 않습니다.
//!
//! 인증서/키 프로비저닝은 이 크레이트의 범위 밖입니다. TLS 모드에서는
//! 호출측이 구성을 마친 [`TlsAcceptor`]를 전달해야 합니다.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use x509_parser::prelude::*;

use crate::error::IngestError;

/// TLS 핸드셰이크 제한 시간
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 스트림 드라이버 모드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverMode {
    /// 평문 TCP
    #[default]
    Plain,
    /// TLS, 클라이언트 인증서 없음
    TlsAnon,
    /// TLS, x509 클라이언트 인증
    TlsX509,
}

impl DriverMode {
    /// 레거시 디렉티브의 정수 코드에서 변환합니다.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Plain),
            1 => Some(Self::TlsAnon),
            2 => Some(Self::TlsX509),
            _ => None,
        }
    }

    /// TLS 모드 여부
    pub fn is_tls(&self) -> bool {
        !matches!(self, Self::Plain)
    }
}

/// TLS 피어 인증 방식
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// 인증서 검사 없음
    #[default]
    Anon,
    /// 인증서 이름(CN/SAN)을 허용 피어 패턴과 대조
    Name,
    /// 인증서 SHA-256 지문을 허용 피어 목록과 대조
    Fingerprint,
}

impl AuthMode {
    /// 레거시 디렉티브의 단어에서 변환합니다.
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "anon" => Some(Self::Anon),
            "name" | "x509/name" => Some(Self::Name),
            "fingerprint" | "x509/fingerprint" => Some(Self::Fingerprint),
            _ => None,
        }
    }
}

/// 수락된 피어 스트림
///
/// 평문과 TLS 스트림을 동일한 read/close 인터페이스로 제공합니다.
pub enum PeerStream {
    /// 평문 TCP 스트림
    Plain(TcpStream),
    /// 핸드셰이크가 완료된 TLS 스트림
    Tls(Box<TlsStream<TcpStream>>),
}

impl PeerStream {
    /// 스트림에서 바이트를 읽습니다. 0 반환은 원격의 정상 종료입니다.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf).await,
            Self::Tls(s) => s.read(buf).await,
        }
    }

    /// 쓰기 방향을 닫아 종료를 통지합니다.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.shutdown().await,
            Self::Tls(s) => s.shutdown().await,
        }
    }

    /// 피어 소켓 주소를 반환합니다.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Plain(s) => s.peer_addr(),
            Self::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

/// 스트림 드라이버
///
/// 모드와 인증 방식, 허용 피어 패턴을 묶어 연결 보안 처리를 수행합니다.
pub struct StreamDriver {
    mode: DriverMode,
    auth_mode: AuthMode,
    acceptor: Option<TlsAcceptor>,
    permitted_peers: Vec<String>,
}

impl StreamDriver {
    /// 평문 드라이버를 생성합니다.
    pub fn plain() -> Self {
        Self {
            mode: DriverMode::Plain,
            auth_mode: AuthMode::Anon,
            acceptor: None,
            permitted_peers: Vec::new(),
        }
    }

    /// TLS 드라이버를 생성합니다.
    pub fn tls(
        mode: DriverMode,
        auth_mode: AuthMode,
        acceptor: TlsAcceptor,
        permitted_peers: Vec<String>,
    ) -> Self {
        Self {
            mode,
            auth_mode,
            acceptor: Some(acceptor),
            permitted_peers,
        }
    }

    /// 드라이버 모드를 반환합니다.
    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    /// 리스닝 소켓을 엽니다.
    pub async fn open_listener(&self, bind_addr: &str) -> io::Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(bind_addr).await
    }

    /// 수락된 TCP 스트림을 보안 처리합니다.
    ///
    /// TLS 모드에서는 핸드셰이크를 완료하고 검증된 피어 이름을 추출한 뒤
    /// 허용 피어 패턴과 대조합니다. 반환값의 두 번째 요소가 검증된 피어
    /// 이름입니다 (평문/anon은 `None`).
    pub async fn secure(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(PeerStream, Option<String>), IngestError> {
        let Some(acceptor) = &self.acceptor else {
            return Ok((PeerStream::Plain(stream), None));
        };

        let tls = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                return Err(IngestError::PeerDenied {
                    peer: peer.to_string(),
                    reason: format!("tls handshake failed: {e}"),
                });
            }
            Err(_) => {
                return Err(IngestError::PeerDenied {
                    peer: peer.to_string(),
                    reason: "tls handshake timed out".to_owned(),
                });
            }
        };

        let verified = if self.mode == DriverMode::TlsX509 {
            self.verify_peer(&tls, peer)?
        } else {
            None
        };

        Ok((PeerStream::Tls(Box::new(tls)), verified))
    }

    /// 클라이언트 인증서에서 피어 신원을 추출하고 허용 목록과 대조합니다.
    fn verify_peer(
        &self,
        tls: &TlsStream<TcpStream>,
        peer: SocketAddr,
    ) -> Result<Option<String>, IngestError> {
        if self.auth_mode == AuthMode::Anon {
            return Ok(None);
        }

        let (_, conn) = tls.get_ref();
        let cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| IngestError::PeerDenied {
                peer: peer.to_string(),
                reason: "no client certificate presented".to_owned(),
            })?;

        match self.auth_mode {
            AuthMode::Anon => Ok(None),
            AuthMode::Name => {
                let names = cert_names(cert.as_ref());
                for name in &names {
                    if self
                        .permitted_peers
                        .iter()
                        .any(|p| peer_name_matches(p, name))
                    {
                        tracing::debug!(peer = %peer, name = %name, "tls peer name accepted");
                        return Ok(Some(name.clone()));
                    }
                }
                Err(IngestError::PeerDenied {
                    peer: peer.to_string(),
                    reason: format!("certificate names {names:?} not in permitted peers"),
                })
            }
            AuthMode::Fingerprint => {
                let fp = cert_fingerprint(cert.as_ref());
                if self
                    .permitted_peers
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(&fp))
                {
                    tracing::debug!(peer = %peer, "tls peer fingerprint accepted");
                    Ok(Some(fp))
                } else {
                    Err(IngestError::PeerDenied {
                        peer: peer.to_string(),
                        reason: format!("fingerprint {fp} not in permitted peers"),
                    })
                }
            }
        }
    }
}

/// 허용 피어 패턴 매칭. 선행 `*`는 접미사 와일드카드입니다.
pub fn peer_name_matches(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.to_ascii_lowercase()
            .ends_with(&suffix.to_ascii_lowercase())
    } else {
        pattern.eq_ignore_ascii_case(name)
    }
}

/// 인증서에서 후보 이름(CN + DNS SAN)을 추출합니다.
fn cert_names(der: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return names;
    };
    for cn in cert.subject().iter_common_name() {
        if let Ok(s) = cn.as_str() {
            names.push(s.to_owned());
        }
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                names.push((*dns).to_owned());
            }
        }
    }
    names
}

/// 인증서의 SHA-256 지문을 `SHA256:AA:BB:..` 형식으로 만듭니다.
fn cert_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    let mut out = String::with_capacity(7 + digest.len() * 3);
    out.push_str("SHA256");
    for byte in digest {
        out.push(':');
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_mode_from_code() {
        assert_eq!(DriverMode::from_code(0), Some(DriverMode::Plain));
        assert_eq!(DriverMode::from_code(1), Some(DriverMode::TlsAnon));
        assert_eq!(DriverMode::from_code(2), Some(DriverMode::TlsX509));
        assert_eq!(DriverMode::from_code(3), None);
        assert!(!DriverMode::Plain.is_tls());
        assert!(DriverMode::TlsAnon.is_tls());
    }

    #[test]
    fn auth_mode_parse() {
        assert_eq!(AuthMode::parse("anon"), Some(AuthMode::Anon));
        assert_eq!(AuthMode::parse("Name"), Some(AuthMode::Name));
        assert_eq!(AuthMode::parse("x509/name"), Some(AuthMode::Name));
        assert_eq!(AuthMode::parse("fingerprint"), Some(AuthMode::Fingerprint));
        assert_eq!(AuthMode::parse("bogus"), None);
    }

    #[test]
    fn peer_name_wildcard() {
        assert!(peer_name_matches("*.example.com", "client.example.com"));
        assert!(peer_name_matches("*.example.com", "a.b.Example.COM"));
        assert!(!peer_name_matches("*.example.com", "example.org"));
        assert!(peer_name_matches("client.example.com", "CLIENT.example.com"));
        assert!(!peer_name_matches("client.example.com", "other.example.com"));
    }

    #[test]
    fn fingerprint_format() {
        let fp = cert_fingerprint(b"not really a certificate");
        assert!(fp.starts_with("SHA256:"));
        // "SHA256" + 32바이트의 ":XX"
        assert_eq!(fp.len(), 6 + 32 * 3);
        assert!(fp[7..].split(':').all(|h| h.len() == 2));
    }

    #[test]
    fn cert_names_from_garbage_is_empty() {
        assert!(cert_names(b"garbage bytes").is_empty());
    }

    #[test]
    fn plain_driver_has_no_acceptor() {
        let driver = StreamDriver::plain();
        assert_eq!(driver.mode(), DriverMode::Plain);
    }
}
