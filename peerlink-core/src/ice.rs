//! Negotiation descriptors: ICE servers, ICE candidates and proxy settings

use crate::error::{PeerLinkError, PeerLinkResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// STUN or TURN server used during ICE gathering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URI, e.g. `stun:stun.example.org:19302`
    pub uri: String,
    /// Username (TURN only)
    pub username: Option<String>,
    /// Password (TURN only)
    pub password: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            password: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        uri: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Whether this is a TURN relay
    pub fn is_turn(&self) -> bool {
        self.uri.starts_with("turn:") || self.uri.starts_with("turns:")
    }

    /// Reject URIs with an unknown scheme and TURN servers without credentials
    pub fn validate(&self) -> PeerLinkResult<()> {
        if !ICE_SCHEMES.iter().any(|scheme| self.uri.starts_with(scheme)) {
            return Err(PeerLinkError::invalid_param(format!(
                "ICE server URI '{}' must use one of {:?}",
                self.uri, ICE_SCHEMES
            )));
        }
        if self.is_turn() && (self.username.is_none() || self.password.is_none()) {
            return Err(PeerLinkError::invalid_param(format!(
                "TURN server '{}' requires username and password",
                self.uri
            )));
        }
        Ok(())
    }
}

/// ICE candidate exchanged with the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    pub sdp_mid: String,
    /// Index of the m-line the candidate belongs to
    pub sdp_mline_index: i32,
}

impl IceCandidate {
    /// Create a candidate
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_mline_index: i32) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}:{}]", self.candidate, self.sdp_mid, self.sdp_mline_index)
    }
}

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    /// HTTPS CONNECT proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

/// Proxy used by the native engine for outbound traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy protocol
    pub kind: ProxyType,
    /// Proxy host name or address
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Hosts that bypass the proxy
    #[serde(default)]
    pub bypass: Vec<String>,
}

impl ProxyConfig {
    /// Proxy without authentication
    pub fn new(kind: ProxyType, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
            bypass: Vec::new(),
        }
    }

    /// Reject empty hosts and port zero
    pub fn validate(&self) -> PeerLinkResult<()> {
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(PeerLinkError::invalid_param(format!(
                "proxy address '{}:{}' is not usable",
                self.host, self.port
            )));
        }
        Ok(())
    }
}

/// Per-connection configuration handed to the native engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// ICE servers, tried in order
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// Optional proxy
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

impl ConnectionConfig {
    /// Configuration with the given ICE servers and no proxy
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            proxy: None,
        }
    }

    /// Attach a proxy
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Validate every server and the proxy
    pub fn validate(&self) -> PeerLinkResult<()> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    #[test]
    fn test_ice_server_validation() {
        assert!(IceServer::stun("stun:stun.example.org:19302").validate().is_ok());
        assert!(IceServer::turn("turn:relay.example.org", "user", "pw")
            .validate()
            .is_ok());

        let bad_scheme = IceServer::stun("http://example.org");
        assert_eq!(
            bad_scheme.validate().unwrap_err().code(),
            ResultCode::InvalidParam
        );

        let turn_without_creds = IceServer::stun("turns:relay.example.org");
        assert!(turn_without_creds.validate().is_err());
    }

    #[test]
    fn test_connection_config_validates_proxy() {
        let config = ConnectionConfig::new(vec![IceServer::stun("stun:a.example")])
            .with_proxy(ProxyConfig::new(ProxyType::Socks5, "", 1080));
        assert!(config.validate().is_err());

        let config = ConnectionConfig::new(vec![IceServer::stun("stun:a.example")])
            .with_proxy(ProxyConfig::new(ProxyType::Https, "proxy.local", 8443));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{"ice_servers":[{"uri":"stun:s.example","username":null,"password":null}]}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.proxy.is_none());
    }
}
