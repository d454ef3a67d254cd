use std::fmt;
use std::str::FromStr;

use crate::NetworkError;

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Tcp,
    Tls,
    Purb,
    /// In-process channels, see [`LocalNetwork`](crate::LocalNetwork).
    Local,
}

impl ConnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnType::Tcp => "tcp",
            ConnType::Tls => "tls",
            ConnType::Purb => "purb",
            ConnType::Local => "local",
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnType {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ConnType::Tcp),
            "tls" => Ok(ConnType::Tls),
            "purb" => Ok(ConnType::Purb),
            "local" => Ok(ConnType::Local),
            other => Err(NetworkError::UnsupportedConnType(other.to_string())),
        }
    }
}

/// Network address of a server, written `conntype://host:port`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address {
    conn_type: ConnType,
    host: String,
    port: u16,
}

impl Address {
    pub fn new(conn_type: ConnType, host: impl Into<String>, port: u16) -> Self {
        Self {
            conn_type,
            host: host.into(),
            port,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(ConnType::Tcp, host, port)
    }

    pub fn local(host: impl Into<String>, port: u16) -> Self {
        Self::new(ConnType::Local, host, port)
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A host is set. Port 0 is allowed and means "pick one" at bind time.
    pub fn valid(&self) -> bool {
        !self.host.is_empty()
    }

    /// Same address on another port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.conn_type, self.host.clone(), port)
    }

    /// `host:port`, brackets around IPv6 hosts.
    pub fn network_address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Address of the websocket surface: the transport port plus one.
    ///
    /// With `global` set the host is replaced by the unspecified address,
    /// which is what a listener binds to.
    pub fn websocket_address(&self, global: bool) -> Result<String, NetworkError> {
        let port = self
            .port
            .checked_add(1)
            .ok_or_else(|| NetworkError::InvalidAddress(format!("no websocket port above {self}")))?;
        let host = if global { "0.0.0.0" } else { self.host.as_str() };
        Ok(join_host_port(host, port))
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.conn_type, self.network_address())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidAddress(s.to_string());
        let (kind, rest) = s.split_once("://").ok_or_else(invalid)?;
        let conn_type: ConnType = kind.parse()?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(conn_type, host, port))
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let addr: Address = "tcp://127.0.0.1:2000".parse().unwrap();
        assert_eq!(addr.conn_type(), ConnType::Tcp);
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 2000);
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:2000");
        assert_eq!(addr.network_address(), "127.0.0.1:2000");
    }

    #[test]
    fn parse_ipv6() {
        let addr: Address = "tls://[::1]:7770".parse().unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.network_address(), "[::1]:7770");
        assert_eq!(addr.to_string(), "tls://[::1]:7770");
    }

    #[test]
    fn rejects_garbage() {
        assert!("127.0.0.1:2000".parse::<Address>().is_err());
        assert!("udp://127.0.0.1:2000".parse::<Address>().is_err());
        assert!("tcp://127.0.0.1".parse::<Address>().is_err());
        assert!("tcp://:2000".parse::<Address>().is_err());
        assert!("tcp://host:99999".parse::<Address>().is_err());
    }

    #[test]
    fn websocket_port_is_one_above() {
        let addr = Address::tcp("10.0.0.1", 7000);
        assert_eq!(addr.websocket_address(false).unwrap(), "10.0.0.1:7001");
        assert_eq!(addr.websocket_address(true).unwrap(), "0.0.0.0:7001");
        assert!(Address::tcp("h", u16::MAX).websocket_address(false).is_err());
    }

    #[test]
    fn serde_as_string() {
        let addr = Address::local("127.0.0.1", 2000);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"local://127.0.0.1:2000\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
