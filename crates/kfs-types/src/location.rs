use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a chunk server can be reached: hostname and port.
///
/// The `Display` form is `"<host> <port>"`, which is what the wire protocol
/// embeds in `Replicas:` lists; [`ServerLocation::id`] gives the compact
/// `host:port` form used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerLocation {
    pub hostname: String,
    pub port: u16,
}

impl ServerLocation {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// A location parsed from a HELLO is valid only with a non-empty host
    /// and a non-zero port.
    pub fn is_valid(&self) -> bool {
        !self.hostname.is_empty() && self.port != 0
    }

    /// Compact `host:port` identity string.
    pub fn id(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.hostname, self.port)
    }
}

impl FromStr for ServerLocation {
    type Err = String;

    /// Parse the `host:port` identity form.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in server location {:?}", s))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("bad port in server location {:?}", s))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_id() {
        let loc = ServerLocation::new("cs1.example.com", 30000);
        assert_eq!(format!("{}", loc), "cs1.example.com 30000");
        assert_eq!(loc.id(), "cs1.example.com:30000");
    }

    #[test]
    fn test_parse_roundtrip() {
        let loc: ServerLocation = "cs2:20100".parse().unwrap();
        assert_eq!(loc.hostname, "cs2");
        assert_eq!(loc.port, 20100);
        assert_eq!(loc.id().parse::<ServerLocation>().unwrap(), loc);
    }

    #[test]
    fn test_validity() {
        assert!(ServerLocation::new("h", 1).is_valid());
        assert!(!ServerLocation::new("", 1).is_valid());
        assert!(!ServerLocation::new("h", 0).is_valid());
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!("nocolon".parse::<ServerLocation>().is_err());
        assert!("host:notaport".parse::<ServerLocation>().is_err());
    }
}
