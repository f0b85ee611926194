//! Parses `<scheme>://<host>:<port>` address strings into a transport/host/port
//! triple. Grammar: `(udp|tcp)://(\*|<IPv4-literal>):<port>`.

use std::{fmt, net::Ipv4Addr, str::FromStr};

use thiserror::Error;

const MAX_HOST_LEN: usize = 15;

/// Transport named in the address string.
///
/// Only `Udp` is actually driven by [`crate::MsgBox`] today; `Tcp` parses
/// successfully (the grammar doesn't distinguish them lexically) but is
/// rejected with an `error` event at `listen`/`connect` time — see
/// `DESIGN.md` for the stream-transport hook this leaves in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        })
    }
}

/// `*` (bind-to-any) or a concrete IPv4 literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Any,
    Ip(Ipv4Addr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Any => f.write_str("*"),
            Host::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// A parsed `proto://host:port` address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub transport: Transport,
    pub host: Host,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.host, self.port)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address {0:?} is missing a \"://\" scheme separator")]
    MissingScheme(String),
    #[error("unknown scheme {0:?}, expected \"udp\" or \"tcp\"")]
    UnknownScheme(String),
    #[error("address is missing the host:port separator colon")]
    MissingColon,
    #[error("host {0:?} is empty or longer than {MAX_HOST_LEN} characters")]
    InvalidHost(String),
    #[error("host {0:?} is not \"*\" or a dotted-quad IPv4 literal")]
    UnparseableIp(String),
    #[error("port is empty")]
    EmptyPort,
    #[error("port {0:?} is not a base-10 16-bit unsigned integer")]
    InvalidPort(String),
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) =
            s.split_once("://").ok_or_else(|| AddressError::MissingScheme(s.to_string()))?;

        let transport = match scheme {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            other => return Err(AddressError::UnknownScheme(other.to_string())),
        };

        let (host_str, port_str) =
            rest.rsplit_once(':').ok_or(AddressError::MissingColon)?;

        if host_str.is_empty() || host_str.len() > MAX_HOST_LEN {
            return Err(AddressError::InvalidHost(host_str.to_string()));
        }

        let host = if host_str == "*" {
            Host::Any
        } else {
            Host::Ip(
                host_str
                    .parse::<Ipv4Addr>()
                    .map_err(|_| AddressError::UnparseableIp(host_str.to_string()))?,
            )
        };

        if port_str.is_empty() {
            return Err(AddressError::EmptyPort);
        }
        let port = port_str
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(port_str.to_string()))?;

        Ok(Address { transport, host, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_any_host() {
        let a: Address = "udp://*:9999".parse().unwrap();
        assert_eq!(a.transport, Transport::Udp);
        assert_eq!(a.host, Host::Any);
        assert_eq!(a.port, 9999);
    }

    #[test]
    fn parses_ipv4_host() {
        let a: Address = "udp://127.0.0.1:4040".parse().unwrap();
        assert_eq!(a.host, Host::Ip(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn parses_tcp_scheme() {
        let a: Address = "tcp://10.0.0.1:80".parse().unwrap();
        assert_eq!(a.transport, Transport::Tcp);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = "http://x:1".parse::<Address>().unwrap_err();
        assert!(matches!(err, AddressError::UnknownScheme(s) if s == "http"));
    }

    #[test]
    fn rejects_missing_scheme_separator() {
        let err = "udp:127.0.0.1:80".parse::<Address>().unwrap_err();
        assert!(matches!(err, AddressError::MissingScheme(_)));
    }

    #[test]
    fn rejects_missing_colon() {
        let err = "udp://127.0.0.1".parse::<Address>().unwrap_err();
        assert_eq!(err, AddressError::MissingColon);
    }

    #[test]
    fn rejects_five_part_dotted_quad() {
        let err = "udp://1.2.3.4.5:80".parse::<Address>().unwrap_err();
        assert!(matches!(err, AddressError::UnparseableIp(_)));
    }

    #[test]
    fn port_zero_and_max_parse() {
        assert_eq!("udp://*:0".parse::<Address>().unwrap().port, 0);
        assert_eq!("udp://*:65535".parse::<Address>().unwrap().port, 65535);
    }

    #[test]
    fn port_overflow_rejected() {
        let err = "udp://*:65536".parse::<Address>().unwrap_err();
        assert!(matches!(err, AddressError::InvalidPort(_)));
    }

    #[test]
    fn empty_port_rejected() {
        let err = "udp://*:".parse::<Address>().unwrap_err();
        assert_eq!(err, AddressError::EmptyPort);
    }

    #[test]
    fn round_trips_through_display() {
        let a: Address = "udp://192.168.1.1:4040".parse().unwrap();
        assert_eq!(a.to_string(), "udp://192.168.1.1:4040");
        let b: Address = "udp://*:9999".parse().unwrap();
        assert_eq!(b.to_string(), "udp://*:9999");
    }
}
