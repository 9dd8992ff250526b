//! Socket address families and access control for bridged tubes and file transfers.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Address family of a local bridge socket. Discriminants match the transport's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SocketAddressType {
    Unix = 0,
    AbstractUnix = 1,
    Ipv4 = 2,
    Ipv6 = 3,
}

impl SocketAddressType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Unix),
            1 => Some(Self::AbstractUnix),
            2 => Some(Self::Ipv4),
            3 => Some(Self::Ipv6),
            _ => None,
        }
    }
}

/// Who may connect to a bridge socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SocketAccessControl {
    Localhost = 0,
    Port = 1,
    Netmask = 2,
    Credentials = 3,
}

/// Socket families a remote end advertises, each with the access controls it accepts.
pub type SocketTypeMap = BTreeMap<SocketAddressType, Vec<SocketAccessControl>>;

/// Families this side can bridge, most preferred first.
pub const LOCAL_SOCKET_TYPES: &[SocketAddressType] =
    &[SocketAddressType::Unix, SocketAddressType::Ipv4];

/// Pick the first locally preferred family the remote advertises with localhost access.
pub fn negotiate_socket_type(
    local: &[SocketAddressType],
    remote: &SocketTypeMap,
) -> Option<SocketAddressType> {
    local.iter().copied().find(|t| {
        remote
            .get(t)
            .map(|acs| acs.contains(&SocketAccessControl::Localhost))
            .unwrap_or(false)
    })
}

/// Local address of a negotiated bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeAddress {
    Unix(PathBuf),
    AbstractUnix(Vec<u8>),
    Inet(SocketAddr),
}

impl BridgeAddress {
    /// Decode the raw address bytes the transport returns for `socket_type`.
    pub fn from_bytes(socket_type: SocketAddressType, bytes: &[u8]) -> Result<Self, AddressError> {
        match socket_type {
            SocketAddressType::Unix => {
                let s = std::str::from_utf8(bytes).map_err(|_| AddressError::NotUtf8)?;
                let s = s.trim_end_matches('\0');
                if s.is_empty() {
                    return Err(AddressError::Empty);
                }
                Ok(Self::Unix(PathBuf::from(s)))
            }
            SocketAddressType::AbstractUnix => {
                if bytes.is_empty() {
                    return Err(AddressError::Empty);
                }
                Ok(Self::AbstractUnix(bytes.to_vec()))
            }
            SocketAddressType::Ipv4 | SocketAddressType::Ipv6 => {
                let s = std::str::from_utf8(bytes).map_err(|_| AddressError::NotUtf8)?;
                let addr: SocketAddr = s
                    .parse()
                    .map_err(|_| AddressError::BadInet(s.to_string()))?;
                let family_ok = match socket_type {
                    SocketAddressType::Ipv4 => addr.is_ipv4(),
                    _ => addr.is_ipv6(),
                };
                if !family_ok {
                    return Err(AddressError::BadInet(s.to_string()));
                }
                Ok(Self::Inet(addr))
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Unix(p) => p.to_string_lossy().into_owned().into_bytes(),
            Self::AbstractUnix(b) => b.clone(),
            Self::Inet(a) => a.to_string().into_bytes(),
        }
    }

    pub fn socket_type(&self) -> SocketAddressType {
        match self {
            Self::Unix(_) => SocketAddressType::Unix,
            Self::AbstractUnix(_) => SocketAddressType::AbstractUnix,
            Self::Inet(a) if a.is_ipv4() => SocketAddressType::Ipv4,
            Self::Inet(_) => SocketAddressType::Ipv6,
        }
    }
}

impl fmt::Display for BridgeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(p) => write!(f, "unix:{}", p.display()),
            Self::AbstractUnix(b) => write!(f, "unix-abstract:{}", String::from_utf8_lossy(b)),
            Self::Inet(a) => write!(f, "tcp:{}", a),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty bridge address")]
    Empty,
    #[error("bridge address is not valid UTF-8")]
    NotUtf8,
    #[error("invalid inet bridge address {0:?}")]
    BadInet(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(entries: &[(SocketAddressType, &[SocketAccessControl])]) -> SocketTypeMap {
        entries.iter().map(|(t, a)| (*t, a.to_vec())).collect()
    }

    #[test]
    fn negotiate_prefers_local_order() {
        let r = remote(&[
            (SocketAddressType::Ipv4, &[SocketAccessControl::Localhost]),
            (SocketAddressType::Unix, &[SocketAccessControl::Localhost]),
        ]);
        assert_eq!(
            negotiate_socket_type(LOCAL_SOCKET_TYPES, &r),
            Some(SocketAddressType::Unix)
        );
    }

    #[test]
    fn negotiate_falls_back_to_ipv4() {
        let r = remote(&[(SocketAddressType::Ipv4, &[SocketAccessControl::Localhost])]);
        assert_eq!(
            negotiate_socket_type(LOCAL_SOCKET_TYPES, &r),
            Some(SocketAddressType::Ipv4)
        );
    }

    #[test]
    fn negotiate_requires_localhost_access() {
        let r = remote(&[(SocketAddressType::Unix, &[SocketAccessControl::Credentials])]);
        assert_eq!(negotiate_socket_type(LOCAL_SOCKET_TYPES, &r), None);
    }

    #[test]
    fn negotiate_nothing_in_common() {
        let r = remote(&[(SocketAddressType::Ipv6, &[SocketAccessControl::Localhost])]);
        assert_eq!(negotiate_socket_type(LOCAL_SOCKET_TYPES, &r), None);
        assert_eq!(negotiate_socket_type(&[], &r), None);
    }

    #[test]
    fn decode_unix_strips_nul() {
        let a = BridgeAddress::from_bytes(SocketAddressType::Unix, b"/tmp/tube-1\0").unwrap();
        assert_eq!(a, BridgeAddress::Unix(PathBuf::from("/tmp/tube-1")));
        assert_eq!(a.to_string(), "unix:/tmp/tube-1");
    }

    #[test]
    fn decode_inet_checks_family() {
        let a = BridgeAddress::from_bytes(SocketAddressType::Ipv4, b"127.0.0.1:4000").unwrap();
        assert_eq!(a.socket_type(), SocketAddressType::Ipv4);
        assert!(matches!(
            BridgeAddress::from_bytes(SocketAddressType::Ipv6, b"127.0.0.1:4000"),
            Err(AddressError::BadInet(_))
        ));
    }

    #[test]
    fn decode_empty_fails() {
        assert_eq!(
            BridgeAddress::from_bytes(SocketAddressType::Unix, b""),
            Err(AddressError::Empty)
        );
    }
}
