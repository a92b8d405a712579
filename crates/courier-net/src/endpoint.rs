use std::{
    ffi::CString,
    mem::offset_of,
    net::{Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    path::PathBuf,
    str::FromStr,
};

use thiserror::Error;

/// A Unix-domain socket name: filesystem path, abstract (leading NUL)
/// name, or the unnamed address of an unbound socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnixAddress {
    Path(PathBuf),
    Abstract(Vec<u8>),
    Unnamed,
}

/// A typed peer or local address with equality and hashing.
///
/// Textual form: `tcp://HOST:PORT` (IPv4 dotted or bracketed IPv6 with an
/// optional `%interface` scope), `unix:///path`, `unix://@name` (abstract).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp(SocketAddrV4),
    Tcp6(SocketAddrV6),
    Unix(UnixAddress),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("missing `tcp://` or `unix://` scheme")]
    MissingScheme,
    #[error("invalid tcp address")]
    InvalidAddress,
    #[error("unknown network interface `{0}`")]
    UnknownInterface(String),
    #[error("unix socket name must start with `/` or `@`")]
    InvalidUnixName,
    #[error("unix socket name does not fit in sockaddr_un")]
    UnixNameTooLong,
}

/// Longest unix name that fits `sun_path` with room for the NUL / marker
/// byte.
const UNIX_NAME_MAX: usize = 107;

impl Endpoint {
    pub fn domain(&self) -> libc::c_int {
        match self {
            Self::Tcp(_) => libc::AF_INET,
            Self::Tcp6(_) => libc::AF_INET6,
            Self::Unix(_) => libc::AF_UNIX,
        }
    }

    pub fn is_inet(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::Tcp6(_))
    }

    pub(crate) fn to_raw(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        match self {
            Self::Tcp(addr) => {
                let sin = (&raw mut storage).cast::<libc::sockaddr_in>();
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = addr.port().to_be();
                    (*sin).sin_addr.s_addr = u32::from(*addr.ip()).to_be();
                }
                (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            Self::Tcp6(addr) => {
                let sin6 = (&raw mut storage).cast::<libc::sockaddr_in6>();
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = addr.port().to_be();
                    (*sin6).sin6_addr.s6_addr = addr.ip().octets();
                    (*sin6).sin6_scope_id = addr.scope_id();
                }
                (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
            Self::Unix(name) => {
                let sun = (&raw mut storage).cast::<libc::sockaddr_un>();
                unsafe {
                    (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;
                }
                let base = offset_of!(libc::sockaddr_un, sun_path);
                let path = unsafe { &mut (*sun).sun_path };
                let len = match name {
                    UnixAddress::Path(p) => {
                        let bytes = p.as_os_str().as_encoded_bytes();
                        for (dst, src) in path.iter_mut().zip(bytes) {
                            *dst = *src as libc::c_char;
                        }
                        // Terminating NUL is already there from the zeroed
                        // storage.
                        base + bytes.len() + 1
                    }
                    UnixAddress::Abstract(n) => {
                        for (dst, src) in path[1..].iter_mut().zip(n) {
                            *dst = *src as libc::c_char;
                        }
                        base + 1 + n.len()
                    }
                    UnixAddress::Unnamed => base,
                };
                (storage, len as libc::socklen_t)
            }
        }
    }

    pub(crate) fn from_raw(
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> Option<Self> {
        match libc::c_int::from(storage.ss_family) {
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Some(Self::Tcp(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(Self::Tcp6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    0,
                    sin6.sin6_scope_id,
                )))
            }
            libc::AF_UNIX => {
                let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
                let base = offset_of!(libc::sockaddr_un, sun_path);
                let len = (len as usize).saturating_sub(base);
                if len == 0 {
                    return Some(Self::Unix(UnixAddress::Unnamed));
                }
                let bytes: Vec<u8> =
                    sun.sun_path[..len].iter().map(|&c| c as u8).collect();
                if bytes[0] == 0 {
                    Some(Self::Unix(UnixAddress::Abstract(bytes[1..].to_vec())))
                } else {
                    use std::os::unix::ffi::OsStringExt;
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    let os = std::ffi::OsString::from_vec(bytes[..end].to_vec());
                    Some(Self::Unix(UnixAddress::Path(PathBuf::from(os))))
                }
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => Self::Tcp(addr),
            SocketAddr::V6(addr) => Self::Tcp6(addr),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Tcp6(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(UnixAddress::Path(path)) => write!(f, "unix://{}", path.display()),
            Self::Unix(UnixAddress::Abstract(name)) => {
                write!(f, "unix://@{}", String::from_utf8_lossy(name))
            }
            Self::Unix(UnixAddress::Unnamed) => write!(f, "unix://"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            return parse_tcp(rest);
        }
        if let Some(rest) = s.strip_prefix("unix://") {
            return parse_unix(rest);
        }
        Err(EndpointParseError::MissingScheme)
    }
}

fn parse_tcp(rest: &str) -> Result<Endpoint, EndpointParseError> {
    if let Ok(addr) = rest.parse::<SocketAddr>() {
        return Ok(addr.into());
    }

    // Bracketed IPv6 with a named scope: tcp://[fe80::1%eth0]:4444.
    let inner = rest.strip_prefix('[').ok_or(EndpointParseError::InvalidAddress)?;
    let (inner, port) = inner.split_once(']').ok_or(EndpointParseError::InvalidAddress)?;
    let port = port
        .strip_prefix(':')
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or(EndpointParseError::InvalidAddress)?;
    let (ip, interface) =
        inner.split_once('%').ok_or(EndpointParseError::InvalidAddress)?;
    let ip: Ipv6Addr = ip.parse().map_err(|_| EndpointParseError::InvalidAddress)?;

    let name = CString::new(interface).map_err(|_| EndpointParseError::InvalidAddress)?;
    let scope = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if scope == 0 {
        return Err(EndpointParseError::UnknownInterface(interface.to_string()));
    }

    Ok(Endpoint::Tcp6(SocketAddrV6::new(ip, port, 0, scope)))
}

fn parse_unix(rest: &str) -> Result<Endpoint, EndpointParseError> {
    if let Some(name) = rest.strip_prefix('@') {
        if name.len() > UNIX_NAME_MAX {
            return Err(EndpointParseError::UnixNameTooLong);
        }
        return Ok(Endpoint::Unix(UnixAddress::Abstract(name.as_bytes().to_vec())));
    }
    if rest.starts_with('/') {
        if rest.len() > UNIX_NAME_MAX {
            return Err(EndpointParseError::UnixNameTooLong);
        }
        return Ok(Endpoint::Unix(UnixAddress::Path(PathBuf::from(rest))));
    }
    Err(EndpointParseError::InvalidUnixName)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4() {
        let endpoint: Endpoint = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 5555))
        );
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let endpoint: Endpoint = "tcp://[::1]:80".parse().unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Tcp6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 80, 0, 0))
        );
    }

    #[test]
    fn parses_ipv6_with_numeric_scope() {
        let endpoint: Endpoint = "tcp://[fe80::1%3]:80".parse().unwrap();
        let Endpoint::Tcp6(addr) = endpoint else {
            panic!("expected an IPv6 endpoint");
        };
        assert_eq!(addr.scope_id(), 3);
    }

    #[test]
    fn parses_unix_path_and_abstract() {
        assert_eq!(
            "unix:///tmp/x.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(UnixAddress::Path(PathBuf::from("/tmp/x.sock")))
        );
        assert_eq!(
            "unix://@frame-bus".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(UnixAddress::Abstract(b"frame-bus".to_vec()))
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(
            "127.0.0.1:5555".parse::<Endpoint>(),
            Err(EndpointParseError::MissingScheme)
        );
        assert_eq!(
            "tcp://nonsense".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidAddress)
        );
        assert_eq!(
            "unix://relative/path".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidUnixName)
        );
    }

    #[test]
    fn raw_round_trip() {
        for text in ["tcp://10.1.2.3:9000", "tcp://[::1]:9000", "unix:///run/courier.sock"] {
            let endpoint: Endpoint = text.parse().unwrap();
            let (storage, len) = endpoint.to_raw();
            assert_eq!(Endpoint::from_raw(&storage, len), Some(endpoint));
        }
    }
}
