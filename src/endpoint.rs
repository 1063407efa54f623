//! Endpoint descriptions.
//!
//! An `Endpoint` is a polymorphic "where to reach": it can produce a client
//! transport for dialing out or a server transport for listening. Endpoints
//! parse from `scheme://` strings so they can come straight off a command
//! line.

use crate::error::{ErrorCode, RpcError, RpcResult};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Directory under which named-pipe endpoints materialize as filesystem
/// sockets on unix targets.
pub const PIPE_DIR: &str = "/tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
        /// Multicast group to join on the server side, if any.
        multicast: Option<Ipv4Addr>,
        ttl: Option<u32>,
        broadcast: bool,
    },
    Http {
        host: String,
        port: u16,
        url_path: String,
    },
    Https {
        host: String,
        port: u16,
        url_path: String,
    },
    /// Unix domain socket.
    Local {
        path: PathBuf,
    },
    /// Named pipe; maps to a filesystem socket under `PIPE_DIR` on unix.
    NamedPipe {
        name: String,
    },
    /// Reach a NAT-ed server registered under `name` on a rendezvous
    /// server at `via`.
    Proxy {
        name: String,
        via: Box<Endpoint>,
    },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Udp {
            host: host.into(),
            port,
            multicast: None,
            ttl: None,
            broadcast: false,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Endpoint::Local { path: path.into() }
    }

    pub fn named_pipe(name: impl Into<String>) -> Self {
        Endpoint::NamedPipe { name: name.into() }
    }

    pub fn proxy(name: impl Into<String>, via: Endpoint) -> Self {
        Endpoint::Proxy {
            name: name.into(),
            via: Box::new(via),
        }
    }

    /// The filesystem path a local or named-pipe endpoint binds to.
    pub fn socket_path(&self) -> Option<PathBuf> {
        match self {
            Endpoint::Local { path } => Some(path.clone()),
            Endpoint::NamedPipe { name } => {
                Some(PathBuf::from(PIPE_DIR).join(format!("{name}.pipe")))
            }
            _ => None,
        }
    }

    pub fn host_port(&self) -> Option<(String, u16)> {
        match self {
            Endpoint::Tcp { host, port }
            | Endpoint::Udp { host, port, .. }
            | Endpoint::Http { host, port, .. }
            | Endpoint::Https { host, port, .. } => Some((host.clone(), *port)),
            _ => None,
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, Endpoint::Udp { .. })
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, Endpoint::Https { .. })
    }

    /// Parse `scheme://rest` endpoint notation:
    /// `tcp://host:port`, `udp://host:port`, `http://host:port/path`,
    /// `https://host:port/path`, `local:///var/run/x.sock`,
    /// `pipe://name`, `proxy://name@tcp://rendezvous:port`.
    pub fn parse(s: &str) -> RpcResult<Self> {
        let (scheme, rest) = s.split_once("://").ok_or_else(|| {
            RpcError::with_what(ErrorCode::SocketError, format!("bad endpoint: {s}"))
        })?;
        let host_port = |rest: &str| -> RpcResult<(String, u16)> {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                RpcError::with_what(ErrorCode::SocketError, format!("missing port: {s}"))
            })?;
            let port = port.parse::<u16>().map_err(|_| {
                RpcError::with_what(ErrorCode::SocketError, format!("bad port: {s}"))
            })?;
            Ok((host.to_owned(), port))
        };
        match scheme {
            "tcp" => {
                let (host, port) = host_port(rest)?;
                Ok(Endpoint::Tcp { host, port })
            }
            "udp" => {
                let (host, port) = host_port(rest)?;
                Ok(Endpoint::Udp {
                    host,
                    port,
                    multicast: None,
                    ttl: None,
                    broadcast: false,
                })
            }
            "http" | "https" => {
                let (authority, path) = match rest.find('/') {
                    Some(i) => (&rest[..i], rest[i..].to_owned()),
                    None => (rest, "/".to_owned()),
                };
                let (host, port) = host_port(authority)?;
                if scheme == "http" {
                    Ok(Endpoint::Http {
                        host,
                        port,
                        url_path: path,
                    })
                } else {
                    Ok(Endpoint::Https {
                        host,
                        port,
                        url_path: path,
                    })
                }
            }
            "local" => Ok(Endpoint::Local {
                path: PathBuf::from(rest),
            }),
            "pipe" => Ok(Endpoint::NamedPipe {
                name: rest.to_owned(),
            }),
            "proxy" => {
                let (name, via) = rest.split_once('@').ok_or_else(|| {
                    RpcError::with_what(
                        ErrorCode::SocketError,
                        format!("proxy endpoint needs name@via: {s}"),
                    )
                })?;
                Ok(Endpoint::Proxy {
                    name: name.to_owned(),
                    via: Box::new(Endpoint::parse(via)?),
                })
            }
            other => Err(RpcError::with_what(
                ErrorCode::SocketError,
                format!("unknown endpoint scheme: {other}"),
            )),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Udp { host, port, .. } => write!(f, "udp://{host}:{port}"),
            Endpoint::Http {
                host,
                port,
                url_path,
            } => write!(f, "http://{host}:{port}{url_path}"),
            Endpoint::Https {
                host,
                port,
                url_path,
            } => write!(f, "https://{host}:{port}{url_path}"),
            Endpoint::Local { path } => write!(f, "local://{}", path.display()),
            Endpoint::NamedPipe { name } => write!(f, "pipe://{name}"),
            Endpoint::Proxy { name, via } => write!(f, "proxy://{name}@{via}"),
        }
    }
}
