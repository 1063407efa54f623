//! Protocol error model.
//!
//! Errors travel on the wire as a small integer kind plus up to three
//! operands (one string, two integers). The kind enumeration is closed and
//! shared between client and server; `0` is reserved for success. Transport
//! and framing errors are fatal to the connection, dispatch errors are
//! recoverable at the application layer, and `PingBack` is a pseudo-error
//! used for keep-alive control that user code never observes.

use thiserror::Error;

/// Closed enumeration of protocol error kinds.
///
/// Values are bit-exact on the wire; do not renumber. New kinds may only be
/// appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    /// Peer runtime/archive version outside the supported range.
    /// arg0 = max runtime supported, arg1 = max archive supported.
    VersionMismatch = 1,
    /// Keep-alive emitted while a handler runs. arg0 = actual interval ms.
    PingBack = 2,
    ClientConnectTimeout = 3,
    ClientReadTimeout = 4,
    ClientWriteTimeout = 5,
    PeerDisconnect = 6,
    SocketError = 7,
    /// Zero-length or over-limit frame from a client.
    ClientMessageLength = 8,
    /// Zero-length or over-limit frame from a server.
    ServerMessageLength = 9,
    BadDescriptor = 10,
    NoServerBinding = 11,
    NoMethod = 12,
    AccessDenied = 13,
    ClientCancel = 14,
    SslHandshakeFailed = 15,
    SslCertVerification = 16,
    AuthFailClient = 17,
    AuthFailServer = 18,
    /// Oneway calls cannot be carried over HTTP request/response framing.
    OnewayHttp = 19,
    /// Non-success HTTP status from a server or intermediary proxy.
    HttpResponse = 20,
    UnknownFilter = 21,
    FilterNegotiationFailed = 22,
    BandwidthLimitExceeded = 23,
    FileTransferNotFound = 24,
    FileOpen = 25,
    FileRead = 26,
    FileWrite = 27,
    NoProxyConnection = 28,
    ProxyEndpointDown = 29,
    ProxyAuthFailed = 30,
    SubscriptionRefused = 31,
    PublisherDown = 32,
    DatagramTooLarge = 33,
    ServerStopped = 34,
    Deserialization = 35,
}

impl ErrorCode {
    /// Decode a wire integer, mapping unknown values to `BadDescriptor`.
    pub fn from_wire(raw: u32) -> Self {
        if raw <= ErrorCode::Deserialization as u32 {
            // Kinds are dense, so the transmute-free match below stays total.
            match raw {
                0 => ErrorCode::Ok,
                1 => ErrorCode::VersionMismatch,
                2 => ErrorCode::PingBack,
                3 => ErrorCode::ClientConnectTimeout,
                4 => ErrorCode::ClientReadTimeout,
                5 => ErrorCode::ClientWriteTimeout,
                6 => ErrorCode::PeerDisconnect,
                7 => ErrorCode::SocketError,
                8 => ErrorCode::ClientMessageLength,
                9 => ErrorCode::ServerMessageLength,
                10 => ErrorCode::BadDescriptor,
                11 => ErrorCode::NoServerBinding,
                12 => ErrorCode::NoMethod,
                13 => ErrorCode::AccessDenied,
                14 => ErrorCode::ClientCancel,
                15 => ErrorCode::SslHandshakeFailed,
                16 => ErrorCode::SslCertVerification,
                17 => ErrorCode::AuthFailClient,
                18 => ErrorCode::AuthFailServer,
                19 => ErrorCode::OnewayHttp,
                20 => ErrorCode::HttpResponse,
                21 => ErrorCode::UnknownFilter,
                22 => ErrorCode::FilterNegotiationFailed,
                23 => ErrorCode::BandwidthLimitExceeded,
                24 => ErrorCode::FileTransferNotFound,
                25 => ErrorCode::FileOpen,
                26 => ErrorCode::FileRead,
                27 => ErrorCode::FileWrite,
                28 => ErrorCode::NoProxyConnection,
                29 => ErrorCode::ProxyEndpointDown,
                30 => ErrorCode::ProxyAuthFailed,
                31 => ErrorCode::SubscriptionRefused,
                32 => ErrorCode::PublisherDown,
                33 => ErrorCode::DatagramTooLarge,
                34 => ErrorCode::ServerStopped,
                35 => ErrorCode::Deserialization,
                _ => unreachable!(),
            }
        } else {
            ErrorCode::BadDescriptor
        }
    }

    /// Whether this kind is fatal to the carrying connection.
    pub fn is_connection_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::ClientConnectTimeout
                | ErrorCode::ClientReadTimeout
                | ErrorCode::ClientWriteTimeout
                | ErrorCode::PeerDisconnect
                | ErrorCode::SocketError
                | ErrorCode::ClientMessageLength
                | ErrorCode::ServerMessageLength
                | ErrorCode::BadDescriptor
                | ErrorCode::VersionMismatch
                | ErrorCode::SslHandshakeFailed
                | ErrorCode::SslCertVerification
                | ErrorCode::AuthFailClient
                | ErrorCode::AuthFailServer
                | ErrorCode::DatagramTooLarge
                | ErrorCode::ServerStopped
        )
    }

    /// Pseudo-errors are handled by the runtime and never surfaced.
    pub fn is_pseudo(self) -> bool {
        matches!(self, ErrorCode::PingBack)
    }
}

/// A tagged error value: kind plus up to three operands (one string, two
/// integers).
#[derive(Debug, Clone, Error)]
#[error("rpc error {code:?} ({arg0}, {arg1}): {what}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub what: String,
    pub arg0: i32,
    pub arg1: i32,
}

impl RpcError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            what: String::new(),
            arg0: 0,
            arg1: 0,
        }
    }

    pub fn with_what(code: ErrorCode, what: impl Into<String>) -> Self {
        Self {
            code,
            what: what.into(),
            arg0: 0,
            arg1: 0,
        }
    }

    pub fn with_args(code: ErrorCode, arg0: i32, arg1: i32) -> Self {
        Self {
            code,
            what: String::new(),
            arg0,
            arg1,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted => ErrorCode::PeerDisconnect,
            std::io::ErrorKind::TimedOut => ErrorCode::ClientReadTimeout,
            _ => ErrorCode::SocketError,
        };
        RpcError::with_what(code, e.to_string())
    }
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        RpcError::with_what(ErrorCode::Deserialization, e.to_string())
    }
}

/// An exception raised by a user handler and delivered verbatim to the
/// caller. Unlike `RpcError`, it does not close the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote exception {sub_code}: {message}")]
pub struct RemoteException {
    pub sub_code: u32,
    pub message: String,
    /// Optionally wraps the exception that caused this one.
    pub cause: Option<Box<RemoteException>>,
}

impl RemoteException {
    pub fn new(sub_code: u32, message: impl Into<String>) -> Self {
        Self {
            sub_code,
            message: message.into(),
            cause: None,
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Outcome of a user call: either a payload, a remote exception raised by
/// the handler, or a runtime error.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Remote(#[from] RemoteException),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for raw in 0..=35u32 {
            let code = ErrorCode::from_wire(raw);
            assert_eq!(code as u32, raw);
        }
        assert_eq!(ErrorCode::from_wire(9999), ErrorCode::BadDescriptor);
    }

    #[test]
    fn test_pingback_is_pseudo_and_not_fatal() {
        assert!(ErrorCode::PingBack.is_pseudo());
        assert!(!ErrorCode::PingBack.is_connection_fatal());
        assert!(!ErrorCode::NoServerBinding.is_connection_fatal());
        assert!(ErrorCode::PeerDisconnect.is_connection_fatal());
    }

    #[test]
    fn test_io_error_mapping() {
        let e = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let rpc: RpcError = e.into();
        assert_eq!(rpc.code, ErrorCode::PeerDisconnect);
    }
}
