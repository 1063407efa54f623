//! Wire protocol: framing, varint primitives, and the method-invocation
//! codec.
//!
//! Every stream frame is `[u32 length little-endian][body]`. Datagram
//! transports carry exactly one frame per datagram and HTTP transports embed
//! the same frames inside request/response bodies, so this module is the
//! single source of truth for the byte layout.
//!
//! Integers inside a frame body use a zero-extended varint encoding kept
//! compatible with legacy peers: 7 bits per byte, least-significant group
//! first, high bit set on continuation bytes. Unknown trailing header fields
//! are ignored (forward compatibility) and missing trailing fields take
//! their defaults (backward compatibility).

use crate::error::{ErrorCode, RemoteException, RpcError, RpcResult};

/// Frame descriptors, bit-exact on the wire.
pub const DESCRIPTOR_ERROR: u64 = 0;
pub const DESCRIPTOR_REQUEST: u64 = 1;
pub const DESCRIPTOR_RESPONSE: u64 = 2;
pub const DESCRIPTOR_FILTERED_PAYLOAD: u64 = 3;

/// Size of the outer frame length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Request flag bits.
const FLAG_ONEWAY: u64 = 1 << 0;
const FLAG_CLOSE_AFTER: u64 = 1 << 1;
const FLAG_POINTER_TRACKING: u64 = 1 << 2;
const FLAG_NATIVE_WSTRING: u64 = 1 << 3;

/// Response flag bits.
const FLAG_IS_EXCEPTION: u64 = 1 << 0;

pub fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn put_blob(out: &mut Vec<u8>, blob: &[u8]) {
    put_varint(out, blob.len() as u64);
    out.extend_from_slice(blob);
}

pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_blob(out, s.as_bytes());
}

/// Cursor over a frame body. Reads return `None` once the buffer is
/// exhausted so that absent trailing fields can be defaulted.
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn try_varint(&mut self) -> Option<u64> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        let start = self.pos;
        while self.pos < self.buf.len() {
            let byte = self.buf[self.pos];
            self.pos += 1;
            if shift >= 64 {
                self.pos = start;
                return None;
            }
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(v);
            }
            shift += 7;
        }
        self.pos = start;
        None
    }

    pub fn varint(&mut self) -> RpcResult<u64> {
        self.try_varint()
            .ok_or_else(|| RpcError::with_what(ErrorCode::BadDescriptor, "truncated varint"))
    }

    pub fn try_blob(&mut self) -> Option<&'a [u8]> {
        let start = self.pos;
        let len = self.try_varint()? as usize;
        if self.buf.len() - self.pos < len {
            self.pos = start;
            return None;
        }
        let blob = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(blob)
    }

    pub fn blob(&mut self) -> RpcResult<&'a [u8]> {
        self.try_blob()
            .ok_or_else(|| RpcError::with_what(ErrorCode::BadDescriptor, "truncated blob"))
    }

    pub fn string(&mut self) -> RpcResult<String> {
        let blob = self.blob()?;
        String::from_utf8(blob.to_vec())
            .map_err(|_| RpcError::with_what(ErrorCode::BadDescriptor, "invalid utf-8 string"))
    }
}

/// Validate an outer frame length against the configured maximum.
///
/// Length 0 is always an error; a length above the maximum is fatal to the
/// session.
pub fn validate_frame_len(len: u32, max_len: u32, inbound_to_server: bool) -> RpcResult<()> {
    let code = if inbound_to_server {
        ErrorCode::ClientMessageLength
    } else {
        ErrorCode::ServerMessageLength
    };
    if len < 1 {
        return Err(RpcError::with_args(code, 0, 0));
    }
    if len > max_len {
        return Err(RpcError::with_args(code, len as i32, max_len as i32));
    }
    Ok(())
}

/// Prepend the outer `[u32 LE length]` header to a frame body.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// A decoded method-invocation request header.
///
/// The serialized call parameters follow the header in the same frame and
/// are opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub service: String,
    pub method_id: u32,
    pub oneway: bool,
    pub close_after: bool,
    pub pointer_tracking: bool,
    pub native_wstring: bool,
    pub runtime_version: u32,
    pub archive_version: u32,
    pub pingback_interval_ms: u32,
    pub oob_request: Vec<u8>,
    pub request_user_data: Vec<u8>,
}

impl Default for MethodRequest {
    fn default() -> Self {
        Self {
            service: String::new(),
            method_id: 0,
            oneway: false,
            close_after: false,
            pointer_tracking: false,
            native_wstring: false,
            runtime_version: crate::defaults::RUNTIME_VERSION,
            archive_version: crate::defaults::ARCHIVE_VERSION,
            pingback_interval_ms: 0,
            oob_request: Vec::new(),
            request_user_data: Vec::new(),
        }
    }
}

impl MethodRequest {
    pub fn new(service: impl Into<String>, method_id: u32) -> Self {
        Self {
            service: service.into(),
            method_id,
            ..Default::default()
        }
    }

    /// Encode the header followed by the serialized call parameters.
    pub fn encode(&self, params: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + params.len());
        put_varint(&mut out, DESCRIPTOR_REQUEST);
        put_string(&mut out, &self.service);
        put_varint(&mut out, u64::from(self.method_id));
        let mut flags = 0u64;
        if self.oneway {
            flags |= FLAG_ONEWAY;
        }
        if self.close_after {
            flags |= FLAG_CLOSE_AFTER;
        }
        if self.pointer_tracking {
            flags |= FLAG_POINTER_TRACKING;
        }
        if self.native_wstring {
            flags |= FLAG_NATIVE_WSTRING;
        }
        put_varint(&mut out, flags);
        put_varint(&mut out, u64::from(self.runtime_version));
        put_varint(&mut out, u64::from(self.archive_version));
        put_varint(&mut out, u64::from(self.pingback_interval_ms));
        put_blob(&mut out, &self.oob_request);
        put_blob(&mut out, &self.request_user_data);
        out.extend_from_slice(params);
        out
    }

    /// Decode a request header, returning it together with the offset of
    /// the serialized parameters within `body`.
    ///
    /// The descriptor varint must already have been consumed by the caller.
    pub fn decode(cursor: &mut WireCursor<'_>) -> RpcResult<Self> {
        let mut req = MethodRequest {
            service: cursor.string()?,
            method_id: cursor.varint()? as u32,
            ..Default::default()
        };
        // All remaining fields are optional for backward compatibility.
        if let Some(flags) = cursor.try_varint() {
            req.oneway = flags & FLAG_ONEWAY != 0;
            req.close_after = flags & FLAG_CLOSE_AFTER != 0;
            req.pointer_tracking = flags & FLAG_POINTER_TRACKING != 0;
            req.native_wstring = flags & FLAG_NATIVE_WSTRING != 0;
        }
        if let Some(v) = cursor.try_varint() {
            req.runtime_version = v as u32;
        }
        if let Some(v) = cursor.try_varint() {
            req.archive_version = v as u32;
        }
        if let Some(v) = cursor.try_varint() {
            req.pingback_interval_ms = v as u32;
        }
        if let Some(b) = cursor.try_blob() {
            req.oob_request = b.to_vec();
        }
        if let Some(b) = cursor.try_blob() {
            req.request_user_data = b.to_vec();
        }
        Ok(req)
    }
}

/// A decoded response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodResponse {
    /// Normal return or a remote exception; the serialized return value (or
    /// exception object) follows in the frame.
    Reply {
        is_exception: bool,
        oob_response: Vec<u8>,
        response_user_data: Vec<u8>,
    },
    /// A runtime error triple. Never followed by a payload.
    Error {
        code: ErrorCode,
        arg0: i32,
        arg1: i32,
    },
}

impl MethodResponse {
    pub fn ok() -> Self {
        MethodResponse::Reply {
            is_exception: false,
            oob_response: Vec::new(),
            response_user_data: Vec::new(),
        }
    }

    pub fn error(code: ErrorCode, arg0: i32, arg1: i32) -> Self {
        MethodResponse::Error { code, arg0, arg1 }
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + payload.len());
        match self {
            MethodResponse::Reply {
                is_exception,
                oob_response,
                response_user_data,
            } => {
                put_varint(&mut out, DESCRIPTOR_RESPONSE);
                let mut flags = 0u64;
                if *is_exception {
                    flags |= FLAG_IS_EXCEPTION;
                }
                put_varint(&mut out, flags);
                put_blob(&mut out, oob_response);
                put_blob(&mut out, response_user_data);
                out.extend_from_slice(payload);
            }
            MethodResponse::Error { code, arg0, arg1 } => {
                put_varint(&mut out, DESCRIPTOR_ERROR);
                put_varint(&mut out, u64::from(*code as u32));
                put_varint(&mut out, *arg0 as u32 as u64);
                put_varint(&mut out, *arg1 as u32 as u64);
            }
        }
        out
    }

    /// Decode a response frame body; returns the header and the offset of
    /// any trailing payload.
    pub fn decode(body: &[u8]) -> RpcResult<(Self, usize)> {
        let mut cursor = WireCursor::new(body);
        match cursor.varint()? {
            DESCRIPTOR_RESPONSE => {
                let flags = cursor.try_varint().unwrap_or(0);
                let oob = cursor.try_blob().unwrap_or(&[]).to_vec();
                let user = cursor.try_blob().unwrap_or(&[]).to_vec();
                Ok((
                    MethodResponse::Reply {
                        is_exception: flags & FLAG_IS_EXCEPTION != 0,
                        oob_response: oob,
                        response_user_data: user,
                    },
                    cursor.position(),
                ))
            }
            DESCRIPTOR_ERROR => {
                let code = ErrorCode::from_wire(cursor.varint()? as u32);
                let arg0 = cursor.try_varint().unwrap_or(0) as u32 as i32;
                let arg1 = cursor.try_varint().unwrap_or(0) as u32 as i32;
                Ok((MethodResponse::Error { code, arg0, arg1 }, cursor.position()))
            }
            other => Err(RpcError::with_what(
                ErrorCode::BadDescriptor,
                format!("unexpected response descriptor {other}"),
            )),
        }
    }
}

/// Encode a remote exception as a response payload.
pub fn encode_remote_exception(e: &RemoteException) -> Vec<u8> {
    let mut out = Vec::new();
    put_varint(&mut out, u64::from(e.sub_code));
    put_string(&mut out, &e.message);
    match &e.cause {
        Some(cause) => {
            put_varint(&mut out, 1);
            let nested = encode_remote_exception(cause);
            put_blob(&mut out, &nested);
        }
        None => put_varint(&mut out, 0),
    }
    out
}

pub fn decode_remote_exception(payload: &[u8]) -> RpcResult<RemoteException> {
    let mut cursor = WireCursor::new(payload);
    let sub_code = cursor.varint()? as u32;
    let message = cursor.string()?;
    let cause = match cursor.try_varint() {
        Some(1) => {
            let nested = cursor.blob()?;
            Some(Box::new(decode_remote_exception(nested)?))
        }
        _ => None,
    };
    Ok(RemoteException {
        sub_code,
        message,
        cause,
    })
}

/// Out-of-band message kinds, bit-exact on the wire.
pub const OOB_REQUEST_TRANSPORT_FILTERS: u64 = 1;
pub const OOB_CREATE_CALLBACK_CONNECTION: u64 = 2;
pub const OOB_REQUEST_SUBSCRIPTION: u64 = 3;
pub const OOB_REQUEST_PROXY_CONNECTION: u64 = 4;

/// A side-channel message piggybacked in the user-data slot of a carrier
/// call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobRequest {
    RequestTransportFilters {
        runtime_version: u32,
        filter_ids: Vec<u32>,
    },
    CreateCallbackConnection {
        runtime_version: u32,
    },
    RequestSubscription {
        runtime_version: u32,
        topic: String,
        /// Subscriber-to-publisher ping interval, milliseconds.
        sub_ping_interval_ms: u32,
    },
    RequestProxyConnection {
        runtime_version: u32,
        endpoint_name: String,
    },
}

impl OobRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            OobRequest::RequestTransportFilters {
                runtime_version,
                filter_ids,
            } => {
                put_varint(&mut out, OOB_REQUEST_TRANSPORT_FILTERS);
                put_varint(&mut out, u64::from(*runtime_version));
                put_varint(&mut out, filter_ids.len() as u64);
                for id in filter_ids {
                    put_varint(&mut out, u64::from(*id));
                }
            }
            OobRequest::CreateCallbackConnection { runtime_version } => {
                put_varint(&mut out, OOB_CREATE_CALLBACK_CONNECTION);
                put_varint(&mut out, u64::from(*runtime_version));
            }
            OobRequest::RequestSubscription {
                runtime_version,
                topic,
                sub_ping_interval_ms,
            } => {
                put_varint(&mut out, OOB_REQUEST_SUBSCRIPTION);
                put_varint(&mut out, u64::from(*runtime_version));
                put_string(&mut out, topic);
                put_varint(&mut out, u64::from(*sub_ping_interval_ms));
            }
            OobRequest::RequestProxyConnection {
                runtime_version,
                endpoint_name,
            } => {
                put_varint(&mut out, OOB_REQUEST_PROXY_CONNECTION);
                put_varint(&mut out, u64::from(*runtime_version));
                put_string(&mut out, endpoint_name);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> RpcResult<Self> {
        let mut cursor = WireCursor::new(buf);
        let kind = cursor.varint()?;
        let runtime_version = cursor.varint()? as u32;
        match kind {
            OOB_REQUEST_TRANSPORT_FILTERS => {
                let n = cursor.varint()? as usize;
                let mut filter_ids = Vec::with_capacity(n);
                for _ in 0..n {
                    filter_ids.push(cursor.varint()? as u32);
                }
                Ok(OobRequest::RequestTransportFilters {
                    runtime_version,
                    filter_ids,
                })
            }
            OOB_CREATE_CALLBACK_CONNECTION => {
                Ok(OobRequest::CreateCallbackConnection { runtime_version })
            }
            OOB_REQUEST_SUBSCRIPTION => Ok(OobRequest::RequestSubscription {
                runtime_version,
                topic: cursor.string()?,
                sub_ping_interval_ms: cursor.try_varint().unwrap_or(0) as u32,
            }),
            OOB_REQUEST_PROXY_CONNECTION => Ok(OobRequest::RequestProxyConnection {
                runtime_version,
                endpoint_name: cursor.string()?,
            }),
            other => Err(RpcError::with_what(
                ErrorCode::BadDescriptor,
                format!("unknown oob message type {other}"),
            )),
        }
    }
}

/// Reply to an OOB request. A single error code plus the fields individual
/// OOB kinds care about; absent fields decode to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OobResponse {
    pub error_code: u32,
    /// Publisher-to-subscriber ping interval (subscription replies).
    pub pub_ping_interval_ms: u32,
    pub pings_enabled: bool,
    /// Connection GUID for reconnection correlation (subscription replies).
    pub connection_guid: String,
}

impl OobResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn refused(code: ErrorCode) -> Self {
        Self {
            error_code: code as u32,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_varint(&mut out, u64::from(self.error_code));
        put_varint(&mut out, u64::from(self.pub_ping_interval_ms));
        put_varint(&mut out, u64::from(self.pings_enabled));
        put_string(&mut out, &self.connection_guid);
        out
    }

    pub fn decode(buf: &[u8]) -> RpcResult<Self> {
        let mut cursor = WireCursor::new(buf);
        let error_code = cursor.varint()? as u32;
        let pub_ping_interval_ms = cursor.try_varint().unwrap_or(0) as u32;
        let pings_enabled = cursor.try_varint().unwrap_or(0) != 0;
        let connection_guid = match cursor.try_blob() {
            Some(b) => String::from_utf8_lossy(b).into_owned(),
            None => String::new(),
        };
        Ok(Self {
            error_code,
            pub_ping_interval_ms,
            pings_enabled,
            connection_guid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        let values = [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX];
        for &v in &values {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let mut cursor = WireCursor::new(&buf);
            assert_eq!(cursor.varint().unwrap(), v);
            assert_eq!(cursor.position(), buf.len());
        }
    }

    #[test]
    fn test_truncated_varint_restores_position() {
        let buf = [0x80u8, 0x80];
        let mut cursor = WireCursor::new(&buf);
        assert!(cursor.try_varint().is_none());
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_request_round_trip() {
        let mut req = MethodRequest::new("Echo", 3);
        req.oneway = true;
        req.pingback_interval_ms = 2500;
        req.oob_request = vec![9, 9, 9];
        let body = req.encode(b"params");

        let mut cursor = WireCursor::new(&body);
        assert_eq!(cursor.varint().unwrap(), DESCRIPTOR_REQUEST);
        let decoded = MethodRequest::decode(&mut cursor).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(cursor.remaining(), b"params");
    }

    #[test]
    fn test_request_missing_trailing_fields_default() {
        // A minimal legacy header: service name and method id only.
        let mut body = Vec::new();
        put_varint(&mut body, DESCRIPTOR_REQUEST);
        put_string(&mut body, "Echo");
        put_varint(&mut body, 7);

        let mut cursor = WireCursor::new(&body);
        cursor.varint().unwrap();
        let decoded = MethodRequest::decode(&mut cursor).unwrap();
        assert_eq!(decoded.service, "Echo");
        assert_eq!(decoded.method_id, 7);
        assert!(!decoded.oneway);
        assert_eq!(decoded.pingback_interval_ms, 0);
        assert!(decoded.oob_request.is_empty());
    }

    #[test]
    fn test_response_error_round_trip() {
        let resp = MethodResponse::error(ErrorCode::VersionMismatch, 8, 0);
        let body = resp.encode(&[]);
        let (decoded, offset) = MethodResponse::decode(&body).unwrap();
        assert_eq!(decoded, resp);
        assert_eq!(offset, body.len());
    }

    #[test]
    fn test_response_reply_with_payload() {
        let resp = MethodResponse::Reply {
            is_exception: false,
            oob_response: vec![1, 2],
            response_user_data: Vec::new(),
        };
        let body = resp.encode(b"result");
        let (decoded, offset) = MethodResponse::decode(&body).unwrap();
        assert_eq!(decoded, resp);
        assert_eq!(&body[offset..], b"result");
    }

    #[test]
    fn test_remote_exception_nesting() {
        let e = RemoteException {
            sub_code: 4,
            message: "outer".into(),
            cause: Some(Box::new(RemoteException::new(5, "inner"))),
        };
        let bytes = encode_remote_exception(&e);
        let decoded = decode_remote_exception(&bytes).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn test_oob_round_trips() {
        let messages = vec![
            OobRequest::RequestTransportFilters {
                runtime_version: 13,
                filter_ids: vec![1, 2],
            },
            OobRequest::CreateCallbackConnection { runtime_version: 13 },
            OobRequest::RequestSubscription {
                runtime_version: 13,
                topic: "prices".into(),
                sub_ping_interval_ms: 1000,
            },
            OobRequest::RequestProxyConnection {
                runtime_version: 13,
                endpoint_name: "alpha".into(),
            },
        ];
        for msg in messages {
            let decoded = OobRequest::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_frame_length_validation() {
        assert!(validate_frame_len(0, 1024, true).is_err());
        assert!(validate_frame_len(2048, 1024, true).is_err());
        assert!(validate_frame_len(1024, 1024, true).is_ok());
        let err = validate_frame_len(0, 1024, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerMessageLength);
    }
}
