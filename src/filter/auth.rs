//! Mutual-authentication filter with per-message quality of protection.
//!
//! Plays the role the NTLM/Kerberos/Negotiate filters play on Windows:
//! a length-prefixed token handshake followed by a record layer whose
//! 4-byte length header carries the protection level in its top two bits
//! (bit 30 = integrity, bit 31 = encryption). Both halves prove knowledge
//! of a shared secret during the handshake and derive directional session
//! keys from it; application records then carry an HMAC-SHA256 trailer or
//! are sealed with ChaCha20-Poly1305, per the negotiated level.
//!
//! Credential acquisition from an OS store is out of scope; the secret is
//! supplied by configuration.

use super::{Filter, FilterContext, FilterId, HandshakeState};
use crate::error::{ErrorCode, RpcError, RpcResult};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const PROOF_LEN: usize = 32;
const MAC_LEN: usize = 32;
const AEAD_TAG_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 4;

const FLAG_INTEGRITY: u32 = 1 << 30;
const FLAG_ENCRYPTION: u32 = 1 << 31;
const LEN_MASK: u32 = !(FLAG_INTEGRITY | FLAG_ENCRYPTION);

const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Per-message protection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityOfProtection {
    None,
    Integrity,
    Encryption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    Client,
    Server,
}

/// Which well-known filter id this instance negotiates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Ntlm,
    Kerberos,
    Negotiate,
}

impl AuthMechanism {
    fn filter_id(self) -> FilterId {
        match self {
            AuthMechanism::Ntlm => FilterId::Ntlm,
            AuthMechanism::Kerberos => FilterId::Kerberos,
            AuthMechanism::Negotiate => FilterId::Negotiate,
        }
    }
}

enum Phase {
    /// Client: hello not yet sent. Server: waiting for hello.
    Start,
    /// Client: waiting for the server proof.
    AwaitServerProof,
    /// Server: waiting for the client proof.
    AwaitClientProof,
    Established,
    Failed,
}

pub struct AuthFilter {
    mechanism: AuthMechanism,
    role: AuthRole,
    qop: QualityOfProtection,
    secret: Vec<u8>,
    phase: Phase,
    local_nonce: [u8; NONCE_LEN],
    peer_nonce: [u8; NONCE_LEN],
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_seq: u64,
    recv_seq: u64,
    inbound: Vec<u8>,
    deferred_writes: Vec<u8>,
    hello_sent: bool,
}

impl AuthFilter {
    pub fn new(
        mechanism: AuthMechanism,
        role: AuthRole,
        qop: QualityOfProtection,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        let mut local_nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut local_nonce);
        Self {
            mechanism,
            role,
            qop,
            secret: secret.into(),
            phase: Phase::Start,
            local_nonce,
            peer_nonce: [0u8; NONCE_LEN],
            send_key: [0u8; 32],
            recv_key: [0u8; 32],
            send_seq: 0,
            recv_seq: 0,
            inbound: Vec::new(),
            deferred_writes: Vec::new(),
            hello_sent: false,
        }
    }

    fn prf(&self, label: &[u8], client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(label);
        mac.update(client_nonce);
        mac.update(server_nonce);
        mac.finalize().into_bytes().into()
    }

    fn nonces(&self) -> ([u8; NONCE_LEN], [u8; NONCE_LEN]) {
        match self.role {
            AuthRole::Client => (self.local_nonce, self.peer_nonce),
            AuthRole::Server => (self.peer_nonce, self.local_nonce),
        }
    }

    fn derive_keys(&mut self) {
        let (client_nonce, server_nonce) = self.nonces();
        let c2s = self.prf(b"key client-to-server", &client_nonce, &server_nonce);
        let s2c = self.prf(b"key server-to-client", &client_nonce, &server_nonce);
        match self.role {
            AuthRole::Client => {
                self.send_key = c2s;
                self.recv_key = s2c;
            }
            AuthRole::Server => {
                self.send_key = s2c;
                self.recv_key = c2s;
            }
        }
    }

    fn push_token(ctx: &mut FilterContext, token: &[u8]) {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + token.len());
        out.extend_from_slice(&(token.len() as u32).to_le_bytes());
        out.extend_from_slice(token);
        ctx.pass_down(out);
    }

    fn fail(&mut self, what: &str) -> RpcError {
        self.phase = Phase::Failed;
        let code = match self.role {
            AuthRole::Client => ErrorCode::AuthFailClient,
            AuthRole::Server => ErrorCode::AuthFailServer,
        };
        RpcError::with_what(code, what.to_owned())
    }

    fn handle_token(&mut self, ctx: &mut FilterContext, token: &[u8]) -> RpcResult<()> {
        match (&self.phase, self.role) {
            (Phase::Start, AuthRole::Server) => {
                // Hello: mechanism byte plus the client nonce.
                if token.len() != 1 + NONCE_LEN || token[0] != self.mechanism as u8 {
                    return Err(self.fail("bad client hello"));
                }
                self.peer_nonce.copy_from_slice(&token[1..]);
                let (client_nonce, server_nonce) = self.nonces();
                let proof = self.prf(b"server proof", &client_nonce, &server_nonce);
                let mut reply = Vec::with_capacity(NONCE_LEN + PROOF_LEN);
                reply.extend_from_slice(&self.local_nonce);
                reply.extend_from_slice(&proof);
                Self::push_token(ctx, &reply);
                self.phase = Phase::AwaitClientProof;
                Ok(())
            }
            (Phase::AwaitServerProof, AuthRole::Client) => {
                if token.len() != NONCE_LEN + PROOF_LEN {
                    return Err(self.fail("bad server reply"));
                }
                self.peer_nonce.copy_from_slice(&token[..NONCE_LEN]);
                let (client_nonce, server_nonce) = self.nonces();
                let expected = self.prf(b"server proof", &client_nonce, &server_nonce);
                if token[NONCE_LEN..] != expected {
                    return Err(self.fail("server proof mismatch"));
                }
                let proof = self.prf(b"client proof", &client_nonce, &server_nonce);
                Self::push_token(ctx, &proof);
                self.derive_keys();
                self.phase = Phase::Established;
                debug!(mechanism = %self.mechanism.filter_id(), "auth handshake complete");
                self.flush_deferred(ctx)
            }
            (Phase::AwaitClientProof, AuthRole::Server) => {
                let (client_nonce, server_nonce) = self.nonces();
                let expected = self.prf(b"client proof", &client_nonce, &server_nonce);
                if token != expected {
                    return Err(self.fail("client proof mismatch"));
                }
                self.derive_keys();
                self.phase = Phase::Established;
                debug!(mechanism = %self.mechanism.filter_id(), "auth handshake complete");
                self.flush_deferred(ctx)
            }
            _ => Err(self.fail("unexpected handshake token")),
        }
    }

    fn flush_deferred(&mut self, ctx: &mut FilterContext) -> RpcResult<()> {
        if !self.deferred_writes.is_empty() {
            let deferred = std::mem::take(&mut self.deferred_writes);
            self.seal_record(ctx, &deferred)?;
        }
        Ok(())
    }

    fn seal_record(&mut self, ctx: &mut FilterContext, payload: &[u8]) -> RpcResult<()> {
        let seq = self.send_seq;
        self.send_seq += 1;
        let (body, flags) = match self.qop {
            QualityOfProtection::None => (payload.to_vec(), 0),
            QualityOfProtection::Integrity => {
                let mut mac =
                    <HmacSha256 as Mac>::new_from_slice(&self.send_key).expect("hmac accepts any key size");
                mac.update(&seq.to_le_bytes());
                mac.update(payload);
                let mut body = payload.to_vec();
                body.extend_from_slice(&mac.finalize().into_bytes());
                (body, FLAG_INTEGRITY)
            }
            QualityOfProtection::Encryption => {
                let cipher = ChaCha20Poly1305::new_from_slice(&self.send_key)
                    .map_err(|_| RpcError::new(ErrorCode::AuthFailClient))?;
                let mut nonce = [0u8; 12];
                nonce[..8].copy_from_slice(&seq.to_le_bytes());
                let sealed = cipher
                    .encrypt(
                        Nonce::from_slice(&nonce),
                        Payload {
                            msg: payload,
                            aad: &seq.to_le_bytes(),
                        },
                    )
                    .map_err(|_| RpcError::new(ErrorCode::AuthFailClient))?;
                (sealed, FLAG_ENCRYPTION)
            }
        };
        let header = (body.len() as u32) | flags;
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        out.extend_from_slice(&header.to_le_bytes());
        out.extend_from_slice(&body);
        ctx.pass_down(out);
        Ok(())
    }

    fn open_record(&mut self, ctx: &mut FilterContext, header: u32, body: &[u8]) -> RpcResult<()> {
        let integrity = header & FLAG_INTEGRITY != 0;
        let encryption = header & FLAG_ENCRYPTION != 0;
        let seq = self.recv_seq;
        self.recv_seq += 1;
        let plain = if encryption {
            let cipher = ChaCha20Poly1305::new_from_slice(&self.recv_key)
                .map_err(|_| self.fail("bad key"))?;
            let mut nonce = [0u8; 12];
            nonce[..8].copy_from_slice(&seq.to_le_bytes());
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: body,
                        aad: &seq.to_le_bytes(),
                    },
                )
                .map_err(|_| self.fail("record decryption failed"))?
        } else if integrity {
            if body.len() < MAC_LEN {
                return Err(self.fail("short integrity record"));
            }
            let (payload, tag) = body.split_at(body.len() - MAC_LEN);
            let mut mac =
                <HmacSha256 as Mac>::new_from_slice(&self.recv_key).expect("hmac accepts any key size");
            mac.update(&seq.to_le_bytes());
            mac.update(payload);
            mac.verify_slice(tag)
                .map_err(|_| self.fail("record signature mismatch"))?;
            payload.to_vec()
        } else {
            body.to_vec()
        };
        ctx.pass_up(plain);
        Ok(())
    }
}

impl Filter for AuthFilter {
    fn id(&self) -> FilterId {
        self.mechanism.filter_id()
    }

    fn reset_state(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.local_nonce);
        self.peer_nonce = [0u8; NONCE_LEN];
        self.send_key = [0u8; 32];
        self.recv_key = [0u8; 32];
        self.send_seq = 0;
        self.recv_seq = 0;
        self.inbound.clear();
        self.deferred_writes.clear();
        self.hello_sent = false;
        self.phase = Phase::Start;
    }

    fn handshake_state(&self) -> HandshakeState {
        match self.phase {
            Phase::Established => HandshakeState::AuthOkAck,
            Phase::Failed => HandshakeState::AuthFailed,
            _ => HandshakeState::AuthContinue,
        }
    }

    fn pump_handshake(&mut self, ctx: &mut FilterContext) -> RpcResult<()> {
        if self.role == AuthRole::Client && !self.hello_sent {
            let mut hello = Vec::with_capacity(1 + NONCE_LEN);
            hello.push(self.mechanism as u8);
            hello.extend_from_slice(&self.local_nonce);
            Self::push_token(ctx, &hello);
            self.hello_sent = true;
            self.phase = Phase::AwaitServerProof;
        }
        Ok(())
    }

    fn write(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
        self.pump_handshake(ctx)?;
        if !matches!(self.phase, Phase::Established) {
            self.deferred_writes.extend_from_slice(buf);
            return Ok(());
        }
        self.seal_record(ctx, buf)
    }

    fn on_read_completed(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
        self.inbound.extend_from_slice(buf);
        loop {
            if self.inbound.len() < RECORD_HEADER_LEN {
                return Ok(());
            }
            let header = u32::from_le_bytes([
                self.inbound[0],
                self.inbound[1],
                self.inbound[2],
                self.inbound[3],
            ]);
            let len = (header & LEN_MASK) as usize;
            if len > MAX_RECORD_LEN {
                return Err(self.fail("oversized record"));
            }
            if self.inbound.len() < RECORD_HEADER_LEN + len {
                return Ok(());
            }
            let body: Vec<u8> = self
                .inbound
                .drain(..RECORD_HEADER_LEN + len)
                .skip(RECORD_HEADER_LEN)
                .collect();
            if matches!(self.phase, Phase::Established) {
                self.open_record(ctx, header, &body)?;
            } else {
                self.handle_token(ctx, &body)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;

    fn pair(qop: QualityOfProtection) -> (FilterChain, FilterChain) {
        let client = FilterChain::new(vec![Box::new(AuthFilter::new(
            AuthMechanism::Negotiate,
            AuthRole::Client,
            qop,
            b"shared secret".to_vec(),
        ))]);
        let server = FilterChain::new(vec![Box::new(AuthFilter::new(
            AuthMechanism::Negotiate,
            AuthRole::Server,
            qop,
            b"shared secret".to_vec(),
        ))]);
        (client, server)
    }

    fn handshake(client: &mut FilterChain, server: &mut FilterChain) {
        let hello = client.pending_wire().unwrap();
        assert!(server.read(&hello).unwrap().is_empty());
        let reply = server.pending_wire().unwrap();
        assert!(client.read(&reply).unwrap().is_empty());
        let proof = client.pending_wire().unwrap();
        assert!(server.read(&proof).unwrap().is_empty());
        assert!(client.handshake_done());
        assert!(server.handshake_done());
    }

    #[test]
    fn test_handshake_and_integrity_round_trip() {
        let (mut client, mut server) = pair(QualityOfProtection::Integrity);
        handshake(&mut client, &mut server);

        let wire = client.write(b"signed payload").unwrap();
        // Header + payload + 32-byte mac trailer.
        assert_eq!(wire.len(), 4 + 14 + 32);
        let header = u32::from_le_bytes(wire[..4].try_into().unwrap());
        assert_ne!(header & (1 << 30), 0);
        assert_eq!(server.read(&wire).unwrap(), b"signed payload");
    }

    #[test]
    fn test_encryption_round_trip_both_directions() {
        let (mut client, mut server) = pair(QualityOfProtection::Encryption);
        handshake(&mut client, &mut server);

        let wire = client.write(b"sealed").unwrap();
        let header = u32::from_le_bytes(wire[..4].try_into().unwrap());
        assert_ne!(header & (1 << 31), 0);
        assert!(!wire[4..].windows(6).any(|w| w == b"sealed"));
        assert_eq!(server.read(&wire).unwrap(), b"sealed");

        let wire = server.write(b"reply").unwrap();
        assert_eq!(client.read(&wire).unwrap(), b"reply");
    }

    #[test]
    fn test_tampered_record_is_rejected() {
        let (mut client, mut server) = pair(QualityOfProtection::Integrity);
        handshake(&mut client, &mut server);
        let mut wire = client.write(b"payload").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(server.read(&wire).is_err());
    }

    #[test]
    fn test_wrong_secret_fails_handshake() {
        let (mut client, _) = pair(QualityOfProtection::None);
        let mut server = FilterChain::new(vec![Box::new(AuthFilter::new(
            AuthMechanism::Negotiate,
            AuthRole::Server,
            QualityOfProtection::None,
            b"different secret".to_vec(),
        ))]);
        let hello = client.pending_wire().unwrap();
        assert!(server.read(&hello).unwrap().is_empty());
        let reply = server.pending_wire().unwrap();
        assert!(client.read(&reply).is_err());
    }

    #[test]
    fn test_write_before_handshake_is_deferred() {
        let (mut client, mut server) = pair(QualityOfProtection::Encryption);
        let early = client.write(b"queued before auth").unwrap();
        // Only the hello token goes out; the payload waits for the keys.
        assert!(server.read(&early).unwrap().is_empty());
        let reply = server.pending_wire().unwrap();
        let mut to_server = client.read(&reply).unwrap();
        assert!(to_server.is_empty());
        to_server = client.pending_wire().unwrap();
        assert_eq!(server.read(&to_server).unwrap(), b"queued before auth");
    }
}
