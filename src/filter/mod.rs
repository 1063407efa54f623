//! Filter chains.
//!
//! A filter is a byte-stream transform with two sides: *pre* (toward the
//! user) and *post* (toward the wire). Outbound data enters the chain at the
//! pre end through `write`; inbound wire bytes enter at the post end through
//! `on_read_completed`, and completions flow in the opposite direction of
//! the issuing call. The chain itself is sans-io: it never touches a socket.
//! The owning transport feeds it wire bytes and drains the bytes it wants
//! written, which keeps the same chain usable under both the blocking and
//! the reactor-driven transports.
//!
//! Completions are never dispatched by direct recursion. Every cross-filter
//! delivery goes through a small run queue drained by the chain pump; once
//! the synchronous dispatch depth reaches `RECURSION_LIMIT` the remaining
//! ops are deferred to the next pump iteration, so a long
//! `on_read_completed` → `read` ping-pong cannot overflow the stack.
//! Asynchronous completions enter through the pump directly and are never
//! trampolined.

pub mod auth;
pub mod compression;
pub mod tls;

use crate::error::{ErrorCode, RpcError, RpcResult};
use std::collections::VecDeque;
use std::fmt;

/// Well-known filter identifiers, bit-exact in transport-filter
/// negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FilterId {
    Zlib = 1,
    Tls = 2,
    Ntlm = 3,
    Kerberos = 4,
    Negotiate = 5,
    Schannel = 6,
}

impl FilterId {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(FilterId::Zlib),
            2 => Some(FilterId::Tls),
            3 => Some(FilterId::Ntlm),
            4 => Some(FilterId::Kerberos),
            5 => Some(FilterId::Negotiate),
            6 => Some(FilterId::Schannel),
            _ => None,
        }
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterId::Zlib => "zlib",
            FilterId::Tls => "tls",
            FilterId::Ntlm => "ntlm",
            FilterId::Kerberos => "kerberos",
            FilterId::Negotiate => "negotiate",
            FilterId::Schannel => "schannel",
        };
        write!(f, "{name}")
    }
}

/// Handshake progress reported by stateful filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// More token exchange required before application data may flow.
    AuthContinue,
    /// Handshake finished on this side; the final token may still be in
    /// flight to the peer.
    AuthOk,
    /// Both sides confirmed; application records flow.
    AuthOkAck,
    AuthFailed,
}

/// Where a filter sits relative to its chain, passed into every operation.
///
/// `pass_down` hands bytes to the next filter toward the wire (or to the
/// wire itself at the end of the chain); `pass_up` hands bytes toward the
/// user. Deliveries are queued, not recursive.
pub struct FilterContext {
    ops: VecDeque<Op>,
    index: usize,
    chain_len: usize,
    wire_out: Vec<u8>,
    user_in: Vec<u8>,
}

enum Op {
    /// Outbound bytes for filter `index`'s write side.
    Write { index: usize, buf: Vec<u8> },
    /// Inbound bytes completing a read on filter `index`.
    ReadCompleted { index: usize, buf: Vec<u8> },
}

impl FilterContext {
    fn new(chain_len: usize) -> Self {
        Self {
            ops: VecDeque::new(),
            index: 0,
            chain_len,
            wire_out: Vec::new(),
            user_in: Vec::new(),
        }
    }

    /// Emit bytes toward the wire.
    pub fn pass_down(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        let next = self.index + 1;
        if next >= self.chain_len {
            self.wire_out.extend_from_slice(&buf);
        } else {
            self.ops.push_back(Op::Write { index: next, buf });
        }
    }

    /// Emit bytes toward the user.
    pub fn pass_up(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        if self.index == 0 {
            self.user_in.extend_from_slice(&buf);
        } else {
            self.ops.push_back(Op::ReadCompleted {
                index: self.index - 1,
                buf,
            });
        }
    }
}

/// A byte-stream transform in a chain.
///
/// Calls on one side are strictly sequential: a filter never observes a
/// read before the previous read on the same side has completed, likewise
/// for writes. A filter may split, coalesce or delay data, but must
/// preserve order within a side.
pub trait Filter: Send {
    fn id(&self) -> FilterId;

    /// Restore the filter to a state equivalent to a fresh instance.
    fn reset_state(&mut self);

    /// Outbound data from the pre side.
    fn write(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()>;

    /// Inbound data arriving from the post side.
    fn on_read_completed(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()>;

    /// Handshake progress; stateless filters are born `AuthOkAck`.
    fn handshake_state(&self) -> HandshakeState {
        HandshakeState::AuthOkAck
    }

    /// Produce any pending handshake bytes for the wire. Driven by the
    /// chain pump until the state reaches `AuthOkAck`.
    fn pump_handshake(&mut self, _ctx: &mut FilterContext) -> RpcResult<()> {
        Ok(())
    }

    /// DER certificates the peer presented, for filters that carry them.
    fn peer_certificates(&self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// Synchronous completion stacks deeper than this are deferred to the run
/// queue.
const RECURSION_LIMIT: usize = 16;

/// An ordered sequence of filters terminated by the wire.
///
/// An empty chain is the identity transform.
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
    ctx: FilterContext,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        let ctx = FilterContext::new(filters.len());
        Self { filters, ctx }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn ids(&self) -> Vec<FilterId> {
        self.filters.iter().map(|f| f.id()).collect()
    }

    /// Reset every filter to its freshly constructed state and drop any
    /// buffered bytes.
    pub fn reset_state(&mut self) {
        for f in &mut self.filters {
            f.reset_state();
        }
        self.ctx = FilterContext::new(self.filters.len());
    }

    /// True once every filter has finished its handshake.
    pub fn handshake_done(&self) -> bool {
        self.filters
            .iter()
            .all(|f| f.handshake_state() == HandshakeState::AuthOkAck)
    }

    pub fn handshake_failed(&self) -> bool {
        self.filters
            .iter()
            .any(|f| f.handshake_state() == HandshakeState::AuthFailed)
    }

    /// Certificates presented by the peer, collected across the chain.
    pub fn peer_certificates(&self) -> Vec<Vec<u8>> {
        self.filters
            .iter()
            .flat_map(|f| f.peer_certificates())
            .collect()
    }

    /// Drain queued deliveries. Each pump call dispatches up to
    /// `RECURSION_LIMIT` ops; anything beyond stays queued for the next
    /// call, which bounds the synchronous stack.
    fn pump(&mut self) -> RpcResult<()> {
        loop {
            let mut dispatched = 0;
            while dispatched < RECURSION_LIMIT {
                let Some(op) = self.ctx.ops.pop_front() else {
                    return Ok(());
                };
                dispatched += 1;
                match op {
                    Op::Write { index, buf } => {
                        self.ctx.index = index;
                        self.filters[index].write(&mut self.ctx, &buf)?;
                    }
                    Op::ReadCompleted { index, buf } => {
                        self.ctx.index = index;
                        self.filters[index].on_read_completed(&mut self.ctx, &buf)?;
                    }
                }
            }
            if self.ctx.ops.is_empty() {
                return Ok(());
            }
        }
    }

    /// Push outbound application bytes into the pre end of the chain and
    /// return whatever reached the wire end. During a handshake the result
    /// may be empty; the caller re-drains via `pending_wire` as handshake
    /// tokens arrive.
    pub fn write(&mut self, app: &[u8]) -> RpcResult<Vec<u8>> {
        if self.filters.is_empty() {
            return Ok(app.to_vec());
        }
        self.ctx.index = 0;
        self.filters[0].write(&mut self.ctx, app)?;
        self.pump()?;
        Ok(std::mem::take(&mut self.ctx.wire_out))
    }

    /// Feed inbound wire bytes into the post end of the chain and return
    /// the application bytes that emerged from the pre end.
    pub fn read(&mut self, wire: &[u8]) -> RpcResult<Vec<u8>> {
        if self.filters.is_empty() {
            return Ok(wire.to_vec());
        }
        let last = self.filters.len() - 1;
        self.ctx.index = last;
        self.filters[last].on_read_completed(&mut self.ctx, wire)?;
        self.pump()?;
        if self.handshake_failed() {
            return Err(RpcError::new(ErrorCode::SslHandshakeFailed));
        }
        Ok(std::mem::take(&mut self.ctx.user_in))
    }

    /// Drain wire bytes produced without new input, e.g. handshake tokens.
    pub fn pending_wire(&mut self) -> RpcResult<Vec<u8>> {
        for i in 0..self.filters.len() {
            self.ctx.index = i;
            self.filters[i].pump_handshake(&mut self.ctx)?;
        }
        self.pump()?;
        Ok(std::mem::take(&mut self.ctx.wire_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A filter that XORs every byte, for exercising chain plumbing.
    struct XorFilter(u8);

    impl Filter for XorFilter {
        fn id(&self) -> FilterId {
            FilterId::Zlib
        }
        fn reset_state(&mut self) {}
        fn write(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
            ctx.pass_down(buf.iter().map(|b| b ^ self.0).collect());
            Ok(())
        }
        fn on_read_completed(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
            ctx.pass_up(buf.iter().map(|b| b ^ self.0).collect());
            Ok(())
        }
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let mut chain = FilterChain::default();
        assert_eq!(chain.write(b"abc").unwrap(), b"abc");
        assert_eq!(chain.read(b"xyz").unwrap(), b"xyz");
        assert!(chain.handshake_done());
    }

    #[test]
    fn test_two_filter_round_trip() {
        let mut chain = FilterChain::new(vec![
            Box::new(XorFilter(0x55)),
            Box::new(XorFilter(0xaa)),
        ]);
        let wire = chain.write(b"hello").unwrap();
        assert_ne!(wire, b"hello");
        let back = chain.read(&wire).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn test_reset_state_matches_fresh_chain() {
        let mut chain = FilterChain::new(vec![
            Box::new(XorFilter(0x13)),
            Box::new(XorFilter(0x37)),
        ]);
        let first = chain.write(b"payload").unwrap();
        chain.reset_state();
        let second = chain.write(b"payload").unwrap();
        let mut fresh = FilterChain::new(vec![
            Box::new(XorFilter(0x13)),
            Box::new(XorFilter(0x37)),
        ]);
        assert_eq!(second, fresh.write(b"payload").unwrap());
        assert_eq!(first, second);
    }

    /// A filter that splits writes into single bytes, forcing many queued
    /// ops through the trampoline.
    struct ShreddingFilter;

    impl Filter for ShreddingFilter {
        fn id(&self) -> FilterId {
            FilterId::Zlib
        }
        fn reset_state(&mut self) {}
        fn write(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
            for b in buf {
                ctx.pass_down(vec![*b]);
            }
            Ok(())
        }
        fn on_read_completed(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
            for b in buf {
                ctx.pass_up(vec![*b]);
            }
            Ok(())
        }
    }

    #[test]
    fn test_deep_completion_stack_is_trampolined() {
        let mut chain = FilterChain::new(vec![
            Box::new(ShreddingFilter),
            Box::new(XorFilter(0x42)),
            Box::new(ShreddingFilter),
        ]);
        let data: Vec<u8> = (0..=255u8).collect();
        let wire = chain.write(&data).unwrap();
        assert_eq!(chain.read(&wire).unwrap(), data);
    }
}
