//! Zlib stream compression filter.
//!
//! Each outbound write is deflated into one record, `[u32 LE compressed
//! length][deflate stream]`. The read side accumulates wire bytes until a
//! whole record is available and inflates it. Record boundaries therefore
//! survive arbitrary re-chunking by lower filters or the transport.

use super::{Filter, FilterContext, FilterId};
use crate::error::{ErrorCode, RpcError, RpcResult};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const RECORD_HEADER_LEN: usize = 4;

/// Inflated records larger than this indicate a corrupt or hostile peer.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

pub struct ZlibCompressionFilter {
    level: Compression,
    inbound: Vec<u8>,
}

impl Default for ZlibCompressionFilter {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl ZlibCompressionFilter {
    pub fn new(level: Compression) -> Self {
        Self {
            level,
            inbound: Vec::new(),
        }
    }

    fn deflate(&self, buf: &[u8]) -> RpcResult<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(buf)
            .and_then(|_| encoder.finish())
            .map_err(|e| RpcError::with_what(ErrorCode::SocketError, e.to_string()))
    }

    fn inflate(record: &[u8]) -> RpcResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut decoder = ZlibDecoder::new(record).take(MAX_RECORD_LEN as u64 + 1);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| RpcError::with_what(ErrorCode::SocketError, e.to_string()))?;
        if out.len() > MAX_RECORD_LEN {
            return Err(RpcError::new(ErrorCode::ClientMessageLength));
        }
        Ok(out)
    }
}

impl Filter for ZlibCompressionFilter {
    fn id(&self) -> FilterId {
        FilterId::Zlib
    }

    fn reset_state(&mut self) {
        self.inbound.clear();
    }

    fn write(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
        let compressed = self.deflate(buf)?;
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + compressed.len());
        record.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        record.extend_from_slice(&compressed);
        ctx.pass_down(record);
        Ok(())
    }

    fn on_read_completed(&mut self, ctx: &mut FilterContext, buf: &[u8]) -> RpcResult<()> {
        self.inbound.extend_from_slice(buf);
        loop {
            if self.inbound.len() < RECORD_HEADER_LEN {
                return Ok(());
            }
            let len = u32::from_le_bytes([
                self.inbound[0],
                self.inbound[1],
                self.inbound[2],
                self.inbound[3],
            ]) as usize;
            if len > MAX_RECORD_LEN {
                return Err(RpcError::new(ErrorCode::ClientMessageLength));
            }
            if self.inbound.len() < RECORD_HEADER_LEN + len {
                return Ok(());
            }
            let record: Vec<u8> = self
                .inbound
                .drain(..RECORD_HEADER_LEN + len)
                .skip(RECORD_HEADER_LEN)
                .collect();
            ctx.pass_up(Self::inflate(&record)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;

    fn chain() -> FilterChain {
        FilterChain::new(vec![Box::new(ZlibCompressionFilter::default())])
    }

    #[test]
    fn test_round_trip() {
        let mut tx = chain();
        let mut rx = chain();
        let payload = vec![7u8; 10_000];
        let wire = tx.write(&payload).unwrap();
        assert!(wire.len() < payload.len());
        assert_eq!(rx.read(&wire).unwrap(), payload);
    }

    #[test]
    fn test_split_delivery() {
        let mut tx = chain();
        let mut rx = chain();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let wire = tx.write(&payload).unwrap();

        // Feed the wire bytes one at a time; the record must reassemble.
        let mut got = Vec::new();
        for b in &wire {
            got.extend(rx.read(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(got, payload);
    }

    #[test]
    fn test_two_records_in_one_delivery() {
        let mut tx = chain();
        let mut rx = chain();
        let mut wire = tx.write(b"first").unwrap();
        wire.extend(tx.write(b"second").unwrap());
        assert_eq!(rx.read(&wire).unwrap(), b"firstsecond");
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut rx = chain();
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_le_bytes());
        wire.extend_from_slice(&[0u8; 16]);
        assert!(rx.read(&wire).is_err());
    }
}
