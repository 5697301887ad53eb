//! # Wire Codec
//!
//! Fixed-layout little-endian encoding for the three records that cross the
//! control connection: the negotiation request ([`Req`]), the statistics
//! snapshot ([`Stat`]), and its unidirectional counter sub-record
//! ([`Ustat`]). There is no framing and no length prefix; both ends know the
//! exact byte size of every record. Integers are written LSB-first for
//! exactly their declared width; the request id is a raw fixed-length
//! buffer, NUL-padded and not necessarily NUL-terminated.
//!
//! Short reads and writes are the messaging layer's problem; the codec only
//! ever sees complete buffers and fails on anything that is not exactly the
//! declared size.

use serde::Serialize;
use std::ops::AddAssign;
use thiserror::Error;

use crate::timing::{ClockVec, T_N};

/// Size of the fixed id buffer in a request
pub const STRSIZE: usize = 32;

/// Encoded size of a [`Req`]
pub const REQ_SIZE: usize = 47 + STRSIZE;

/// Encoded size of a [`Ustat`]
pub const USTAT_SIZE: usize = 24;

/// Encoded size of a [`Stat`]
pub const STAT_SIZE: usize = 6 + 2 * T_N * 8 + 4 * USTAT_SIZE;

/// Synchronization message exchanged to establish a common start point,
/// client-first. Three ASCII bytes plus the terminating NUL.
pub const SYNC: [u8; 4] = *b"SyN\0";

/// Decode failures. These are protocol errors: the peer sent something that
/// is not a well-formed record of the expected size.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated record: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("oversized record: {extra} trailing bytes")]
    Trailing { extra: usize },
}

/// Versioned negotiation request.
///
/// Carries the test index and every per-test parameter. Two copies exist on
/// the client: the local one the test reads its own settings from, and the
/// remote mirror that is encoded and sent to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Req {
    pub ver_maj: u16,
    pub ver_min: u16,
    pub ver_inc: u16,
    /// Index into the test registry; must agree on both ends
    pub req_index: u16,
    pub flip: u8,
    pub access_recv: u8,
    /// 0 = no pinning, otherwise 1-based CPU id
    pub affinity: u32,
    pub poll_mode: u8,
    pub port: u32,
    pub rd_atomic: u32,
    /// Deadline for individual control operations, seconds
    pub timeout: u32,
    pub msg_size: u32,
    pub mtu_size: u32,
    /// Message budget; 0 means run until the timer expires
    pub no_msgs: u32,
    pub sock_buf_size: u32,
    /// Measurement time, seconds; 0 means run by message budget
    pub time: u32,
    /// Short ASCII tag, NUL-padded
    pub id: [u8; STRSIZE],
}

impl Req {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::with_capacity(REQ_SIZE);
        enc.u16(self.ver_maj);
        enc.u16(self.ver_min);
        enc.u16(self.ver_inc);
        enc.u16(self.req_index);
        enc.u8(self.flip);
        enc.u8(self.access_recv);
        enc.u32(self.affinity);
        enc.u8(self.poll_mode);
        enc.u32(self.port);
        enc.u32(self.rd_atomic);
        enc.u32(self.timeout);
        enc.u32(self.msg_size);
        enc.u32(self.mtu_size);
        enc.u32(self.no_msgs);
        enc.u32(self.sock_buf_size);
        enc.u32(self.time);
        enc.bytes(&self.id);
        debug_assert_eq!(enc.buf.len(), REQ_SIZE);
        enc.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Dec::new(buf);
        let req = Req {
            ver_maj: dec.u16()?,
            ver_min: dec.u16()?,
            ver_inc: dec.u16()?,
            req_index: dec.u16()?,
            flip: dec.u8()?,
            access_recv: dec.u8()?,
            affinity: dec.u32()?,
            poll_mode: dec.u8()?,
            port: dec.u32()?,
            rd_atomic: dec.u32()?,
            timeout: dec.u32()?,
            msg_size: dec.u32()?,
            mtu_size: dec.u32()?,
            no_msgs: dec.u32()?,
            sock_buf_size: dec.u32()?,
            time: dec.u32()?,
            id: dec.array::<STRSIZE>()?,
        };
        dec.finish()?;
        Ok(req)
    }

    /// The id tag up to its first NUL.
    pub fn id_str(&self) -> &str {
        let end = self.id.iter().position(|&b| b == 0).unwrap_or(STRSIZE);
        std::str::from_utf8(&self.id[..end]).unwrap_or("")
    }

    /// Store an id tag. The caller has already enforced the length limit.
    pub fn set_id(&mut self, tag: &str) {
        let bytes = tag.as_bytes();
        let n = bytes.len().min(STRSIZE - 1);
        self.id = [0u8; STRSIZE];
        self.id[..n].copy_from_slice(&bytes[..n]);
    }
}

/// Unidirectional transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ustat {
    pub no_bytes: u64,
    pub no_msgs: u64,
    pub no_errs: u64,
}

impl AddAssign for Ustat {
    fn add_assign(&mut self, rhs: Ustat) {
        self.no_bytes += rhs.no_bytes;
        self.no_msgs += rhs.no_msgs;
        self.no_errs += rhs.no_errs;
    }
}

impl Ustat {
    fn encode_into(&self, enc: &mut Enc) {
        enc.u64(self.no_bytes);
        enc.u64(self.no_msgs);
        enc.u64(self.no_errs);
    }

    fn decode_from(dec: &mut Dec) -> Result<Self, WireError> {
        Ok(Ustat {
            no_bytes: dec.u64()?,
            no_msgs: dec.u64()?,
            no_errs: dec.u64()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::with_capacity(USTAT_SIZE);
        self.encode_into(&mut enc);
        enc.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Dec::new(buf);
        let ustat = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(ustat)
    }
}

/// Full statistics snapshot for one side.
///
/// `s`/`r` are this side's own send and receive counters; `rem_s`/`rem_r`
/// hold what this side recorded about the peer's traffic. After the results
/// exchange both pairs are cross-added so each snapshot carries combined
/// counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub no_cpus: u16,
    /// Tick frequency the CLOCK vectors are expressed in
    pub no_ticks: u16,
    /// Completion-queue depth, used by verbs tests; opaque here
    pub max_cqes: u16,
    pub time_s: ClockVec,
    pub time_e: ClockVec,
    pub s: Ustat,
    pub r: Ustat,
    pub rem_s: Ustat,
    pub rem_r: Ustat,
}

impl Stat {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::with_capacity(STAT_SIZE);
        enc.u16(self.no_cpus);
        enc.u16(self.no_ticks);
        enc.u16(self.max_cqes);
        for t in &self.time_s {
            enc.u64(*t);
        }
        for t in &self.time_e {
            enc.u64(*t);
        }
        self.s.encode_into(&mut enc);
        self.r.encode_into(&mut enc);
        self.rem_s.encode_into(&mut enc);
        self.rem_r.encode_into(&mut enc);
        debug_assert_eq!(enc.buf.len(), STAT_SIZE);
        enc.buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Dec::new(buf);
        let mut stat = Stat {
            no_cpus: dec.u16()?,
            no_ticks: dec.u16()?,
            max_cqes: dec.u16()?,
            ..Stat::default()
        };
        for t in stat.time_s.iter_mut() {
            *t = dec.u64()?;
        }
        for t in stat.time_e.iter_mut() {
            *t = dec.u64()?;
        }
        stat.s = Ustat::decode_from(&mut dec)?;
        stat.r = Ustat::decode_from(&mut dec)?;
        stat.rem_s = Ustat::decode_from(&mut dec)?;
        stat.rem_r = Ustat::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(stat)
    }
}

struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    fn with_capacity(n: usize) -> Self {
        Enc {
            buf: Vec::with_capacity(n),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Dec { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let have = self.buf.len() - self.pos;
        if have < n {
            return Err(WireError::Truncated { need: n - have, have });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn finish(self) -> Result<(), WireError> {
        let extra = self.buf.len() - self.pos;
        if extra != 0 {
            return Err(WireError::Trailing { extra });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_req() -> Req {
        let mut req = Req {
            ver_maj: 0,
            ver_min: 2,
            ver_inc: 0,
            req_index: 7,
            flip: 1,
            access_recv: 0,
            affinity: 3,
            poll_mode: 1,
            port: 19765,
            rd_atomic: 4,
            timeout: 5,
            msg_size: 65536,
            mtu_size: 1500,
            no_msgs: 1000,
            sock_buf_size: 131072,
            time: 10,
            id: [0u8; STRSIZE],
        };
        req.set_id("hello");
        req
    }

    #[test]
    fn req_round_trip_is_exact() {
        let req = sample_req();
        let buf = req.encode();
        assert_eq!(buf.len(), REQ_SIZE);
        assert_eq!(Req::decode(&buf).unwrap(), req);
    }

    #[test]
    fn req_msg_size_is_little_endian_at_fixed_offset() {
        // 65536 encodes as 00 00 01 00 at the msg_size offset.
        let buf = sample_req().encode();
        assert_eq!(&buf[27..31], &[0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn req_decode_then_encode_preserves_any_buffer() {
        let bytes: Vec<u8> = (0..REQ_SIZE).map(|i| (i * 7 + 3) as u8).collect();
        let req = Req::decode(&bytes).unwrap();
        assert_eq!(req.encode(), bytes);
    }

    #[test]
    fn req_decode_rejects_wrong_sizes() {
        let buf = sample_req().encode();
        assert!(matches!(
            Req::decode(&buf[..REQ_SIZE - 1]),
            Err(WireError::Truncated { .. })
        ));
        let mut long = buf.clone();
        long.push(0);
        assert_eq!(Req::decode(&long), Err(WireError::Trailing { extra: 1 }));
    }

    #[test]
    fn ustat_encoding_is_byte_exact() {
        let ustat = Ustat {
            no_bytes: 0x0102_0304_0506_0708,
            no_msgs: 0x11,
            no_errs: 0,
        };
        let buf = ustat.encode();
        assert_eq!(buf.len(), USTAT_SIZE);
        assert_eq!(
            &buf[..8],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(Ustat::decode(&buf).unwrap(), ustat);
    }

    #[test]
    fn stat_round_trip_is_exact() {
        let mut stat = Stat {
            no_cpus: 8,
            no_ticks: 100,
            max_cqes: 0,
            ..Stat::default()
        };
        for (i, t) in stat.time_s.iter_mut().enumerate() {
            *t = 1000 + i as u64;
        }
        for (i, t) in stat.time_e.iter_mut().enumerate() {
            *t = 2000 + 3 * i as u64;
        }
        stat.s = Ustat {
            no_bytes: 1_000_000,
            no_msgs: 1000,
            no_errs: 0,
        };
        stat.rem_r = Ustat {
            no_bytes: 999_000,
            no_msgs: 999,
            no_errs: 1,
        };

        let buf = stat.encode();
        assert_eq!(buf.len(), STAT_SIZE);
        assert_eq!(Stat::decode(&buf).unwrap(), stat);
    }

    #[test]
    fn id_is_nul_padded_and_readable() {
        let req = sample_req();
        assert_eq!(req.id_str(), "hello");
        assert_eq!(req.id[5], 0);
    }

    #[test]
    fn sync_literal_shape() {
        assert_eq!(&SYNC[..3], b"SyN");
        assert_eq!(SYNC[3], 0);
    }
}
