//! # Parameter Registry
//!
//! One entry per tunable, in a dense table whose position doubles as its
//! identifier. Every user-visible parameter exists twice: a local entry that
//! writes into the request this side runs with, and a remote entry that
//! writes into the mirror request sent to the peer. An option may target one
//! cell or both; the two storage cells are never aliased.
//!
//! The registry tracks three flags per entry: `set` (a user supplied it),
//! `used` (the current test consumes it), and `inuse` (relevant right now).
//! At test start, parameters that were set but are not consumed by the test
//! produce a warning, deduplicated across a loc/rem pair.

use anyhow::{bail, Result};
use tracing::warn;

use crate::wire::{Req, STRSIZE};

/// Semantic type of a parameter, which selects its option grammar and its
/// rendering in the used-parameter display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Long,
    Size,
    Time,
    Str,
}

/// Which request a parameter writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Loc,
    Rem,
}

/// Request field a parameter is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    AccessRecv,
    Affinity,
    Flip,
    Id,
    MsgSize,
    MtuSize,
    NoMsgs,
    PollMode,
    Port,
    RdAtomic,
    SockBufSize,
    Time,
    Timeout,
}

/// Identifier of one registry entry. The discriminant is the table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ParamId {
    LocAccessRecv = 0,
    RemAccessRecv,
    LocAffinity,
    RemAffinity,
    LocFlip,
    RemFlip,
    LocId,
    RemId,
    LocMsgSize,
    RemMsgSize,
    LocMtuSize,
    RemMtuSize,
    LocNoMsgs,
    RemNoMsgs,
    LocPollMode,
    RemPollMode,
    LocPort,
    RemPort,
    LocRdAtomic,
    RemRdAtomic,
    LocSockBufSize,
    RemSockBufSize,
    LocTime,
    RemTime,
    LocTimeout,
    RemTimeout,
}

/// Number of registry entries
pub const PARAM_COUNT: usize = 26;

struct ParamDef {
    id: ParamId,
    kind: ParamKind,
    side: Side,
    field: Field,
    /// Canonical name used when no option name was recorded
    canonical: &'static str,
}

macro_rules! pdef {
    ($id:ident, $kind:ident, $side:ident, $field:ident, $name:literal) => {
        ParamDef {
            id: ParamId::$id,
            kind: ParamKind::$kind,
            side: Side::$side,
            field: Field::$field,
            canonical: $name,
        }
    };
}

const DEFS: [ParamDef; PARAM_COUNT] = [
    pdef!(LocAccessRecv, Long, Loc, AccessRecv, "loc_access_recv"),
    pdef!(RemAccessRecv, Long, Rem, AccessRecv, "rem_access_recv"),
    pdef!(LocAffinity, Long, Loc, Affinity, "loc_affinity"),
    pdef!(RemAffinity, Long, Rem, Affinity, "rem_affinity"),
    pdef!(LocFlip, Long, Loc, Flip, "loc_flip"),
    pdef!(RemFlip, Long, Rem, Flip, "rem_flip"),
    pdef!(LocId, Str, Loc, Id, "loc_id"),
    pdef!(RemId, Str, Rem, Id, "rem_id"),
    pdef!(LocMsgSize, Size, Loc, MsgSize, "loc_msg_size"),
    pdef!(RemMsgSize, Size, Rem, MsgSize, "rem_msg_size"),
    pdef!(LocMtuSize, Size, Loc, MtuSize, "loc_mtu_size"),
    pdef!(RemMtuSize, Size, Rem, MtuSize, "rem_mtu_size"),
    pdef!(LocNoMsgs, Long, Loc, NoMsgs, "loc_no_msgs"),
    pdef!(RemNoMsgs, Long, Rem, NoMsgs, "rem_no_msgs"),
    pdef!(LocPollMode, Long, Loc, PollMode, "loc_poll_mode"),
    pdef!(RemPollMode, Long, Rem, PollMode, "rem_poll_mode"),
    pdef!(LocPort, Long, Loc, Port, "loc_port"),
    pdef!(RemPort, Long, Rem, Port, "rem_port"),
    pdef!(LocRdAtomic, Long, Loc, RdAtomic, "loc_rd_atomic"),
    pdef!(RemRdAtomic, Long, Rem, RdAtomic, "rem_rd_atomic"),
    pdef!(LocSockBufSize, Size, Loc, SockBufSize, "loc_sock_buf_size"),
    pdef!(RemSockBufSize, Size, Rem, SockBufSize, "rem_sock_buf_size"),
    pdef!(LocTime, Time, Loc, Time, "loc_time"),
    pdef!(RemTime, Time, Rem, Time, "rem_time"),
    pdef!(LocTimeout, Time, Loc, Timeout, "loc_timeout"),
    pdef!(RemTimeout, Time, Rem, Timeout, "rem_timeout"),
];

/// The two parameter stores: the request this side runs with and the mirror
/// sent to the peer.
#[derive(Debug, Clone, Default)]
pub struct ReqPair {
    pub loc: Req,
    pub rem: Req,
}

impl ReqPair {
    fn side_mut(&mut self, side: Side) -> &mut Req {
        match side {
            Side::Loc => &mut self.loc,
            Side::Rem => &mut self.rem,
        }
    }

    fn side(&self, side: Side) -> &Req {
        match side {
            Side::Loc => &self.loc,
            Side::Rem => &self.rem,
        }
    }
}

fn store_u64(req: &mut Req, field: Field, v: u64) {
    match field {
        Field::AccessRecv => req.access_recv = v as u8,
        Field::Affinity => req.affinity = v as u32,
        Field::Flip => req.flip = v as u8,
        Field::MsgSize => req.msg_size = v as u32,
        Field::MtuSize => req.mtu_size = v as u32,
        Field::NoMsgs => req.no_msgs = v as u32,
        Field::PollMode => req.poll_mode = v as u8,
        Field::Port => req.port = v as u32,
        Field::RdAtomic => req.rd_atomic = v as u32,
        Field::SockBufSize => req.sock_buf_size = v as u32,
        Field::Time => req.time = v as u32,
        Field::Timeout => req.timeout = v as u32,
        Field::Id => unreachable!("id is a string parameter"),
    }
}

fn load_u64(req: &Req, field: Field) -> u64 {
    match field {
        Field::AccessRecv => req.access_recv as u64,
        Field::Affinity => req.affinity as u64,
        Field::Flip => req.flip as u64,
        Field::MsgSize => req.msg_size as u64,
        Field::MtuSize => req.mtu_size as u64,
        Field::NoMsgs => req.no_msgs as u64,
        Field::PollMode => req.poll_mode as u64,
        Field::Port => req.port as u64,
        Field::RdAtomic => req.rd_atomic as u64,
        Field::SockBufSize => req.sock_buf_size as u64,
        Field::Time => req.time as u64,
        Field::Timeout => req.timeout as u64,
        Field::Id => unreachable!("id is a string parameter"),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ParamMeta {
    name: Option<&'static str>,
    set: bool,
    used: bool,
    inuse: bool,
}

/// Flag and name state for every registry entry. Values live in [`ReqPair`].
#[derive(Debug, Clone)]
pub struct Params {
    meta: [ParamMeta; PARAM_COUNT],
}

impl Default for Params {
    fn default() -> Self {
        Self::new()
    }
}

impl Params {
    pub fn new() -> Self {
        for (i, def) in DEFS.iter().enumerate() {
            assert!(
                def.id as usize == i,
                "internal error: parameter table out of order at {}",
                def.canonical
            );
        }
        Params {
            meta: [ParamMeta::default(); PARAM_COUNT],
        }
    }

    /// Silent write, used for test-supplied defaults. Does not mark the
    /// entry as set or used.
    pub fn set_value(&mut self, reqs: &mut ReqPair, id: ParamId, v: u64) {
        let def = &DEFS[id as usize];
        store_u64(reqs.side_mut(def.side), def.field, v);
    }

    /// Record a user-visible numeric assignment. A `None` id is the no-op
    /// sentinel for options that only target one side.
    pub fn set_param(
        &mut self,
        reqs: &mut ReqPair,
        name: &'static str,
        id: Option<ParamId>,
        v: u64,
    ) {
        let Some(id) = id else { return };
        let def = &DEFS[id as usize];
        store_u64(reqs.side_mut(def.side), def.field, v);
        let meta = &mut self.meta[id as usize];
        if meta.name.is_none() {
            meta.name = Some(name);
        }
        meta.set = true;
    }

    /// Record a user-visible string assignment. Strings must fit the fixed
    /// wire buffer with a terminating NUL.
    pub fn set_param_str(
        &mut self,
        reqs: &mut ReqPair,
        name: &'static str,
        id: Option<ParamId>,
        s: &str,
    ) -> Result<()> {
        let Some(id) = id else { return Ok(()) };
        if s.len() > STRSIZE - 1 {
            bail!("{} is longer than {} characters: {}", name, STRSIZE - 1, s);
        }
        let def = &DEFS[id as usize];
        debug_assert_eq!(def.kind, ParamKind::Str);
        reqs.side_mut(def.side).set_id(s);
        let meta = &mut self.meta[id as usize];
        if meta.name.is_none() {
            meta.name = Some(name);
        }
        meta.set = true;
        Ok(())
    }

    /// Mark a parameter as consumed by the current test.
    pub fn mark_used(&mut self, id: ParamId) {
        let meta = &mut self.meta[id as usize];
        meta.used = true;
        meta.inuse = true;
    }

    /// True iff a display name has been stored, i.e. the parameter was
    /// explicitly assigned.
    pub fn is_set(&self, id: ParamId) -> bool {
        self.meta[id as usize].name.is_some() && self.meta[id as usize].set
    }

    /// Clear per-test relevance ahead of a new test.
    pub fn reset_inuse(&mut self) {
        for meta in self.meta.iter_mut() {
            meta.inuse = false;
        }
    }

    /// Warn once per set-but-unconsumed parameter, then suppress the paired
    /// entry carrying the same display name so one option warns once.
    pub fn warn_unused(&mut self, test: &str) {
        for i in 0..PARAM_COUNT {
            if self.meta[i].set && !self.meta[i].used {
                let name = self.meta[i].name.unwrap_or(DEFS[i].canonical);
                warn!("{} set but not used in test {}", name, test);
                for j in i + 1..PARAM_COUNT {
                    if self.meta[j].name == self.meta[i].name {
                        self.meta[j].set = false;
                    }
                }
            }
        }
    }

    /// Name of the first set parameter, for rejecting client-only options
    /// in server mode.
    pub fn first_set(&self) -> Option<&'static str> {
        self.meta
            .iter()
            .enumerate()
            .find(|(_, m)| m.set)
            .map(|(i, m)| m.name.unwrap_or(DEFS[i].canonical))
    }

    /// Parameters consumed by the current test, for the used-value display.
    pub fn inuse_entries<'a>(
        &'a self,
        reqs: &'a ReqPair,
    ) -> impl Iterator<Item = (&'static str, ParamKind, u64, &'a Req)> + 'a {
        DEFS.iter().filter_map(move |def| {
            let meta = &self.meta[def.id as usize];
            if !meta.inuse {
                return None;
            }
            let req = reqs.side(def.side);
            let value = match def.kind {
                ParamKind::Str => 0,
                _ => load_u64(req, def.field),
            };
            Some((meta.name.unwrap_or(def.canonical), def.kind, value, req))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_dense_and_ordered() {
        // Construction itself asserts the ordering invariant.
        let _ = Params::new();
        assert_eq!(DEFS.len(), PARAM_COUNT);
    }

    #[test]
    fn set_param_tracks_name_and_flag() {
        let mut params = Params::new();
        let mut reqs = ReqPair::default();

        assert!(!params.is_set(ParamId::LocMsgSize));
        params.set_param(&mut reqs, "--msg-size", Some(ParamId::LocMsgSize), 4096);
        params.set_param(&mut reqs, "--msg-size", Some(ParamId::RemMsgSize), 4096);

        assert!(params.is_set(ParamId::LocMsgSize));
        assert_eq!(reqs.loc.msg_size, 4096);
        assert_eq!(reqs.rem.msg_size, 4096);
        // Local and remote storage are separate cells.
        params.set_param(&mut reqs, "--loc-msg-size", Some(ParamId::LocMsgSize), 512);
        assert_eq!(reqs.loc.msg_size, 512);
        assert_eq!(reqs.rem.msg_size, 4096);
    }

    #[test]
    fn set_value_is_silent() {
        let mut params = Params::new();
        let mut reqs = ReqPair::default();
        params.set_value(&mut reqs, ParamId::LocTime, 2);
        assert_eq!(reqs.loc.time, 2);
        assert!(!params.is_set(ParamId::LocTime));
    }

    #[test]
    fn none_id_is_a_no_op() {
        let mut params = Params::new();
        let mut reqs = ReqPair::default();
        params.set_param(&mut reqs, "--whatever", None, 77);
        assert_eq!(reqs.loc, Req::default());
        assert_eq!(reqs.rem, Req::default());
    }

    #[test]
    fn long_id_string_is_rejected() {
        let mut params = Params::new();
        let mut reqs = ReqPair::default();
        let long = "x".repeat(STRSIZE);
        assert!(params
            .set_param_str(&mut reqs, "--id", Some(ParamId::LocId), &long)
            .is_err());
        assert!(params
            .set_param_str(&mut reqs, "--id", Some(ParamId::LocId), "tag")
            .is_ok());
        assert_eq!(reqs.loc.id_str(), "tag");
    }

    #[test]
    fn unused_warning_suppresses_the_pair() {
        let mut params = Params::new();
        let mut reqs = ReqPair::default();
        params.set_param(&mut reqs, "--sock-buf-size", Some(ParamId::LocSockBufSize), 1);
        params.set_param(&mut reqs, "--sock-buf-size", Some(ParamId::RemSockBufSize), 1);

        params.warn_unused("conf");
        // The paired entry was cleared so the next pass stays quiet for it.
        assert!(!params.is_set(ParamId::RemSockBufSize));
        assert!(params.is_set(ParamId::LocSockBufSize));
    }

    #[test]
    fn inuse_entries_follow_mark_used() {
        let mut params = Params::new();
        let mut reqs = ReqPair::default();
        params.set_param(&mut reqs, "--time", Some(ParamId::LocTime), 10);
        params.mark_used(ParamId::LocTime);

        let names: Vec<&str> = params.inuse_entries(&reqs).map(|(n, _, _, _)| n).collect();
        assert_eq!(names, vec!["--time"]);

        params.reset_inuse();
        assert_eq!(params.inuse_entries(&reqs).count(), 0);
    }
}
