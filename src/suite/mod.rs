//! # Test Registry
//!
//! The ordered table of tests this build knows. A test is a name bound to a
//! client body and a server body plus the list of parameters it consumes;
//! the table position is the index carried in the negotiation request, so
//! the order here is part of the wire contract and changing it is a
//! version-bumping event.

pub mod conf;
pub mod tcp;
pub mod udp;

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;

use crate::control::TestContext;
use crate::params::ParamId;

/// Future returned by a test body.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// One side of a test, driving the shared context.
pub type TestFn = for<'a> fn(&'a mut TestContext) -> BoxFuture<'a>;

/// Registry entry.
pub struct TestCase {
    pub name: &'static str,
    /// Parameters this test consumes, marked used at test start
    pub uses: &'static [ParamId],
    pub client: TestFn,
    pub server: TestFn,
}

/// All tests, in wire-index order.
pub static TESTS: &[TestCase] = &[
    TestCase {
        name: "conf",
        uses: &[],
        client: conf::client,
        server: conf::server,
    },
    TestCase {
        name: "tcp_bw",
        uses: &[
            ParamId::LocMsgSize,
            ParamId::RemMsgSize,
            ParamId::LocSockBufSize,
            ParamId::RemSockBufSize,
            ParamId::LocNoMsgs,
            ParamId::RemNoMsgs,
        ],
        client: tcp::bw_client,
        server: tcp::bw_server,
    },
    TestCase {
        name: "tcp_lat",
        uses: &[
            ParamId::LocMsgSize,
            ParamId::RemMsgSize,
            ParamId::LocNoMsgs,
            ParamId::RemNoMsgs,
        ],
        client: tcp::lat_client,
        server: tcp::lat_server,
    },
    TestCase {
        name: "udp_bw",
        uses: &[
            ParamId::LocMsgSize,
            ParamId::RemMsgSize,
            ParamId::LocSockBufSize,
            ParamId::RemSockBufSize,
            ParamId::LocNoMsgs,
            ParamId::RemNoMsgs,
        ],
        client: udp::bw_client,
        server: udp::bw_server,
    },
    TestCase {
        name: "udp_lat",
        uses: &[
            ParamId::LocMsgSize,
            ParamId::RemMsgSize,
            ParamId::LocNoMsgs,
            ParamId::RemNoMsgs,
        ],
        client: udp::lat_client,
        server: udp::lat_server,
    },
];

/// Look a test up by name. Client side; linear is fine at this size.
pub fn find(name: &str) -> Option<(u16, &'static TestCase)> {
    TESTS
        .iter()
        .position(|t| t.name == name)
        .map(|i| (i as u16, &TESTS[i]))
}

/// Look a test up by wire index. Server side.
pub fn by_index(index: u16) -> Option<&'static TestCase> {
    TESTS.get(index as usize)
}

/// Test names, for help output.
pub fn names() -> impl Iterator<Item = &'static str> {
    TESTS.iter().map(|t| t.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_agrees_with_by_index() {
        for (i, test) in TESTS.iter().enumerate() {
            let (index, found) = find(test.name).unwrap();
            assert_eq!(index as usize, i);
            assert_eq!(found.name, test.name);
            assert_eq!(by_index(index).unwrap().name, test.name);
        }
    }

    #[test]
    fn unknown_names_and_indices_miss() {
        assert!(find("rdma_bw").is_none());
        assert!(by_index(TESTS.len() as u16).is_none());
    }

    #[test]
    fn registry_names_are_unique() {
        for (i, a) in TESTS.iter().enumerate() {
            for b in &TESTS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}
