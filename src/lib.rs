//! # qperf
//!
//! A two-sided network performance measurement tool implemented in Rust.
//! A server process listens on a well-known TCP port and runs one test per
//! accepted connection; a client negotiates the test through a versioned
//! request, drives the measurement cooperatively with the server, and prints
//! unit-scaled results.

pub mod channel;
pub mod cli;
pub mod control;
pub mod params;
pub mod results;
pub mod show;
pub mod stats;
pub mod suite;
pub mod timing;
pub mod wire;

pub use cli::Args;
pub use control::{ClientConfig, ServerConfig, TestContext};
pub use params::{ParamId, Params, ReqPair};
pub use show::{ShowOpts, ShowTable};
pub use stats::Res;
pub use wire::{Req, Stat, Ustat};

/// The current version of qperf
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version triple carried in every request. The major/minor pair gates
/// interoperability; incremental differences are tolerated.
pub const VER_MAJ: u16 = 0;
pub const VER_MIN: u16 = 2;
pub const VER_INC: u16 = 0;

/// Default configuration values
pub mod defaults {
    /// Well-known control port the server listens on
    pub const LISTEN_PORT: u16 = 19765;

    /// Default measurement time in seconds when no message budget is given
    pub const TEST_TIME: u32 = 2;

    /// Default deadline for individual control-channel operations, seconds
    pub const TIMEOUT: u32 = 5;

    /// Default deadline for the server's initial request read, seconds
    pub const SERVER_TIMEOUT: u32 = 5;

    /// Default number of significant digits in rendered results
    pub const PRECISION: usize = 3;

    /// Default message size for streaming TCP tests
    pub const TCP_BW_MSG_SIZE: u32 = 65536;

    /// Default message size for streaming UDP tests
    pub const UDP_BW_MSG_SIZE: u32 = 32768;

    /// Default message size for ping-pong latency tests
    pub const LAT_MSG_SIZE: u32 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The wire-level version constants must track the package version.
    #[test]
    fn version_constants_match_package() {
        let mut parts = VERSION.split('.');
        assert_eq!(parts.next().unwrap().parse::<u16>().unwrap(), VER_MAJ);
        assert_eq!(parts.next().unwrap().parse::<u16>().unwrap(), VER_MIN);
        assert_eq!(parts.next().unwrap().parse::<u16>().unwrap(), VER_INC);
    }
}
