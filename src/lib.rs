// Copyright (C) 2024 the nalstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Annex-B H.264 elementary stream ingest.
//!
//! This library turns a raw TCP byte stream carrying an Annex-B H.264
//! elementary stream into decoder-ready sample buffers. It has three layers,
//! composed by [`session::StreamSession`]:
//!
//! 1.  [`nal::NalScanner`] incrementally finds 4-byte `00 00 00 01` start
//!     codes in an unbounded, arbitrarily chunked byte stream and emits
//!     complete [`nal::NalUnit`]s.
//! 2.  [`frame::FrameBuilder`] tracks the most recent SPS/PPS parameter sets
//!     and assembles each video coding layer unit into a
//!     [`frame::SampleBuffer`]: parameter sets plus frame payload, with
//!     Annex-B prefixing, ready to hand to an external decoder.
//! 3.  [`session::StreamSession`] drives one connection: it reads from a byte
//!     source, feeds the scanner and builder, and forwards completed sample
//!     buffers to a bounded channel in strict arrival order.
//!
//! Each connection gets an independent scanner/builder/session triple; there
//! is no shared mutable state between sessions.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::Display;
use std::net::SocketAddr;

mod error;
mod hex;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod frame;
pub mod nal;
pub mod session;

use error::ErrorInt;

/// A wall time taken from the local machine's realtime clock, used in
/// diagnostics.
///
/// Currently this just allows formatting via `Debug` and `Display`.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// Context for one stream-bearing connection.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    /// Returns a placeholder context for byte sources with no underlying
    /// socket, such as files or in-memory pipes.
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self::new(addr, addr)
    }

    /// The local address of this end of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address of the peer sending the stream.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}(me)@{}",
            &self.peer_addr, &self.local_addr, &self.established_wall,
        )
    }
}
