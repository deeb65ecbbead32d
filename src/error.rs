// Copyright (C) 2024 the nalstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::ConnectionContext;
use bytes::Bytes;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages: each session-fatal
/// error carries the connection context and stream position, which is enough
/// to find the offending bytes in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to inspect byte source: {0}")]
    Setup(#[source] std::io::Error),

    /// The accumulated buffer exceeded the configured ceiling with no start
    /// code found. Fatal to the session.
    #[error(
        "[{conn_ctx}] buffered {buffered} bytes with no NAL unit boundary, \
         exceeding the {limit}-byte ceiling; buffer starts with:\n{:?}",
        crate::hex::Snippet::new(head, 64)
    )]
    StreamTooLarge {
        conn_ctx: ConnectionContext,
        buffered: usize,
        limit: usize,
        head: Bytes,
    },

    #[error("[{conn_ctx}, pos {pos}] Error reading from peer: {source}")]
    ReadError {
        conn_ctx: ConnectionContext,
        pos: u64,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}, pos {pos}] Sample buffer receiver dropped")]
    SinkClosed { conn_ctx: ConnectionContext, pos: u64 },
}
