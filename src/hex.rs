// Copyright (C) 2024 the nalstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps, for embedding buffer contents in error messages
//! without flooding the log when the buffer is large.

use pretty_hex::PrettyHex;

pub(crate) struct Snippet<'a> {
    bytes: &'a [u8],
    limit: usize,
}

impl<'a> Snippet<'a> {
    pub(crate) fn new(bytes: &'a [u8], limit: usize) -> Self {
        Self { bytes, limit }
    }
}

impl std::fmt::Debug for Snippet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.bytes[..self.bytes.len().min(self.limit)];
        write!(
            f,
            "{:?}",
            shown.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(omitted) = self.bytes.len().checked_sub(self.limit) {
            if omitted > 0 {
                write!(f, "\n...{omitted} bytes not shown...")?;
            }
        }
        Ok(())
    }
}
