// Copyright (C) 2024 the nalstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental Annex-B scanning: finding NAL unit boundaries in an
//! unbounded, arbitrarily chunked byte stream.

use bytes::{Buf, Bytes, BytesMut};

/// The 4-byte Annex-B start code delimiting NAL units.
///
/// The 3-byte form (`00 00 01`) some encoders emit is deliberately not
/// recognized; bytes that happen to contain it are treated as payload.
pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit type, from the low five bits of the unit's first payload byte.
///
/// Only the types frame assembly cares about are distinguished; everything
/// else is `Unknown` and dropped before reaching the builder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitType {
    /// Sequence parameter set (type 7).
    Sps,
    /// Picture parameter set (type 8).
    Pps,
    /// IDR picture slice (type 5); a key frame.
    Idr,
    /// Non-IDR picture slice (type 1); depends on a prior reference.
    NonIdr,
    /// Any other type number.
    Unknown(u8),
}

impl UnitType {
    fn from_header(hdr: u8) -> Self {
        match hdr & 0x1f {
            7 => UnitType::Sps,
            8 => UnitType::Pps,
            5 => UnitType::Idr,
            1 => UnitType::NonIdr,
            t => UnitType::Unknown(t),
        }
    }
}

/// One complete NAL unit, start code stripped, classified on construction.
///
/// Created by [`NalScanner`] the instant a start code closes a span and
/// consumed once by [`crate::frame::FrameBuilder`]; units are never empty.
#[derive(Clone)]
pub struct NalUnit {
    payload: Bytes,
    unit_type: UnitType,
}

impl NalUnit {
    pub(crate) fn new(payload: Bytes) -> Self {
        debug_assert!(!payload.is_empty());
        let unit_type = UnitType::from_header(payload[0]);
        Self { payload, unit_type }
    }

    pub fn unit_type(&self) -> UnitType {
        self.unit_type
    }

    /// The unit's length in bytes, excluding the start code.
    pub fn byte_len(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl std::fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalUnit")
            .field("unit_type", &self.unit_type)
            .field("byte_len", &self.payload.len())
            .finish()
    }
}

/// Returned by [`NalScanner::check_overflow`] when the buffer exceeds its
/// ceiling with no boundary in sight. The session wraps this with connection
/// context into the public error type.
#[derive(Debug)]
pub struct BufferOverflow {
    pub(crate) buffered: usize,
    pub(crate) limit: usize,
    pub(crate) head: Bytes,
}

/// Incremental start-code scanner over an append-only byte buffer.
///
/// Bytes arrive in arbitrary chunks via [`NalScanner::push`]; complete units
/// come out of [`NalScanner::pull`]. The scan cursor survives across calls,
/// so bytes already examined are never re-scanned regardless of how the
/// stream was chunked. Consumed prefixes are dropped from the buffer as each
/// boundary is confirmed.
pub struct NalScanner {
    buf: BytesMut,

    /// Index of the next byte to examine, relative to the current buffer.
    /// Always points past every previously confirmed start code.
    search_idx: usize,

    max_buffered: usize,
    strip_emulation_prevention: bool,
}

impl NalScanner {
    pub fn new(max_buffered: usize, strip_emulation_prevention: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            search_idx: 0,
            max_buffered,
            strip_emulation_prevention,
        }
    }

    /// Appends a chunk of stream bytes to the buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Scans from the resume point for the next complete unit.
    ///
    /// Returns `None` once fewer than four unexamined bytes remain; callers
    /// should `push` more input and retry. A start code at the front of the
    /// buffer closes a zero-length span (the previous unit was immediately
    /// adjacent) and is skipped without emitting.
    pub fn pull(&mut self) -> Option<NalUnit> {
        while self.search_idx + START_CODE.len() <= self.buf.len() {
            if self.buf[self.search_idx..self.search_idx + START_CODE.len()] != START_CODE {
                self.search_idx += 1;
                continue;
            }
            if self.search_idx == 0 {
                self.buf.advance(START_CODE.len());
                continue;
            }
            let mut payload = self.buf.split_to(self.search_idx).freeze();
            self.buf.advance(START_CODE.len());
            self.search_idx = 0;
            if self.strip_emulation_prevention {
                payload = strip_emulation_prevention(payload);
            }
            return Some(NalUnit::new(payload));
        }
        None
    }

    /// Verifies the buffer hasn't outgrown its ceiling.
    ///
    /// Call after draining [`NalScanner::pull`]: a chunk is allowed to
    /// momentarily exceed the ceiling as long as boundaries within it bring
    /// the buffer back down. Legitimate NAL units are bounded by encoder
    /// configuration, so a persistent overflow means the stream is garbage
    /// or hostile.
    pub fn check_overflow(&self) -> Result<(), BufferOverflow> {
        if self.buf.len() > self.max_buffered {
            return Err(BufferOverflow {
                buffered: self.buf.len(),
                limit: self.max_buffered,
                head: Bytes::copy_from_slice(&self.buf[..self.buf.len().min(64)]),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for NalScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalScanner")
            .field("buffered", &self.buf.len())
            .field("search_idx", &self.search_idx)
            .field("max_buffered", &self.max_buffered)
            .finish()
    }
}

/// Removes H.264 emulation-prevention bytes: each `00 00 03` becomes `00 00`.
///
/// Most payloads contain no such sequence, so the input is returned untouched
/// unless a copy is actually needed.
fn strip_emulation_prevention(data: Bytes) -> Bytes {
    if !data.windows(3).any(|w| w == [0, 0, 3]) {
        return data;
    }
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &b in data.iter() {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOADS: &[&[u8]] = &[
        b"\x67\xaa\xbb",
        b"\x68\xcc\xdd",
        b"\x65\xee\xff\x01\x02\x03",
        b"\x41\x11\x22\x33",
    ];

    fn annex_b_stream(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in payloads {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(p);
        }
        // Trailing start code so the final unit's boundary closes.
        out.extend_from_slice(&START_CODE);
        out
    }

    fn collect(scanner: &mut NalScanner) -> Vec<Bytes> {
        let mut units = Vec::new();
        while let Some(u) = scanner.pull() {
            units.push(u.into_payload());
        }
        units
    }

    #[test]
    fn emits_units_regardless_of_chunking() {
        let stream = annex_b_stream(PAYLOADS);
        for chunk_size in [1, 2, 3, 5, 7, stream.len()] {
            let mut scanner = NalScanner::new(8 << 20, false);
            let mut units = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                scanner.push(chunk);
                units.extend(collect(&mut scanner));
            }
            assert_eq!(units.len(), PAYLOADS.len(), "chunk_size={chunk_size}");
            for (got, want) in units.iter().zip(PAYLOADS) {
                assert_eq!(&got[..], *want, "chunk_size={chunk_size}");
            }
        }
    }

    #[test]
    fn no_false_boundary_inside_payload() {
        // 00 00 00 02 looks close to a start code but isn't one.
        let payload: &[u8] = b"\x65\x00\x00\x00\x02\x10";
        let stream = annex_b_stream(&[payload]);
        let mut scanner = NalScanner::new(8 << 20, false);
        scanner.push(&stream);
        let units = collect(&mut scanner);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], payload);
    }

    #[test]
    fn adjacent_start_codes_emit_nothing() {
        let mut scanner = NalScanner::new(8 << 20, false);
        scanner.push(b"\x00\x00\x00\x01\x00\x00\x00\x01\x00\x00\x00\x01\x67\x01\x00\x00\x00\x01");
        let units = collect(&mut scanner);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], b"\x67\x01");
    }

    #[test]
    fn partial_unit_waits_for_boundary() {
        let mut scanner = NalScanner::new(8 << 20, false);
        scanner.push(b"\x00\x00\x00\x01\x65\xaa\xbb");
        assert!(scanner.pull().is_none());
        // The boundary itself may split across reads.
        scanner.push(b"\x00\x00");
        assert!(scanner.pull().is_none());
        scanner.push(b"\x00\x01");
        let unit = scanner.pull().unwrap();
        assert_eq!(&unit.payload()[..], b"\x65\xaa\xbb");
    }

    #[test]
    fn classification() {
        for (payload, want) in [
            (&b"\x67\x01"[..], UnitType::Sps),
            (b"\x68\x01", UnitType::Pps),
            (b"\x65\x01", UnitType::Idr),
            (b"\x41\x01", UnitType::NonIdr),
            (b"\x06\x01", UnitType::Unknown(6)),
        ] {
            assert_eq!(NalUnit::new(Bytes::copy_from_slice(payload)).unit_type(), want);
        }
    }

    #[test]
    fn ceiling_enforced_only_without_boundary() {
        let mut scanner = NalScanner::new(16, false);
        scanner.push(&[0xff; 17]);
        assert!(scanner.pull().is_none());
        let e = scanner.check_overflow().unwrap_err();
        assert_eq!(e.buffered, 17);
        assert_eq!(e.limit, 16);

        // The same number of bytes with boundaries inside drains fine.
        let mut scanner = NalScanner::new(16, false);
        let stream = annex_b_stream(&[b"\x65\x01", b"\x41\x02"]);
        scanner.push(&stream);
        while scanner.pull().is_some() {}
        scanner.check_overflow().unwrap();
    }

    #[test]
    fn emulation_prevention_stripping() {
        let stream = annex_b_stream(&[b"\x65\x00\x00\x03\x01\x00\x00\x03\x03"]);
        let mut scanner = NalScanner::new(8 << 20, true);
        scanner.push(&stream);
        let unit = scanner.pull().unwrap();
        assert_eq!(&unit.payload()[..], b"\x65\x00\x00\x01\x00\x00\x03");

        // Stripping disabled: payload passes through untouched.
        let mut scanner = NalScanner::new(8 << 20, false);
        scanner.push(&stream);
        let unit = scanner.pull().unwrap();
        assert_eq!(&unit.payload()[..], b"\x65\x00\x00\x03\x01\x00\x00\x03\x03");
    }
}
