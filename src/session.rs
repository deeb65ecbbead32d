// Copyright (C) 2024 the nalstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection session driver: byte source → scanner → builder → sink.

use bytes::BytesMut;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::frame::{FrameBuilder, NonKeyFramePolicy, SampleBuffer};
use crate::nal::{NalScanner, UnitType};
use crate::{ConnectionContext, Error, ErrorInt};

/// Capacity hint for each read from the byte source.
const READ_CHUNK: usize = 65_536;

/// Configuration for one [`StreamSession`].
///
/// Read-only after session construction; typically built once at startup and
/// cloned per accepted connection.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Ceiling on bytes buffered while waiting for a start code. A session
    /// whose buffer exceeds this with no boundary found is torn down.
    pub max_buffered_bytes: usize,

    /// Remove `00 00 03` emulation-prevention sequences from each unit's
    /// payload before classification. Off by default; enable when the target
    /// decoder requires strict conformance.
    pub strip_emulation_prevention: bool,

    /// How non-key sample buffers are assembled.
    pub non_key_frame_policy: NonKeyFramePolicy,

    /// Drop samples instead of waiting when the sink channel is full. Off by
    /// default: silent frame loss is not an acceptable default, so a slow
    /// sink normally applies backpressure to the read loop.
    pub drop_on_backpressure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 8 << 20,
            strip_emulation_prevention: false,
            non_key_frame_policy: NonKeyFramePolicy::default(),
            drop_on_backpressure: false,
        }
    }
}

/// Drives one connection's stream through the parsing pipeline.
///
/// One instance per accepted connection; sessions share nothing, so closing
/// one never affects its siblings. Completed sample buffers are forwarded to
/// the supplied channel in strict arrival order. Dropping the [`run`]
/// future cancels the session and discards any partially accumulated unit.
///
/// [`run`]: StreamSession::run
pub struct StreamSession<R> {
    reader: R,
    ctx: ConnectionContext,
    scanner: NalScanner,
    builder: FrameBuilder,
    tx: mpsc::Sender<SampleBuffer>,
    drop_on_backpressure: bool,

    /// Total bytes consumed from the reader.
    pos: u64,

    /// Number of reads so far; stamped onto forwarded samples.
    sequence_number: u64,
}

impl StreamSession<TcpStream> {
    /// Wraps an accepted TCP connection, deriving the connection context
    /// from its socket addresses.
    pub fn from_tcp(
        stream: TcpStream,
        config: &SessionConfig,
        tx: mpsc::Sender<SampleBuffer>,
    ) -> Result<Self, Error> {
        let local_addr = stream.local_addr().map_err(|e| wrap!(ErrorInt::Setup(e)))?;
        let peer_addr = stream.peer_addr().map_err(|e| wrap!(ErrorInt::Setup(e)))?;
        Self::new(
            stream,
            ConnectionContext::new(local_addr, peer_addr),
            config,
            tx,
        )
    }
}

impl<R: AsyncRead + Unpin> StreamSession<R> {
    pub fn new(
        reader: R,
        ctx: ConnectionContext,
        config: &SessionConfig,
        tx: mpsc::Sender<SampleBuffer>,
    ) -> Result<Self, Error> {
        if config.max_buffered_bytes < crate::nal::START_CODE.len() {
            bail!(ErrorInt::InvalidArgument(format!(
                "max_buffered_bytes={} is below the start code length",
                config.max_buffered_bytes
            )));
        }
        Ok(Self {
            reader,
            ctx,
            scanner: NalScanner::new(config.max_buffered_bytes, config.strip_emulation_prevention),
            builder: FrameBuilder::new(config.non_key_frame_policy),
            tx,
            drop_on_backpressure: config.drop_on_backpressure,
            pos: 0,
            sequence_number: 0,
        })
    }

    pub fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    /// Runs the session to completion: reads until the source reports end of
    /// stream (`Ok(())`) or the session fails.
    ///
    /// Failures are terminal; one diagnostic is logged and nothing further
    /// is forwarded to the sink.
    pub async fn run(mut self) -> Result<(), Error> {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        loop {
            chunk.clear();
            let n = match self.reader.read_buf(&mut chunk).await {
                Ok(n) => n,
                Err(source) => {
                    let e = wrap!(ErrorInt::ReadError {
                        conn_ctx: self.ctx,
                        pos: self.pos,
                        source,
                    });
                    warn!("session aborted: {e}");
                    return Err(e);
                }
            };
            if n == 0 {
                debug!("[{}] end of stream after {} bytes", self.ctx, self.pos);
                return Ok(());
            }
            self.pos += n as u64;
            self.sequence_number += 1;
            if let Err(e) = self.process(&chunk[..]).await {
                warn!("session aborted: {e}");
                return Err(e);
            }
        }
    }

    /// Feeds one received chunk through scan → classify → build → forward.
    async fn process(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.scanner.push(chunk);
        while let Some(unit) = self.scanner.pull() {
            debug!(
                "[{}] unit: type {:?}, length {}",
                self.ctx,
                unit.unit_type(),
                unit.byte_len()
            );
            if matches!(unit.unit_type(), UnitType::Unknown(_)) {
                continue;
            }
            if let Some(sample) = self.builder.build(unit, self.sequence_number) {
                self.forward(sample).await?;
            }
        }
        if let Err(overflow) = self.scanner.check_overflow() {
            bail!(ErrorInt::StreamTooLarge {
                conn_ctx: self.ctx,
                buffered: overflow.buffered,
                limit: overflow.limit,
                head: overflow.head,
            });
        }
        Ok(())
    }

    async fn forward(&mut self, sample: SampleBuffer) -> Result<(), Error> {
        if self.drop_on_backpressure {
            return match self.tx.try_send(sample) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(s)) => {
                    debug!(
                        "[{}] sink full; dropping sample {}",
                        self.ctx,
                        s.sequence_number()
                    );
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(wrap!(ErrorInt::SinkClosed {
                    conn_ctx: self.ctx,
                    pos: self.pos,
                })),
            };
        }
        self.tx.send(sample).await.map_err(|_| {
            wrap!(ErrorInt::SinkClosed {
                conn_ctx: self.ctx,
                pos: self.pos,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    // SPS `67 aa bb`, PPS `68 cc dd`, IDR `65 ee ff`, non-IDR `41 11 22`,
    // with a trailing start code closing the final unit.
    const STREAM: &[u8] = b"\x00\x00\x00\x01\x67\xaa\xbb\
                            \x00\x00\x00\x01\x68\xcc\xdd\
                            \x00\x00\x00\x01\x65\xee\xff\
                            \x00\x00\x00\x01\x41\x11\x22\
                            \x00\x00\x00\x01";

    const IDR_SAMPLE: &[u8] =
        b"\x00\x00\x00\x01\x67\xaa\xbb\x00\x00\x00\x01\x68\xcc\xdd\x65\xee\xff";

    fn session_over_duplex(
        config: &SessionConfig,
        channel_capacity: usize,
    ) -> (
        tokio::io::DuplexStream,
        StreamSession<tokio::io::DuplexStream>,
        mpsc::Receiver<SampleBuffer>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(channel_capacity);
        let session = StreamSession::new(server, ConnectionContext::dummy(), config, tx).unwrap();
        (client, session, rx)
    }

    #[tokio::test]
    async fn forwards_samples_in_order_until_eof() {
        let (mut client, session, mut rx) = session_over_duplex(&SessionConfig::default(), 8);
        let handle = tokio::spawn(session.run());
        client.write_all(STREAM).await.unwrap();
        drop(client);
        handle.await.unwrap().unwrap();

        let idr = rx.recv().await.unwrap();
        assert_eq!(&idr.data()[..], IDR_SAMPLE);
        assert!(idr.is_random_access_point());
        assert!(idr.sequence_number() >= 1);

        let non_idr = rx.recv().await.unwrap();
        assert!(!non_idr.is_random_access_point());
        assert!(non_idr.data().ends_with(b"\x41\x11\x22"));
        assert!(non_idr.sequence_number() >= idr.sequence_number());

        // Sender dropped with the finished session.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn byte_at_a_time_delivery_yields_identical_samples() {
        let (mut client, session, mut rx) = session_over_duplex(&SessionConfig::default(), 8);
        let handle = tokio::spawn(session.run());
        for &b in STREAM {
            client.write_all(&[b]).await.unwrap();
            client.flush().await.unwrap();
        }
        drop(client);
        handle.await.unwrap().unwrap();

        let idr = rx.recv().await.unwrap();
        assert_eq!(&idr.data()[..], IDR_SAMPLE);
        assert!(rx.recv().await.unwrap().data().ends_with(b"\x41\x11\x22"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn oversized_streak_without_boundary_aborts() {
        let config = SessionConfig {
            max_buffered_bytes: 32,
            ..SessionConfig::default()
        };
        let (mut client, session, mut rx) = session_over_duplex(&config, 8);
        let handle = tokio::spawn(session.run());
        client.write_all(&[0xff; 64]).await.unwrap();
        client.flush().await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            *err.0,
            ErrorInt::StreamTooLarge { limit: 32, .. }
        ));
        // Nothing was ever emitted.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_sink_fails_session() {
        let (mut client, session, rx) = session_over_duplex(&SessionConfig::default(), 1);
        drop(rx);
        let handle = tokio::spawn(session.run());
        client.write_all(STREAM).await.unwrap();
        client.flush().await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(*err.0, ErrorInt::SinkClosed { .. }));
    }

    #[tokio::test]
    async fn drop_on_backpressure_discards_instead_of_blocking() {
        let config = SessionConfig {
            drop_on_backpressure: true,
            ..SessionConfig::default()
        };
        // Channel holds a single sample; the second one is dropped because
        // nothing consumes the receiver while the session runs.
        let (mut client, session, mut rx) = session_over_duplex(&config, 1);
        let handle = tokio::spawn(session.run());
        client.write_all(STREAM).await.unwrap();
        drop(client);
        handle.await.unwrap().unwrap();

        let idr = rx.recv().await.unwrap();
        assert_eq!(&idr.data()[..], IDR_SAMPLE);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn rejects_unusable_ceiling() {
        let (_client, server) = tokio::io::duplex(16);
        let (tx, _rx) = mpsc::channel(1);
        let config = SessionConfig {
            max_buffered_bytes: 2,
            ..SessionConfig::default()
        };
        let err = StreamSession::new(server, ConnectionContext::dummy(), &config, tx)
            .err()
            .unwrap();
        assert!(matches!(*err.0, ErrorInt::InvalidArgument(_)));
    }
}
