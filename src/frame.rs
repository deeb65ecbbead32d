// Copyright (C) 2024 the nalstream authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stateful frame assembly: turning classified NAL units into decoder-ready
//! sample buffers.

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::nal::{NalUnit, UnitType, START_CODE};

/// How a non-key sample buffer is assembled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NonKeyFramePolicy {
    /// Each sample is self-contained: current parameter sets plus this
    /// unit's payload. Bounded cost; what a conformant decoder expects.
    #[default]
    Stateless,

    /// Legacy behavior: the current reference data (the last key frame plus
    /// every non-key payload since) is prepended to each sample and the
    /// concatenation becomes the new reference. Samples grow without bound
    /// over a long GOP; only useful with decoders that expect it.
    Cumulative,
}

/// Parameters describing the video stream, extracted from the SPS and PPS.
///
/// Informational only; frame assembly works even when the SPS doesn't parse.
#[derive(Clone)]
pub struct VideoParameters {
    pixel_dimensions: (u32, u32),
    rfc6381_codec: String,
    sps_nal: Bytes,
    pps_nal: Bytes,
}

impl VideoParameters {
    fn parse(sps_nal: &Bytes, pps_nal: &Bytes) -> Result<Self, String> {
        let sps_rbsp = h264_reader::rbsp::decode_nal(&sps_nal[1..]);
        if sps_rbsp.len() < 4 {
            return Err("SPS too short".to_owned());
        }
        let rfc6381_codec = format!(
            "avc1.{:02X}{:02X}{:02X}",
            sps_rbsp[0], sps_rbsp[1], sps_rbsp[2]
        );
        let sps = h264_reader::nal::sps::SeqParameterSet::from_bytes(&sps_rbsp)
            .map_err(|e| format!("bad SPS: {e:?}"))?;
        let pixel_dimensions = sps
            .pixel_dimensions()
            .map_err(|e| format!("SPS has invalid pixel dimensions: {e:?}"))?;
        Ok(Self {
            pixel_dimensions,
            rfc6381_codec,
            sps_nal: sps_nal.clone(),
            pps_nal: pps_nal.clone(),
        })
    }

    /// Overall dimensions of the video frame in pixels, as `(width, height)`.
    pub fn pixel_dimensions(&self) -> (u32, u32) {
        self.pixel_dimensions
    }

    /// A codec description in [RFC 6381](https://tools.ietf.org/html/rfc6381)
    /// form, eg `avc1.4D401E`.
    pub fn rfc6381_codec(&self) -> &str {
        &self.rfc6381_codec
    }

    /// The raw SPS NAL, start code excluded.
    pub fn sps_nal(&self) -> &Bytes {
        &self.sps_nal
    }

    /// The raw PPS NAL, start code excluded.
    pub fn pps_nal(&self) -> &Bytes {
        &self.pps_nal
    }
}

impl std::fmt::Debug for VideoParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoParameters")
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("pixel_dimensions", &self.pixel_dimensions)
            .finish()
    }
}

/// A decoder-ready sample: `startcode sps startcode pps` followed by the
/// frame payload, laid out exactly as an Annex-B-compatible decoder expects.
pub struct SampleBuffer {
    data: Bytes,
    sequence_number: u64,
    is_random_access_point: bool,
    new_parameters: Option<VideoParameters>,
}

impl SampleBuffer {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// The per-session read counter at the time this sample's final unit was
    /// received. Monotonically non-decreasing; used by callers for
    /// diagnostics and FPS computation.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// True iff the sample was assembled from an IDR unit and can be decoded
    /// with no prior reference.
    pub fn is_random_access_point(&self) -> bool {
        self.is_random_access_point
    }

    /// Parameters parsed from the SPS/PPS pair in effect, present on the
    /// first sample after they change.
    pub fn new_parameters(&self) -> Option<&VideoParameters> {
        self.new_parameters.as_ref()
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("sequence_number", &self.sequence_number)
            .field("is_random_access_point", &self.is_random_access_point)
            .field("new_parameters", &self.new_parameters)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Stateful assembler for one stream session.
///
/// Tracks the most recent SPS/PPS pair and the current reference data, and
/// converts each incoming unit into either nothing (parameter set consumed,
/// or frame dropped while parameter sets are pending) or a complete
/// [`SampleBuffer`].
#[derive(Debug)]
pub struct FrameBuilder {
    policy: NonKeyFramePolicy,

    sps: Option<Bytes>,
    pps: Option<Bytes>,

    /// `startcode sps startcode pps`; recomputed whenever both parameter
    /// sets are present and one of them changed.
    description: Option<Bytes>,

    /// Reference data for `Cumulative` assembly: the last key frame payload
    /// plus every non-key payload appended since.
    key_frame: Option<Bytes>,

    /// Parsed from the current SPS/PPS, handed out on the next sample.
    pending_parameters: Option<VideoParameters>,

    /// Limits the missing-parameter-sets log line to one per gap.
    warned_missing_params: bool,
}

impl FrameBuilder {
    pub fn new(policy: NonKeyFramePolicy) -> Self {
        Self {
            policy,
            sps: None,
            pps: None,
            description: None,
            key_frame: None,
            pending_parameters: None,
            warned_missing_params: false,
        }
    }

    /// Consumes one unit. Parameter sets update builder state and yield
    /// nothing; VCL units yield a sample buffer once SPS and PPS have both
    /// been seen.
    pub fn build(&mut self, unit: NalUnit, sequence_number: u64) -> Option<SampleBuffer> {
        match unit.unit_type() {
            UnitType::Sps => {
                let payload = unit.into_payload();
                if self.sps.as_ref() != Some(&payload) {
                    self.sps = Some(payload);
                    self.update_description();
                }
                None
            }
            UnitType::Pps => {
                let payload = unit.into_payload();
                if self.pps.as_ref() != Some(&payload) {
                    self.pps = Some(payload);
                    self.update_description();
                }
                None
            }
            UnitType::Idr => {
                let payload = unit.into_payload();
                self.key_frame = Some(payload.clone());
                self.assemble(payload, true, sequence_number)
            }
            UnitType::NonIdr => self.assemble(unit.into_payload(), false, sequence_number),
            UnitType::Unknown(t) => {
                // The session filters these already; ignore if one slips in.
                debug!("ignoring NAL unit of unhandled type {t}");
                None
            }
        }
    }

    fn update_description(&mut self) {
        let (Some(sps), Some(pps)) = (self.sps.as_ref(), self.pps.as_ref()) else {
            return;
        };
        let mut d = BytesMut::with_capacity(2 * START_CODE.len() + sps.len() + pps.len());
        d.extend_from_slice(&START_CODE);
        d.extend_from_slice(sps);
        d.extend_from_slice(&START_CODE);
        d.extend_from_slice(pps);
        self.description = Some(d.freeze());
        self.warned_missing_params = false;
        match VideoParameters::parse(sps, pps) {
            Ok(p) => {
                debug!("stream parameters: {p:?}");
                self.pending_parameters = Some(p);
            }
            // Dimension extraction is informational; a stream whose SPS we
            // can't parse still gets assembled.
            Err(e) => debug!("unparseable SPS: {e}"),
        }
    }

    fn assemble(
        &mut self,
        payload: Bytes,
        is_key: bool,
        sequence_number: u64,
    ) -> Option<SampleBuffer> {
        let Some(description) = self.description.clone() else {
            if !self.warned_missing_params {
                debug!("dropping frame data received before both SPS and PPS");
                self.warned_missing_params = true;
            }
            return None;
        };
        if !is_key && self.key_frame.is_none() {
            // A non-key unit with no reference yet can't be decoded.
            return None;
        }
        let mut data = BytesMut::with_capacity(description.len() + payload.len());
        data.extend_from_slice(&description);
        match (is_key, self.policy) {
            (false, NonKeyFramePolicy::Cumulative) => {
                let key_frame = self.key_frame.as_ref().expect("reference checked above");
                let mut combined = BytesMut::with_capacity(key_frame.len() + payload.len());
                combined.extend_from_slice(key_frame);
                combined.extend_from_slice(&payload);
                let combined = combined.freeze();
                data.extend_from_slice(&combined);
                self.key_frame = Some(combined);
            }
            _ => data.extend_from_slice(&payload),
        }
        Some(SampleBuffer {
            data: data.freeze(),
            sequence_number,
            is_random_access_point: is_key,
            new_parameters: self.pending_parameters.take(),
        })
    }
}
