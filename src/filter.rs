// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Value types shared by the filter control surface.

pub mod temporal;

use enumn::N;

/// Maximum value of the filter strength scalar.
pub const MAX_FILTER_STRENGTH: u8 = 20;

/// Strength applied by default while auto mode gathers its first statistics.
pub const DEFAULT_FILTER_STRENGTH: u8 = 8;

/// A configured strength of zero selects automatic strength estimation.
pub const AUTO_FILTER_STRENGTH: u8 = 0;

/// Multiplier translating a float bits-per-pixel figure into the fixed-point
/// `bits_per_pixel_x100k` hint.
pub const BITRATE_MULTIPLIER: u32 = 100_000;

/// Upper bound accepted for the bitrate hint (12 bpp at 8-bit depth).
pub const MAX_BPP_X100K: u32 = 12 * BITRATE_MULTIPLIER;

/// How many neighboring frames the filter blends into each output frame.
///
/// The mode determines the reference topology and, with it, the depth of the
/// internal frame queue and the streaming delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, N)]
#[repr(u16)]
pub enum TemporalMode {
    Unknown = 0,
    /// No temporal references; spatial denoising only.
    Spatial = 1,
    /// One backward reference.
    Ref1 = 2,
    /// One backward and one forward reference.
    #[default]
    Ref2 = 3,
    /// Three distinct neighbors combined into four weighted references.
    Ref4 = 4,
}

/// Whether the post-blend deblocking pass runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, N)]
#[repr(u16)]
pub enum Deblocking {
    #[default]
    Off = 0,
    On = 1,
}

/// Sub-pixel precision of the motion search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, N)]
#[repr(u16)]
pub enum SubPelPrecision {
    #[default]
    Integer = 0,
    Quarter = 1,
}

/// Whether the filter strength is operator-supplied or estimated from the
/// content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// The configured strength is used as-is.
    Manual,
    /// Strength is derived from per-frame noise statistics.
    Auto,
}

/// Per-frame control knobs of the temporal filter.
///
/// A snapshot of these is attached to every frame at ingest time and governs
/// that frame's filtering; updates submitted mid-stream take effect at the
/// next ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeParams {
    /// Overlapped block motion estimation.
    pub overlap: bool,
    pub deblocking: Deblocking,
    pub temporal_mode: TemporalMode,
    pub sub_pel: SubPelPrecision,
    /// Blend strength in `[0, 20]`. Zero selects automatic estimation.
    pub filter_strength: u8,
    /// Encode budget hint in bits per pixel, times [`BITRATE_MULTIPLIER`].
    /// Zero means no hint.
    pub bits_per_pixel_x100k: u32,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            overlap: false,
            deblocking: Deblocking::Off,
            temporal_mode: TemporalMode::Ref2,
            sub_pel: SubPelPrecision::Integer,
            filter_strength: DEFAULT_FILTER_STRENGTH,
            bits_per_pixel_x100k: 0,
        }
    }
}

impl RuntimeParams {
    /// Checks the parameters without repairing them.
    pub fn validate(&self) -> Result<(), temporal::FilterError> {
        if self.temporal_mode == TemporalMode::Unknown {
            return Err(temporal::FilterError::InvalidConfig(
                "temporal mode must be known",
            ));
        }
        if self.filter_strength > MAX_FILTER_STRENGTH {
            return Err(temporal::FilterError::InvalidConfig(
                "filter strength out of range",
            ));
        }
        if self.bits_per_pixel_x100k > MAX_BPP_X100K {
            return Err(temporal::FilterError::InvalidConfig(
                "bitrate hint out of range",
            ));
        }
        Ok(())
    }

    /// Returns a repaired copy with out-of-range values clamped and
    /// nonsensical combinations fixed up.
    pub fn check_and_fix(mut self) -> Self {
        if self.temporal_mode == TemporalMode::Unknown {
            self.temporal_mode = TemporalMode::default();
        }
        self.filter_strength = self.filter_strength.min(MAX_FILTER_STRENGTH);
        self.bits_per_pixel_x100k = self.bits_per_pixel_x100k.min(MAX_BPP_X100K);
        // Spatial mode has no motion path for these to apply to.
        if self.temporal_mode == TemporalMode::Spatial {
            self.overlap = false;
            self.deblocking = Deblocking::Off;
            self.sub_pel = SubPelPrecision::Integer;
        }
        self
    }
}

/// Caller-supplied metadata of an ingested frame.
///
/// It is carried through the filter untouched and copied verbatim onto the
/// corresponding output frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub timestamp: u64,
    /// Anchor frames must not be blended against temporal neighbors.
    pub is_intra: bool,
}

/// One filtered frame, emitted in ingest order.
#[derive(Debug, Clone)]
pub struct FilteredFrame<H> {
    /// Surface holding the blended result, or the unmodified input when the
    /// frame was not filtered.
    pub handle: H,
    /// Position of the frame in the input sequence, starting at zero.
    pub frame_number: u32,
    /// Metadata of the original input frame.
    pub meta: FrameMeta,
    /// The strength that was resolved for this frame.
    pub strength: u8,
    /// False if the frame bypassed filtering entirely.
    pub filtered: bool,
}
