// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Compute backend interface for the temporal filter.
//!
//! A backend is a provider of the pixel-level operations the controller
//! sequences: spatial/noise analysis, block motion search, motion
//! compensation, and weighted blending. A production backend dispatches these
//! to a GPU queue and returns promises that complete asynchronously; the
//! controller polls them and never blocks unless asked to.

#[cfg(test)]
pub(crate) mod dummy;

use thiserror::Error;

use crate::filter::SubPelPrecision;
use crate::Resolution;

/// Error returned by backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("spatial analysis failed")]
    Analysis(#[source] anyhow::Error),
    #[error("motion estimation failed")]
    Estimation(#[source] anyhow::Error),
    #[error("motion compensation failed")]
    Compensation(#[source] anyhow::Error),
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for representing pending backend output.
pub trait BackendPromise {
    type Output;

    /// Return the result of the processing. Blocks if processing is not
    /// finished yet.
    fn sync(self) -> BackendResult<Self::Output>;

    /// Returns true whenever the underlying processing is done.
    fn is_ready(&self) -> bool;
}

/// A promise over an already-computed value, for synchronous backends.
pub struct ReadyPromise<T>(T);

impl<T> From<T> for ReadyPromise<T> {
    fn from(value: T) -> Self {
        ReadyPromise(value)
    }
}

impl<T> BackendPromise for ReadyPromise<T> {
    type Output = T;

    fn sync(self) -> BackendResult<Self::Output> {
        Ok(self.0)
    }

    fn is_ready(&self) -> bool {
        true
    }
}

/// Motion vector of a single block, in the precision requested through
/// [`MeControl::sub_pel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// Motion field for one (source, reference) pair.
#[derive(Debug, Clone, Default)]
pub struct MotionVectors {
    /// One vector per search block, in raster order.
    pub blocks: Vec<MotionVector>,
    /// Sum of block SAD values over the frame, for temporal statistics.
    pub total_sad: u64,
}

/// Raw per-frame statistics produced by the spatial/scene analyzer.
///
/// The `noise_*` values are averaged over the flat blocks the analyzer judged
/// to carry noise rather than texture; the `frame_*` values are whole-frame
/// averages per pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    /// Average pixel variance of flat blocks.
    pub noise_var: f64,
    /// Average SAD per pixel of flat blocks.
    pub noise_sad: f64,
    /// Average spatial complexity of flat blocks.
    pub noise_sc: f64,
    /// Average SAD per pixel over the whole frame (temporal complexity).
    pub frame_sad: f64,
    /// Average spatial complexity over the whole frame.
    pub frame_sc: f64,
}

/// Analyzer output for one ingested frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Analysis {
    /// True if the frame starts a new scene; references must not cross it.
    pub scene_change: bool,
    pub stats: FrameStats,
}

pub const SEARCH_PATH_SIZE: usize = 56;

/// Search path walked by the motion estimator, encoded as packed steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchPath {
    pub steps: [u8; SEARCH_PATH_SIZE],
    pub len: u8,
    pub max_num_su: u8,
}

impl Default for SearchPath {
    /// Diamond search pattern.
    fn default() -> Self {
        Self {
            steps: [
                0x0F, 0xF1, 0x0F, 0x12, //5
                0x0D, 0xE2, 0x22, 0x1E, //9
                0x10, 0xFF, 0xE2, 0x20, //13
                0xFC, 0x06, 0xDD, //16
                0x2E, 0xF1, 0x3F, 0xD3, 0x11, 0x3D, 0xF3, 0x1F, //24
                0xEB, 0xF1, 0xF1, 0xF1, //28
                0x4E, 0x11, 0x12, 0xF2, 0xF1, //33
                0xE0, 0xFF, 0xFF, 0x0D, 0x1F, 0x1F, //39
                0x20, 0x11, 0xCF, 0xF1, 0x05, 0x11, //45
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //51
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
            len: 16,
            max_num_su: 57,
        }
    }
}

/// Picture size below which the estimator searches 8x8 instead of 16x16
/// blocks.
const MIN_HEIGHT_FOR_16X16: u32 = 120;

/// Base added to the filter strength to derive the chroma threshold.
const CHROMA_BASE: u16 = 80;
const MAX_CHROMA: u16 = 100;

/// Control block handed to the motion estimator and blender with every
/// request: frame geometry, search parameters and the thresholds derived from
/// the resolved filter strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeControl {
    pub search_path: SearchPath,
    pub width: u16,
    pub height: u16,
    /// Luma blending threshold, derived from the filter strength.
    pub th: u16,
    /// Chroma blending threshold, derived from the filter strength.
    pub s_th: u16,
    pub sub_pel: SubPelPrecision,
    /// Search block size in pixels: 16, or 8 for small pictures.
    pub block_size: u8,
}

impl MeControl {
    pub fn new(resolution: Resolution, strength: u8, sub_pel: SubPelPrecision) -> Self {
        let block_size = if resolution.height <= MIN_HEIGHT_FOR_16X16 {
            8
        } else {
            16
        };
        let mut ctrl = Self {
            search_path: Default::default(),
            width: resolution.width as u16,
            height: resolution.height as u16,
            th: 0,
            s_th: 0,
            sub_pel,
            block_size,
        };
        ctrl.set_strength(strength);
        ctrl
    }

    /// Rescales the blending thresholds for a new filter strength.
    pub fn set_strength(&mut self, strength: u8) {
        let th = u16::from(strength) * 50;
        // Smaller blocks accumulate a quarter of the SAD of a 16x16 block.
        self.th = if self.block_size < 16 { th / 4 } else { th };
        self.s_th = std::cmp::min(u16::from(strength) + CHROMA_BASE, MAX_CHROMA);
    }
}

/// A motion-compensated prediction of the source frame, with the weight it
/// carries in the final blend.
///
/// Weights are expressed in units of [`BLEND_WEIGHT_SCALE`]; the backend gives
/// the original source frame whatever weight the predictions leave unused.
#[derive(Debug, Clone)]
pub struct Prediction<H> {
    pub handle: H,
    pub weight: u16,
}

/// Denominator of all blend weights.
pub const BLEND_WEIGHT_SCALE: u16 = 64;

/// Interface to the compute engine backing the temporal filter.
///
/// `estimate`, `compensate` and `blend` are dispatch-and-poll: they enqueue
/// work and return a [`BackendPromise`]. `analyze` is synchronous because its
/// result gates queue readiness and must be available at ingest time.
///
/// Surfaces passed to any of these calls are checked out through [`lock`]
/// first and checked in with [`unlock`] when the controller is done with
/// them; a surface may be locked by several concurrent read-only consumers.
///
/// [`lock`]: FilterBackend::lock
/// [`unlock`]: FilterBackend::unlock
pub trait FilterBackend {
    /// Opaque handle to a frame surface owned by the host video pipeline.
    type Handle: Clone;

    type EstimatePromise: BackendPromise<Output = MotionVectors>;
    type CompensatePromise: BackendPromise<Output = Self::Handle>;
    type BlendPromise: BackendPromise<Output = Self::Handle>;

    /// Computes scene-change and noise statistics for `frame`, optionally
    /// against its predecessor.
    fn analyze(
        &mut self,
        frame: &Self::Handle,
        prev: Option<&Self::Handle>,
    ) -> BackendResult<Analysis>;

    /// Starts a block motion search of `src` inside `reference`.
    fn estimate(
        &mut self,
        src: &Self::Handle,
        reference: &Self::Handle,
        ctrl: &MeControl,
    ) -> BackendResult<Self::EstimatePromise>;

    /// Starts producing the prediction of the source frame that `vectors`
    /// describe over `reference`.
    fn compensate(
        &mut self,
        reference: &Self::Handle,
        vectors: &MotionVectors,
    ) -> BackendResult<Self::CompensatePromise>;

    /// Starts blending `predictions` into `src`. With no predictions this
    /// degenerates to a purely spatial denoise of `src`.
    fn blend(
        &mut self,
        src: &Self::Handle,
        predictions: &[Prediction<Self::Handle>],
        ctrl: &MeControl,
    ) -> BackendResult<Self::BlendPromise>;

    /// Checks a surface out for the duration of a compute call.
    fn lock(&mut self, frame: &Self::Handle) -> BackendResult<()>;

    /// Checks a surface back in.
    fn unlock(&mut self, frame: &Self::Handle);
}
