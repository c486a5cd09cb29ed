// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Noise-driven and bitrate-driven filter strength estimation.
//!
//! The strength model turns the analyzer's raw statistics into a blend
//! strength in `[0, 20]`. The exact curve is a tunable parameter of the
//! filter; the defaults below are fitted for AVC/HEVC encodes following the
//! denoiser. Whatever the curve, the contract holds: the result is bounded,
//! clean content resolves to zero, and a shrinking bitrate budget never
//! raises the strength.

use crate::backend::FrameStats;
use crate::filter::temporal::params::Configuration;
use crate::filter::BITRATE_MULTIPLIER;
use crate::filter::DEFAULT_FILTER_STRENGTH;
use crate::filter::MAX_FILTER_STRENGTH;

/// Lower limits of the spatial complexity ranges used for classification.
const SPATIAL_CLASS_LIMITS: [f64; 10] = [
    16.0, 81.0, 225.0, 529.0, 1024.0, 1764.0, 2809.0, 4225.0, 6084.0, f64::MAX,
];

/// QP to bitrate class. Higher classes mean less bit budget per pixel and a
/// stronger strength reduction.
#[rustfmt::skip]
const QP_CLASS: [usize; 54] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    1, 1, 1, 1, 1,
    2, 2, 2, 2, 2,
    3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3,
];

/// Strength adjustment per bitrate class, never positive so the scaled value
/// cannot exceed the content-derived estimate.
const CLASS_ADJUSTMENT: [i16; 4] = [0, -1, -2, -3];

/// Lower limits of the squared temporal-to-spatial complexity ratio used for
/// spatio-temporal classification.
const SPATIO_TEMPORAL_LIMITS: [f64; 6] = [0.03, 0.09, 0.20, 0.36, 1.44, 3.24];

/// Tunable coefficients of the strength estimation.
#[derive(Debug, Clone)]
pub struct StrengthModel {
    /// Cubic polynomial over `noise_sad / sqrt(noise_sc)`, highest degree
    /// first.
    pub noise_curve: [f64; 4],
    /// Exponent of the bits-per-pixel term of the QP prediction.
    pub bitrate_exponent: f64,
}

impl Default for StrengthModel {
    fn default() -> Self {
        Self {
            noise_curve: [247.99601, -195.205078, 46.510905, -0.736656],
            bitrate_exponent: -0.75,
        }
    }
}

impl StrengthModel {
    /// Maps the measured noise level to a strength in `[0, 20]`.
    ///
    /// Content whose flat blocks show no spatial complexity is judged clean
    /// and resolves to zero.
    pub fn strength_from_noise(&self, stats: &FrameStats) -> u8 {
        if stats.noise_sc.abs() <= 10.0 * f64::EPSILON {
            return 0;
        }
        let stc = stats.noise_sad / stats.noise_sc.sqrt();
        let [c3, c2, c1, c0] = self.noise_curve;
        let s = c3 * stc.powi(3) + c2 * stc.powi(2) + c1 * stc + c0;
        let s = s.clamp(0.0, f64::from(MAX_FILTER_STRENGTH));
        (s + 0.5) as u8
    }

    /// Classifies the whole-frame spatial complexity into ten ranges.
    fn spatial_class(frame_sc: f64) -> usize {
        SPATIAL_CLASS_LIMITS
            .iter()
            .position(|&limit| frame_sc < limit)
            .unwrap_or(SPATIAL_CLASS_LIMITS.len() - 1)
    }

    /// Classifies how much of the frame's activity is motion rather than
    /// detail, from very low (0) to very high (6).
    pub fn spatio_temporal_class(stats: &FrameStats) -> usize {
        let sad2 = stats.frame_sad * stats.frame_sad;
        SPATIO_TEMPORAL_LIMITS
            .iter()
            .position(|&limit| sad2 < limit * stats.frame_sc)
            .unwrap_or(SPATIO_TEMPORAL_LIMITS.len())
    }

    /// Predicts the bitrate class the encoder will operate in at `bpp` bits
    /// per pixel for content with these statistics.
    ///
    /// For fixed statistics this is non-decreasing as `bpp` decreases.
    fn bitrate_class(&self, stats: &FrameStats, bpp: f64) -> usize {
        let sc = Self::spatial_class(stats.frame_sc);
        if sc == 0 || stats.frame_sad <= 0.0 || bpp <= 0.0 {
            return 0;
        }
        let d0 = (stats.frame_sad.log10() * (sc as f64).log10())
            .max(0.0)
            .powf(2.03);
        let a = 0.567701 * d0 + 1.092071;
        let y = a * bpp.powf(self.bitrate_exponent);
        let qs = 1.0 + y.log2();
        let qp = ((6.0 * qs) as i64 + 4).clamp(0, QP_CLASS.len() as i64 - 1);
        QP_CLASS[qp as usize]
    }

    /// Scales a content-derived strength down according to the encode bit
    /// budget. The result never exceeds `base`.
    pub fn bitrate_adjusted(&self, base: u8, stats: &FrameStats, bpp: f64) -> u8 {
        if base == 0 {
            return 0;
        }
        let mut adjustment = CLASS_ADJUSTMENT[self.bitrate_class(stats, bpp)];
        // Motion-heavy content compensates poorly; back off one more step.
        if Self::spatio_temporal_class(stats) > 0 {
            adjustment -= 1;
        }
        // Strong filtering leaves no headroom once the encoder re-quantizes.
        let limit = if base > 14 {
            13
        } else {
            i16::from(MAX_FILTER_STRENGTH)
        };
        (i16::from(base) + adjustment).clamp(0, limit) as u8
    }
}

/// Outcome of strength resolution for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recommendation {
    pub strength: u8,
    /// False when the frame should bypass filtering entirely.
    pub should_filter: bool,
}

/// Resolves per-frame filter strength from configuration and statistics.
#[derive(Debug, Default)]
pub struct NoiseEstimator {
    model: StrengthModel,
}

impl NoiseEstimator {
    pub fn new(model: StrengthModel) -> Self {
        Self { model }
    }

    /// Recommends a strength for one frame.
    ///
    /// `stats` is `None` when the analyzer failed for this frame; in auto
    /// configurations the estimation then falls back to `previous`, the last
    /// strength that was resolved, so a failing analyzer never stalls the
    /// pipeline.
    pub fn recommend(
        &self,
        config: Configuration,
        manual_strength: u8,
        stats: Option<&FrameStats>,
        bpp_x100k: u32,
        previous: u8,
    ) -> Recommendation {
        let strength = match config {
            Configuration::ManualNonAdaptive => manual_strength,
            Configuration::AutoNonContentAdaptive => DEFAULT_FILTER_STRENGTH,
            Configuration::AutoContentAdaptive => match stats {
                Some(stats) => self.model.strength_from_noise(stats),
                None => previous,
            },
            Configuration::AutoContentBitrateAdaptive => match stats {
                Some(stats) => {
                    let base = self.model.strength_from_noise(stats);
                    if bpp_x100k > 0 {
                        let bpp = f64::from(bpp_x100k) / f64::from(BITRATE_MULTIPLIER);
                        self.model.bitrate_adjusted(base, stats, bpp)
                    } else {
                        base
                    }
                }
                None => previous,
            },
        };

        debug_assert!(strength <= MAX_FILTER_STRENGTH);
        Recommendation {
            strength,
            should_filter: strength > 0,
        }
    }
}
