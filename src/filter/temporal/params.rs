// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runtime parameter handling and per-frame strength resolution.

use crate::filter::temporal::noise::NoiseEstimator;
use crate::filter::temporal::noise::Recommendation;
use crate::filter::temporal::noise::StrengthModel;
use crate::filter::temporal::queue::FrameRecord;
use crate::filter::temporal::FilterError;
use crate::filter::temporal::FilterResult;
use crate::filter::FilterMode;
use crate::filter::RuntimeParams;
use crate::filter::MAX_BPP_X100K;

/// The closed set of supported adaptivity configurations.
///
/// Manual strength excludes adaptivity, and bitrate adaptivity requires
/// content adaptivity; every other flag combination is rejected at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configuration {
    /// Operator-supplied strength, applied as-is to every frame.
    ManualNonAdaptive,
    /// Strength estimated from per-frame noise statistics.
    AutoContentAdaptive,
    /// A fixed default strength without looking at the content.
    AutoNonContentAdaptive,
    /// Noise-estimated strength, scaled down by the encode bit budget.
    AutoContentBitrateAdaptive,
}

impl Configuration {
    pub fn from_flags(
        mode: FilterMode,
        content_adaptive: bool,
        bitrate_adaptive: bool,
    ) -> FilterResult<Configuration> {
        match (mode, content_adaptive, bitrate_adaptive) {
            (FilterMode::Manual, false, false) => Ok(Configuration::ManualNonAdaptive),
            (FilterMode::Manual, _, _) => Err(FilterError::InvalidConfig(
                "manual strength excludes adaptivity",
            )),
            (FilterMode::Auto, true, false) => Ok(Configuration::AutoContentAdaptive),
            (FilterMode::Auto, false, false) => Ok(Configuration::AutoNonContentAdaptive),
            (FilterMode::Auto, true, true) => Ok(Configuration::AutoContentBitrateAdaptive),
            (FilterMode::Auto, false, true) => Err(FilterError::InvalidConfig(
                "bitrate adaptivity requires content adaptivity",
            )),
        }
    }
}

/// Owns the active runtime parameters and resolves the strength of each frame
/// as it is ingested.
///
/// Updates are staged: they are validated immediately but only take effect at
/// the next ingest, so frames already queued keep the parameters they were
/// admitted under.
#[derive(Debug)]
pub struct RuntimeParamController {
    config: Configuration,
    current: RuntimeParams,
    pending: Option<RuntimeParams>,
    estimator: NoiseEstimator,
    /// Last strength resolved, the fallback when the analyzer fails.
    last_strength: u8,
}

impl RuntimeParamController {
    pub fn new(config: Configuration, params: RuntimeParams) -> FilterResult<Self> {
        params.validate()?;
        Ok(Self {
            config,
            current: params,
            pending: None,
            estimator: NoiseEstimator::new(StrengthModel::default()),
            last_strength: params.filter_strength,
        })
    }

    pub fn config(&self) -> Configuration {
        self.config
    }

    pub fn current(&self) -> &RuntimeParams {
        &self.current
    }

    /// Stages a parameter update for the next ingested frame.
    ///
    /// Invalid parameters are rejected without touching the active set. The
    /// temporal mode is fixed for the lifetime of the filter because the
    /// queue geometry depends on it.
    pub fn update(&mut self, params: RuntimeParams) -> FilterResult<()> {
        params.validate()?;
        if params.temporal_mode != self.current.temporal_mode {
            return Err(FilterError::InvalidConfig(
                "temporal mode cannot change mid-stream",
            ));
        }
        log::debug!("staging runtime parameter update: {:?}", params);
        self.pending = Some(params.check_and_fix());
        Ok(())
    }

    /// Stages a new encode bit-budget hint for the next ingested frame.
    ///
    /// Outside the bitrate-adaptive configuration the hint has nothing to
    /// act on and is ignored with a warning.
    pub fn update_bitrate_info(&mut self, bits_per_pixel_x100k: u32) -> FilterResult<()> {
        if self.config != Configuration::AutoContentBitrateAdaptive {
            log::warn!("bitrate hint ignored outside the bitrate-adaptive configuration");
            return Ok(());
        }
        if bits_per_pixel_x100k > MAX_BPP_X100K {
            return Err(FilterError::InvalidConfig("bitrate hint out of range"));
        }
        let mut params = self.pending.take().unwrap_or(self.current);
        params.bits_per_pixel_x100k = bits_per_pixel_x100k;
        self.pending = Some(params);
        Ok(())
    }

    /// The parameters to snapshot onto the frame being ingested, applying any
    /// staged update first.
    pub fn params_for_ingest(&mut self) -> RuntimeParams {
        if let Some(params) = self.pending.take() {
            self.current = params;
        }
        self.current
    }

    /// Resolves the strength of `record` from its snapshotted parameters and
    /// analyzer statistics. Each frame's strength is resolved exactly once.
    pub fn resolve_strength<H>(
        &mut self,
        record: &mut FrameRecord<H>,
    ) -> FilterResult<Recommendation> {
        if record.strength.is_some() {
            return Err(FilterError::AlreadyResolved);
        }
        let rec = self.estimator.recommend(
            self.config,
            record.applied.filter_strength,
            record.stats.as_ref(),
            record.applied.bits_per_pixel_x100k,
            self.last_strength,
        );
        log::debug!(
            "frame {}: resolved strength {} (filter: {})",
            record.frame_number,
            rec.strength,
            rec.should_filter
        );
        record.strength = Some(rec.strength);
        self.last_strength = rec.strength;
        Ok(rec)
    }
}
