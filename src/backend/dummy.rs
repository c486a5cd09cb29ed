// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module implements a fake backend so the filter controller can be
//! tested without any compute device. Surfaces are plain `u32` handles; the
//! tests use the frame number as the handle of the ingested frame.

use std::cell::Cell;
use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::anyhow;

use crate::backend::Analysis;
use crate::backend::BackendError;
use crate::backend::BackendPromise;
use crate::backend::BackendResult;
use crate::backend::FilterBackend;
use crate::backend::FrameStats;
use crate::backend::MeControl;
use crate::backend::MotionVector;
use crate::backend::MotionVectors;
use crate::backend::Prediction;

/// Offset added to a reference handle to form its compensated prediction.
pub const PREDICTION_BASE: u32 = 10_000;
/// Base of the handles returned for blended output surfaces.
pub const OUTPUT_BASE: u32 = 50_000;

/// A promise that becomes ready after a configurable number of readiness
/// checks, to exercise the nonblocking path.
pub struct DummyPromise<T> {
    value: BackendResult<T>,
    remaining: Cell<u32>,
}

impl<T> BackendPromise for DummyPromise<T> {
    type Output = T;

    fn sync(self) -> BackendResult<T> {
        self.value
    }

    fn is_ready(&self) -> bool {
        let left = self.remaining.get();
        if left == 0 {
            true
        } else {
            self.remaining.set(left - 1);
            false
        }
    }
}

/// One blend dispatched to the backend, kept for test assertions.
#[derive(Debug, Clone)]
pub struct BlendRecord {
    pub src: u32,
    /// `(prediction handle, weight)` of each reference that made it into the
    /// blend.
    pub predictions: Vec<(u32, u16)>,
    /// Luma threshold of the control block, to check strength plumbing.
    pub th: u16,
}

/// Backend that does no pixel work and reports scripted analysis results.
#[derive(Default)]
pub struct DummyBackend {
    /// Handles whose analysis flags a scene change.
    pub scene_cuts: HashSet<u32>,
    /// Statistics reported for every frame without an override.
    pub default_stats: FrameStats,
    pub stats_overrides: HashMap<u32, FrameStats>,
    /// Handles whose analysis fails.
    pub fail_analysis: HashSet<u32>,
    /// Reference handles whose motion estimation fails at dispatch.
    pub fail_estimation: HashSet<u32>,
    /// Reference handles whose compensation fails at dispatch.
    pub fail_compensation: HashSet<u32>,
    /// Makes every blend promise resolve to an error.
    pub fail_blend: bool,
    /// Readiness checks a promise stays pending for.
    pub latency: u32,
    pub blends: Vec<BlendRecord>,
    pub lock_counts: HashMap<u32, i64>,
    outputs: u32,
}

impl DummyBackend {
    pub fn new() -> Self {
        Self {
            // Moderately noisy content; the default strength model resolves
            // this to 5.
            default_stats: FrameStats {
                noise_var: 100.0,
                noise_sad: 0.5,
                noise_sc: 1.0,
                frame_sad: 5.0,
                frame_sc: 700.0,
            },
            ..Default::default()
        }
    }

    fn promise<T>(&self, value: BackendResult<T>) -> DummyPromise<T> {
        DummyPromise {
            value,
            remaining: Cell::new(self.latency),
        }
    }

    /// True when every lock taken has been released again.
    pub fn all_unlocked(&self) -> bool {
        self.lock_counts.values().all(|&count| count == 0)
    }
}

impl FilterBackend for DummyBackend {
    type Handle = u32;
    type EstimatePromise = DummyPromise<MotionVectors>;
    type CompensatePromise = DummyPromise<u32>;
    type BlendPromise = DummyPromise<u32>;

    fn analyze(&mut self, frame: &u32, _prev: Option<&u32>) -> BackendResult<Analysis> {
        if self.fail_analysis.contains(frame) {
            return Err(BackendError::Analysis(anyhow!("injected analysis failure")));
        }
        Ok(Analysis {
            scene_change: self.scene_cuts.contains(frame),
            stats: self
                .stats_overrides
                .get(frame)
                .copied()
                .unwrap_or(self.default_stats),
        })
    }

    fn estimate(
        &mut self,
        _src: &u32,
        reference: &u32,
        _ctrl: &MeControl,
    ) -> BackendResult<Self::EstimatePromise> {
        if self.fail_estimation.contains(reference) {
            return Err(BackendError::Estimation(anyhow!(
                "injected estimation failure"
            )));
        }
        Ok(self.promise(Ok(MotionVectors {
            blocks: vec![MotionVector::default()],
            total_sad: 0,
        })))
    }

    fn compensate(
        &mut self,
        reference: &u32,
        _vectors: &MotionVectors,
    ) -> BackendResult<Self::CompensatePromise> {
        if self.fail_compensation.contains(reference) {
            return Err(BackendError::Compensation(anyhow!(
                "injected compensation failure"
            )));
        }
        Ok(self.promise(Ok(reference + PREDICTION_BASE)))
    }

    fn blend(
        &mut self,
        src: &u32,
        predictions: &[Prediction<u32>],
        ctrl: &MeControl,
    ) -> BackendResult<Self::BlendPromise> {
        self.blends.push(BlendRecord {
            src: *src,
            predictions: predictions.iter().map(|p| (p.handle, p.weight)).collect(),
            th: ctrl.th,
        });
        if self.fail_blend {
            return Ok(self.promise(Err(BackendError::Other(anyhow!("injected blend failure")))));
        }
        self.outputs += 1;
        Ok(self.promise(Ok(OUTPUT_BASE + self.outputs)))
    }

    fn lock(&mut self, frame: &u32) -> BackendResult<()> {
        *self.lock_counts.entry(*frame).or_default() += 1;
        Ok(())
    }

    fn unlock(&mut self, frame: &u32) {
        *self.lock_counts.entry(*frame).or_default() -= 1;
    }
}
