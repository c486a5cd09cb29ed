// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Staged execution of the per-frame filter job.
//!
//! Once the queue has a frame with its reference window buffered, the
//! pipeline walks it through motion estimation, compensation and the final
//! blend, one backend promise per stage. A failed reference degrades the
//! blend instead of failing the frame; with every reference gone the blend
//! falls back to a purely spatial denoise, and a failed blend emits the
//! unmodified input. One input frame always becomes exactly one output frame.

use crate::backend::BackendPromise;
use crate::backend::FilterBackend;
use crate::backend::MeControl;
use crate::backend::MotionVectors;
use crate::backend::Prediction;
use crate::filter::temporal::noise::Recommendation;
use crate::filter::temporal::params::RuntimeParamController;
use crate::filter::temporal::queue::FrameQueue;
use crate::filter::temporal::FilterError;
use crate::filter::temporal::FilterResult;
use crate::filter::FilteredFrame;
use crate::filter::FrameMeta;
use crate::BlockingMode;
use crate::Resolution;

/// One backend job of the active stage.
enum JobState<P, T> {
    Pending(P),
    Done(T),
    Failed,
}

struct EstimateJob<B: FilterBackend> {
    reference: B::Handle,
    /// Weight units of this reference in the topology.
    weight: u16,
    state: JobState<B::EstimatePromise, MotionVectors>,
}

struct CompensateJob<B: FilterBackend> {
    weight: u16,
    state: JobState<B::CompensatePromise, B::Handle>,
}

enum Stage<B: FilterBackend> {
    Idle,
    Estimating(Vec<EstimateJob<B>>),
    Compensating(Vec<CompensateJob<B>>),
    Blending(B::BlendPromise),
}

/// Per-reference blend weight, in units of
/// [`BLEND_WEIGHT_SCALE`](crate::backend::BLEND_WEIGHT_SCALE).
///
/// Anchor frames keep at most one unit of temporal weight so they stay
/// faithful to the coded picture they align with.
fn temporal_weight(strength: u8, is_intra: bool) -> u16 {
    if is_intra {
        u16::from(strength.min(1))
    } else {
        u16::from(strength) * 3
    }
}

/// Drives the staged jobs of the frame at the queue's output position.
pub struct FilterPipeline<B: FilterBackend> {
    stage: Stage<B>,
    resolution: Resolution,
    ctrl: MeControl,
    /// Surfaces checked out for the active job.
    locked: Vec<B::Handle>,
}

impl<B: FilterBackend> FilterPipeline<B> {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            stage: Stage::Idle,
            resolution,
            ctrl: MeControl::new(resolution, 0, Default::default()),
            locked: vec![],
        }
    }

    /// True while a frame is in flight through the stages.
    pub fn busy(&self) -> bool {
        !matches!(self.stage, Stage::Idle)
    }

    /// Advances the pipeline as far as the backend allows and returns the
    /// next output frame once its job completes.
    ///
    /// In blocking mode every dispatched promise is synced on, so one call
    /// takes a ready queue frame all the way to emission. In nonblocking mode
    /// the call returns `Ok(None)` whenever a promise is still pending.
    pub fn poll(
        &mut self,
        backend: &mut B,
        queue: &mut FrameQueue<B::Handle>,
        params: &mut RuntimeParamController,
        blocking: BlockingMode,
    ) -> FilterResult<Option<FilteredFrame<B::Handle>>> {
        loop {
            match std::mem::replace(&mut self.stage, Stage::Idle) {
                Stage::Idle => {
                    if !queue.output_ready() {
                        return Ok(None);
                    }
                    if let Some(frame) = self.start(backend, queue, params)? {
                        return Ok(Some(frame));
                    }
                }
                Stage::Estimating(mut jobs) => {
                    if !settle_jobs(&mut jobs, |j| &mut j.state, blocking) {
                        self.stage = Stage::Estimating(jobs);
                        return Ok(None);
                    }
                    self.dispatch_compensations(backend, queue, jobs)?;
                }
                Stage::Compensating(mut jobs) => {
                    if !settle_jobs(&mut jobs, |j| &mut j.state, blocking) {
                        self.stage = Stage::Compensating(jobs);
                        return Ok(None);
                    }
                    if let Some(frame) = self.dispatch_blend(backend, queue, jobs)? {
                        return Ok(Some(frame));
                    }
                }
                Stage::Blending(promise) => {
                    if blocking == BlockingMode::NonBlocking && !promise.is_ready() {
                        self.stage = Stage::Blending(promise);
                        return Ok(None);
                    }
                    return Ok(Some(self.finish_blend(backend, queue, promise)?));
                }
            }
        }
    }

    /// Releases every surface of the in-flight job and resets to idle. Any
    /// pending backend work is abandoned.
    pub fn cancel(&mut self, backend: &mut B) {
        self.stage = Stage::Idle;
        for handle in self.locked.drain(..) {
            backend.unlock(&handle);
        }
    }

    fn current_frame(
        queue: &FrameQueue<B::Handle>,
    ) -> FilterResult<(B::Handle, u32, FrameMeta, u8)> {
        let record = queue.output().ok_or(FilterError::NotReady)?;
        Ok((
            record.surface.clone(),
            record.frame_number,
            record.meta,
            record.strength.unwrap_or(0),
        ))
    }

    /// Resolves the output frame's strength and dispatches the first stage,
    /// or emits it right away when it bypasses filtering.
    fn start(
        &mut self,
        backend: &mut B,
        queue: &mut FrameQueue<B::Handle>,
        params: &mut RuntimeParamController,
    ) -> FilterResult<Option<FilteredFrame<B::Handle>>> {
        let record = queue.output_mut().ok_or(FilterError::NotReady)?;
        // A canceled job leaves the strength resolved; reuse it.
        let rec = match record.strength {
            Some(strength) => Recommendation {
                strength,
                should_filter: strength > 0,
            },
            None => params.resolve_strength(record)?,
        };
        let (surface, frame_number, meta, sub_pel) = (
            record.surface.clone(),
            record.frame_number,
            record.meta,
            record.applied.sub_pel,
        );

        if !rec.should_filter {
            log::debug!("frame {frame_number}: bypassing the filter");
            queue.finish_output();
            return Ok(Some(FilteredFrame {
                handle: surface,
                frame_number,
                meta,
                strength: rec.strength,
                filtered: false,
            }));
        }

        self.ctrl = MeControl::new(self.resolution, rec.strength, sub_pel);
        backend.lock(&surface)?;
        self.locked.push(surface.clone());

        let plan = queue.reference_plan();
        if plan.is_empty() {
            log::debug!("frame {frame_number}: no references, spatial denoise only");
            self.stage = match backend.blend(&surface, &[], &self.ctrl) {
                Ok(promise) => Stage::Blending(promise),
                Err(err) => {
                    log::error!("frame {frame_number}: blend dispatch failed: {err}");
                    return Ok(Some(self.emit_unfiltered(backend, queue)?));
                }
            };
            return Ok(None);
        }

        let mut jobs = Vec::with_capacity(plan.len());
        for planned in plan {
            backend.lock(&planned.surface)?;
            self.locked.push(planned.surface.clone());
            let state = match backend.estimate(&surface, &planned.surface, &self.ctrl) {
                Ok(promise) => JobState::Pending(promise),
                Err(err) => {
                    log::error!(
                        "frame {frame_number}: estimation against offset {} failed: {err}",
                        planned.offset
                    );
                    JobState::Failed
                }
            };
            jobs.push(EstimateJob {
                reference: planned.surface,
                weight: planned.weight,
                state,
            });
        }
        self.stage = Stage::Estimating(jobs);
        Ok(None)
    }

    /// Turns the settled motion fields into compensation jobs. Failed
    /// references are dropped along with their weight.
    fn dispatch_compensations(
        &mut self,
        backend: &mut B,
        queue: &FrameQueue<B::Handle>,
        jobs: Vec<EstimateJob<B>>,
    ) -> FilterResult<()> {
        let (_, frame_number, _, _) = Self::current_frame(queue)?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let JobState::Done(vectors) = job.state else {
                continue;
            };
            let state = match backend.compensate(&job.reference, &vectors) {
                Ok(promise) => JobState::Pending(promise),
                Err(err) => {
                    log::error!("frame {frame_number}: compensation dispatch failed: {err}");
                    continue;
                }
            };
            out.push(CompensateJob {
                weight: job.weight,
                state,
            });
        }
        if out.is_empty() {
            log::debug!("frame {frame_number}: all references lost, spatial denoise only");
        }
        self.stage = Stage::Compensating(out);
        Ok(())
    }

    /// Weighs the surviving predictions and dispatches the blend.
    fn dispatch_blend(
        &mut self,
        backend: &mut B,
        queue: &mut FrameQueue<B::Handle>,
        jobs: Vec<CompensateJob<B>>,
    ) -> FilterResult<Option<FilteredFrame<B::Handle>>> {
        let (surface, frame_number, meta, strength) = Self::current_frame(queue)?;

        let mut done = vec![];
        let mut units = 0u16;
        for job in jobs {
            if let JobState::Done(handle) = job.state {
                units += job.weight;
                done.push((handle, job.weight));
            }
        }

        let total = temporal_weight(strength, meta.is_intra);
        let mut predictions = vec![];
        for (handle, weight) in done {
            let weight = total * weight / units.max(1);
            if weight == 0 {
                continue;
            }
            backend.lock(&handle)?;
            self.locked.push(handle.clone());
            predictions.push(Prediction { handle, weight });
        }

        self.stage = match backend.blend(&surface, &predictions, &self.ctrl) {
            Ok(promise) => Stage::Blending(promise),
            Err(err) => {
                log::error!("frame {frame_number}: blend dispatch failed: {err}");
                return Ok(Some(self.emit_unfiltered(backend, queue)?));
            }
        };
        Ok(None)
    }

    /// Completes the blend and emits the frame, falling back to the
    /// unmodified input if the blend itself failed.
    fn finish_blend(
        &mut self,
        backend: &mut B,
        queue: &mut FrameQueue<B::Handle>,
        promise: B::BlendPromise,
    ) -> FilterResult<FilteredFrame<B::Handle>> {
        let (surface, frame_number, meta, strength) = Self::current_frame(queue)?;
        let (handle, filtered) = match promise.sync() {
            Ok(handle) => (handle, true),
            Err(err) => {
                log::error!("frame {frame_number}: blend failed: {err}");
                (surface, false)
            }
        };
        for locked in self.locked.drain(..) {
            backend.unlock(&locked);
        }
        queue.finish_output();
        log::trace!("emitting frame {frame_number} (filtered: {filtered})");
        Ok(FilteredFrame {
            handle,
            frame_number,
            meta,
            strength,
            filtered,
        })
    }

    /// Emits the current frame unmodified after a backend failure, releasing
    /// whatever the job had locked.
    fn emit_unfiltered(
        &mut self,
        backend: &mut B,
        queue: &mut FrameQueue<B::Handle>,
    ) -> FilterResult<FilteredFrame<B::Handle>> {
        let (surface, frame_number, meta, strength) = Self::current_frame(queue)?;
        for locked in self.locked.drain(..) {
            backend.unlock(&locked);
        }
        queue.finish_output();
        Ok(FilteredFrame {
            handle: surface,
            frame_number,
            meta,
            strength,
            filtered: false,
        })
    }
}

/// Polls every pending job of a stage, syncing on those that are ready (or
/// all of them in blocking mode). Returns true once none remain pending.
fn settle_jobs<J, P: BackendPromise>(
    jobs: &mut [J],
    state: impl Fn(&mut J) -> &mut JobState<P, P::Output>,
    blocking: BlockingMode,
) -> bool {
    let mut settled = true;
    for job in jobs {
        let slot = state(job);
        if !matches!(slot, JobState::Pending(_)) {
            continue;
        }
        match std::mem::replace(slot, JobState::Failed) {
            JobState::Pending(promise) => {
                if blocking == BlockingMode::Blocking || promise.is_ready() {
                    match promise.sync() {
                        Ok(output) => *slot = JobState::Done(output),
                        Err(err) => log::error!("backend job failed: {err}"),
                    }
                } else {
                    *slot = JobState::Pending(promise);
                    settled = false;
                }
            }
            other => *slot = other,
        }
    }
    settled
}
