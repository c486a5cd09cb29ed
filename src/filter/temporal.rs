// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Controller of the multi-reference temporal denoising filter.
//!
//! [`FilterController`] is the entry point: frames are pushed in display
//! order with [`ingest`], filtered frames come back in the same order through
//! [`pop_output`] once their look-ahead window is buffered. The controller
//! sequences the backend's analysis, motion search, compensation and blend
//! stages; it owns no frame memory of its own.
//!
//! [`ingest`]: FilterController::ingest
//! [`pop_output`]: FilterController::pop_output

pub mod noise;
pub mod params;
pub mod pipeline;
pub mod queue;
pub mod topology;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::FilterBackend;
use crate::filter::temporal::params::Configuration;
use crate::filter::temporal::params::RuntimeParamController;
use crate::filter::temporal::pipeline::FilterPipeline;
use crate::filter::temporal::queue::FrameQueue;
use crate::filter::temporal::topology::RefTopology;
use crate::filter::FilteredFrame;
use crate::filter::FrameMeta;
use crate::filter::RuntimeParams;
use crate::BlockingMode;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("the frame queue is full, pop an output frame first")]
    QueueFull,
    #[error("no output frame is ready")]
    NotReady,
    #[error("the strength of this frame was already resolved")]
    AlreadyResolved,
    #[error("the filter is draining or closed")]
    Closed,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type FilterResult<T> = Result<T, FilterError>;

/// The temporal filter control state machine.
///
/// One instance filters one stream. The temporal mode fixes the queue
/// geometry for the stream's lifetime; all other runtime parameters can be
/// updated between frames.
pub struct FilterController<B: FilterBackend> {
    backend: B,
    blocking: BlockingMode,
    params: RuntimeParamController,
    topology: RefTopology,
    queue: FrameQueue<B::Handle>,
    pipeline: FilterPipeline<B>,
    /// Number of scene changes seen so far; doubles as the scene index
    /// stamped on ingested frames.
    scene_count: u32,
    /// Number of frames ingested so far.
    frame_count: u32,
    /// The previously ingested frame, the analyzer's temporal anchor.
    last_frame: Option<B::Handle>,
    closed: bool,
}

impl<B: FilterBackend> FilterController<B> {
    pub fn new(
        backend: B,
        resolution: Resolution,
        params: RuntimeParams,
        config: Configuration,
        blocking: BlockingMode,
    ) -> FilterResult<Self> {
        let params = RuntimeParamController::new(config, params)?;
        let topology = RefTopology::resolve(params.current().temporal_mode)?;
        log::debug!(
            "created {:?} filter, queue depth {}, {:?}",
            params.current().temporal_mode,
            topology.required_depth(),
            config
        );
        Ok(Self {
            backend,
            blocking,
            params,
            topology,
            queue: FrameQueue::new(topology),
            pipeline: FilterPipeline::new(resolution),
            scene_count: 0,
            frame_count: 0,
            last_frame: None,
            closed: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// How many frames the filter buffers; also the streaming delay, in
    /// frames, between an ingest and the corresponding output.
    pub fn required_queue_depth(&self) -> usize {
        self.topology.required_depth()
    }

    /// Stages a runtime parameter update that takes effect at the next
    /// ingest. Frames already queued are not affected.
    pub fn update_runtime_params(&mut self, params: RuntimeParams) -> FilterResult<()> {
        self.params.update(params)
    }

    /// Stages a new encode bit-budget hint; a no-op outside the
    /// bitrate-adaptive configuration.
    pub fn update_bitrate_info(&mut self, bits_per_pixel_x100k: u32) -> FilterResult<()> {
        self.params.update_bitrate_info(bits_per_pixel_x100k)
    }

    /// Submits one frame in display order.
    ///
    /// The frame is analyzed and queued; the surface stays in use until the
    /// last queued frame referencing it has been emitted. Fails with
    /// [`FilterError::QueueFull`] when the look-ahead window is fully
    /// occupied, in which case an output frame must be popped first.
    pub fn ingest(&mut self, meta: FrameMeta, handle: B::Handle) -> FilterResult<()> {
        if self.closed || self.queue.draining() {
            return Err(FilterError::Closed);
        }
        if self.queue.is_full() {
            return Err(FilterError::QueueFull);
        }
        let applied = self.params.params_for_ingest();

        let (scene_change, stats) = match self.backend.analyze(&handle, self.last_frame.as_ref()) {
            Ok(analysis) => (analysis.scene_change, Some(analysis.stats)),
            Err(err) => {
                // The frame is still filtered; strength estimation falls
                // back to the last resolved value.
                log::error!("analysis of frame {} failed: {err}", self.frame_count);
                (false, None)
            }
        };
        if scene_change {
            self.scene_count += 1;
            log::debug!(
                "scene change at frame {}, scene {}",
                self.frame_count,
                self.scene_count
            );
        }

        let record = self.queue.make_record(
            handle.clone(),
            self.frame_count,
            meta,
            self.scene_count,
            scene_change,
            stats,
            applied,
        );
        self.queue.push(record)?;
        self.frame_count += 1;
        self.last_frame = Some(handle);
        Ok(())
    }

    /// True when a call to [`pop_output`](Self::pop_output) can make
    /// progress: a frame has its window buffered or a job is in flight.
    pub fn output_ready(&self) -> bool {
        !self.closed && (self.queue.output_ready() || self.pipeline.busy())
    }

    /// Returns the next filtered frame in display order.
    ///
    /// In blocking mode this runs the frame's whole job. In nonblocking mode
    /// it advances whatever backend work has completed and fails with
    /// [`FilterError::NotReady`] while results are still pending.
    pub fn pop_output(&mut self) -> FilterResult<FilteredFrame<B::Handle>> {
        if self.closed {
            return Err(FilterError::Closed);
        }
        self.pipeline
            .poll(
                &mut self.backend,
                &mut self.queue,
                &mut self.params,
                self.blocking,
            )?
            .ok_or(FilterError::NotReady)
    }

    /// Starts a graceful drain: no more frames are accepted and every queued
    /// frame becomes emittable with whatever references remain buffered.
    pub fn flush(&mut self) -> FilterResult<()> {
        if self.closed {
            return Err(FilterError::Closed);
        }
        log::debug!("draining, {} frames queued", self.queue.len());
        self.queue.begin_drain();
        Ok(())
    }

    /// Abandons all in-flight work and queued frames, releasing every
    /// surface. Frames never emitted are dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        log::debug!("closing, dropping {} queued frames", self.queue.len());
        self.pipeline.cancel(&mut self.backend);
        self.queue.clear();
        self.last_frame = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::dummy::OUTPUT_BASE;
    use crate::backend::dummy::PREDICTION_BASE;
    use crate::filter::Deblocking;
    use crate::filter::SubPelPrecision;
    use crate::filter::TemporalMode;

    fn controller(
        backend: DummyBackend,
        strength: u8,
        mode: TemporalMode,
        config: Configuration,
        blocking: BlockingMode,
    ) -> FilterController<DummyBackend> {
        let params = RuntimeParams {
            temporal_mode: mode,
            filter_strength: strength,
            ..Default::default()
        };
        FilterController::new(
            backend,
            Resolution::from((1920, 1080)),
            params,
            config,
            blocking,
        )
        .unwrap()
    }

    /// Feeds frames `0..count` (handle == frame number), popping whenever
    /// the queue pushes back, then drains.
    fn run_stream(
        ctrl: &mut FilterController<DummyBackend>,
        count: u32,
        intra: impl Fn(u32) -> bool,
    ) -> Vec<FilteredFrame<u32>> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut out = vec![];
        for n in 0..count {
            let meta = FrameMeta {
                timestamp: u64::from(n) * 100,
                is_intra: intra(n),
            };
            loop {
                match ctrl.ingest(meta, n) {
                    Ok(()) => break,
                    Err(FilterError::QueueFull) => out.push(ctrl.pop_output().unwrap()),
                    Err(err) => panic!("unexpected ingest error: {err}"),
                }
            }
        }
        ctrl.flush().unwrap();
        while ctrl.output_ready() {
            out.push(ctrl.pop_output().unwrap());
        }
        out
    }

    #[test]
    fn emits_in_order_exactly_once() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        assert_eq!(ctrl.required_queue_depth(), 3);

        let out = run_stream(&mut ctrl, 6, |_| false);
        assert_eq!(
            out.iter().map(|f| f.frame_number).collect::<Vec<_>>(),
            (0..6).collect::<Vec<_>>()
        );
        for frame in &out {
            assert_eq!(frame.meta.timestamp, u64::from(frame.frame_number) * 100);
            assert_eq!(frame.strength, 8);
            assert!(frame.filtered);
            assert!(frame.handle >= OUTPUT_BASE);
        }
        assert!(ctrl.backend().all_unlocked());
    }

    #[test]
    fn blend_weights_follow_topology() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        run_stream(&mut ctrl, 4, |_| false);

        let blends = &ctrl.backend().blends;
        assert_eq!(blends.len(), 4);
        // Head frame: only the look-ahead reference, all temporal weight on
        // it (strength 8 gives 24/64).
        assert_eq!(blends[0].src, 0);
        assert_eq!(blends[0].predictions, vec![(1 + PREDICTION_BASE, 24)]);
        // Mid-stream: both neighbors at half the temporal weight each.
        assert_eq!(blends[1].src, 1);
        assert_eq!(
            blends[1].predictions,
            vec![(PREDICTION_BASE, 12), (2 + PREDICTION_BASE, 12)]
        );
        // Thresholds derive from the strength.
        assert!(blends.iter().all(|b| b.th == 400));
    }

    #[test]
    fn four_ref_mode_weighs_near_backward_reference_double() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref4,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        run_stream(&mut ctrl, 6, |_| false);

        // Frame 2 is the first with the full window: refs at -1 (2 units),
        // +1 and -2 (1 unit each) sharing 24/64.
        let blend = ctrl.backend().blends.iter().find(|b| b.src == 2).unwrap();
        assert_eq!(
            blend.predictions,
            vec![
                (1 + PREDICTION_BASE, 12),
                (3 + PREDICTION_BASE, 6),
                (PREDICTION_BASE, 6),
            ]
        );
    }

    #[test]
    fn scene_cut_is_not_crossed() {
        let mut backend = DummyBackend::new();
        backend.scene_cuts.insert(3);
        let mut ctrl = controller(
            backend,
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        let out = run_stream(&mut ctrl, 6, |_| false);
        assert_eq!(out.len(), 6);

        let blends = &ctrl.backend().blends;
        // The last frame of the old scene must not look ahead across the cut.
        let before = blends.iter().find(|b| b.src == 2).unwrap();
        assert_eq!(before.predictions, vec![(1 + PREDICTION_BASE, 24)]);
        // The first frame of the new scene must not look back.
        let after = blends.iter().find(|b| b.src == 3).unwrap();
        assert_eq!(after.predictions, vec![(4 + PREDICTION_BASE, 24)]);
    }

    #[test]
    fn lost_references_degrade_to_spatial() {
        let mut backend = DummyBackend::new();
        backend.fail_estimation.extend(0..6u32);
        let mut ctrl = controller(
            backend,
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        let out = run_stream(&mut ctrl, 6, |_| false);

        // Every frame still comes out, spatially denoised.
        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|f| f.filtered));
        assert!(ctrl.backend().blends.iter().all(|b| b.predictions.is_empty()));
        assert!(ctrl.backend().all_unlocked());
    }

    #[test]
    fn failed_compensation_drops_only_that_reference() {
        let mut backend = DummyBackend::new();
        backend.fail_compensation.insert(0);
        let mut ctrl = controller(
            backend,
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        run_stream(&mut ctrl, 4, |_| false);

        // Frame 1 loses its backward reference but keeps the look-ahead,
        // which then carries the full temporal weight.
        let blend = ctrl.backend().blends.iter().find(|b| b.src == 1).unwrap();
        assert_eq!(blend.predictions, vec![(2 + PREDICTION_BASE, 24)]);
    }

    #[test]
    fn failed_blend_emits_input_unfiltered() {
        let mut backend = DummyBackend::new();
        backend.fail_blend = true;
        let mut ctrl = controller(
            backend,
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        let out = run_stream(&mut ctrl, 4, |_| false);
        assert_eq!(out.len(), 4);
        for frame in &out {
            assert!(!frame.filtered);
            assert_eq!(frame.handle, frame.frame_number);
        }
        assert!(ctrl.backend().all_unlocked());
    }

    #[test]
    fn anchor_frames_are_barely_blended() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        // Frame 2 is an anchor: one unit of temporal weight split over two
        // references truncates to nothing.
        run_stream(&mut ctrl, 5, |n| n == 2);
        let blend = ctrl.backend().blends.iter().find(|b| b.src == 2).unwrap();
        assert!(blend.predictions.is_empty());
    }

    #[test]
    fn manual_zero_strength_bypasses() {
        let mut ctrl = controller(
            DummyBackend::new(),
            0,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        let out = run_stream(&mut ctrl, 4, |_| false);
        assert_eq!(out.len(), 4);
        for frame in &out {
            assert!(!frame.filtered);
            assert_eq!(frame.strength, 0);
            assert_eq!(frame.handle, frame.frame_number);
        }
        assert!(ctrl.backend().blends.is_empty());
    }

    #[test]
    fn auto_mode_derives_strength_from_noise() {
        let mut ctrl = controller(
            DummyBackend::new(),
            0,
            TemporalMode::Ref2,
            Configuration::AutoContentAdaptive,
            BlockingMode::Blocking,
        );
        let out = run_stream(&mut ctrl, 4, |_| false);
        // The dummy's default statistics resolve to strength 5.
        for frame in &out {
            assert_eq!(frame.strength, 5);
            assert!(frame.filtered);
        }
        assert!(ctrl.backend().blends.iter().all(|b| b.th == 250));
    }

    #[test]
    fn analysis_failure_reuses_last_strength() {
        let mut backend = DummyBackend::new();
        backend.fail_analysis.insert(2);
        let mut ctrl = controller(
            backend,
            0,
            TemporalMode::Ref2,
            Configuration::AutoContentAdaptive,
            BlockingMode::Blocking,
        );
        let out = run_stream(&mut ctrl, 4, |_| false);
        assert_eq!(out.len(), 4);
        let frame = out.iter().find(|f| f.frame_number == 2).unwrap();
        assert_eq!(frame.strength, 5);
        assert!(frame.filtered);
    }

    #[test]
    fn spatial_mode_passes_frames_straight_through() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Spatial,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        assert_eq!(ctrl.required_queue_depth(), 1);
        let out = run_stream(&mut ctrl, 4, |_| false);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|f| f.filtered));
        assert!(ctrl.backend().blends.iter().all(|b| b.predictions.is_empty()));
    }

    #[test]
    fn nonblocking_returns_not_ready_until_promises_resolve() {
        let mut backend = DummyBackend::new();
        backend.latency = 2;
        let mut ctrl = controller(
            backend,
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::NonBlocking,
        );
        for n in 0..3 {
            ctrl.ingest(FrameMeta::default(), n).unwrap();
        }

        let mut not_ready = 0;
        let frame = loop {
            match ctrl.pop_output() {
                Ok(frame) => break frame,
                Err(FilterError::NotReady) => not_ready += 1,
                Err(err) => panic!("unexpected error: {err}"),
            }
        };
        assert!(not_ready > 0);
        assert_eq!(frame.frame_number, 0);
    }

    #[test]
    fn runtime_update_applies_to_later_frames_only() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        for n in 0..3 {
            ctrl.ingest(FrameMeta::default(), n).unwrap();
        }
        ctrl.update_runtime_params(RuntimeParams {
            filter_strength: 15,
            ..Default::default()
        })
        .unwrap();

        let mut out = vec![];
        for n in 3..6u32 {
            while ctrl.output_ready() {
                out.push(ctrl.pop_output().unwrap());
            }
            ctrl.ingest(FrameMeta::default(), n).unwrap();
        }
        ctrl.flush().unwrap();
        while ctrl.output_ready() {
            out.push(ctrl.pop_output().unwrap());
        }

        for frame in &out {
            let expected = if frame.frame_number < 3 { 8 } else { 15 };
            assert_eq!(frame.strength, expected, "frame {}", frame.frame_number);
        }
    }

    #[test]
    fn invalid_update_is_rejected_without_side_effects() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        assert!(matches!(
            ctrl.update_runtime_params(RuntimeParams {
                temporal_mode: TemporalMode::Ref4,
                ..Default::default()
            }),
            Err(FilterError::InvalidConfig(_))
        ));
        assert!(matches!(
            ctrl.update_runtime_params(RuntimeParams {
                filter_strength: 21,
                ..Default::default()
            }),
            Err(FilterError::InvalidConfig(_))
        ));

        let out = run_stream(&mut ctrl, 3, |_| false);
        assert!(out.iter().all(|f| f.strength == 8));
    }

    #[test]
    fn ingest_after_flush_fails() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        ctrl.ingest(FrameMeta::default(), 0).unwrap();
        ctrl.flush().unwrap();
        assert!(matches!(
            ctrl.ingest(FrameMeta::default(), 1),
            Err(FilterError::Closed)
        ));
        // The queued frame still drains.
        assert_eq!(ctrl.pop_output().unwrap().frame_number, 0);
        assert!(!ctrl.output_ready());
    }

    #[test]
    fn close_drops_queued_frames_and_releases_surfaces() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref2,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        for n in 0..3 {
            ctrl.ingest(FrameMeta::default(), n).unwrap();
        }
        ctrl.close();
        assert!(matches!(ctrl.pop_output(), Err(FilterError::Closed)));
        assert!(matches!(
            ctrl.ingest(FrameMeta::default(), 3),
            Err(FilterError::Closed)
        ));
        assert!(ctrl.backend().all_unlocked());
    }

    #[test]
    fn short_stream_drains_completely() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Ref4,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        // Fewer frames than the queue depth.
        let out = run_stream(&mut ctrl, 2, |_| false);
        assert_eq!(
            out.iter().map(|f| f.frame_number).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn spatial_options_are_sanitized_on_update() {
        let mut ctrl = controller(
            DummyBackend::new(),
            8,
            TemporalMode::Spatial,
            Configuration::ManualNonAdaptive,
            BlockingMode::Blocking,
        );
        ctrl.update_runtime_params(RuntimeParams {
            temporal_mode: TemporalMode::Spatial,
            deblocking: Deblocking::On,
            sub_pel: SubPelPrecision::Quarter,
            overlap: true,
            ..Default::default()
        })
        .unwrap();
        let out = run_stream(&mut ctrl, 2, |_| false);
        assert_eq!(out.len(), 2);
    }
}
