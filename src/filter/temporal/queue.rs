// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded look-ahead/look-behind frame queue.
//!
//! Frames enter in display order and leave in the same order once their
//! reference window is buffered. A frame stays queued after emission for as
//! long as later frames still reference it; a use counter set at push time
//! tracks that, so eviction needs no scan of future frames.

use std::collections::VecDeque;

use crate::backend::FrameStats;
use crate::filter::temporal::topology::RefTopology;
use crate::filter::temporal::FilterError;
use crate::filter::temporal::FilterResult;
use crate::filter::FrameMeta;
use crate::filter::RuntimeParams;

/// State tracked for one queued frame.
#[derive(Debug)]
pub struct FrameRecord<H> {
    pub surface: H,
    /// Position in the input sequence, starting at zero.
    pub frame_number: u32,
    pub meta: FrameMeta,
    /// Index of the scene this frame belongs to. References never cross
    /// scene boundaries.
    pub scene_index: u32,
    /// True if the analyzer flagged this frame as the start of a new scene.
    pub scene_change: bool,
    /// Analyzer statistics, absent if analysis failed for this frame.
    pub stats: Option<FrameStats>,
    /// Snapshot of the runtime parameters in effect when the frame was
    /// ingested.
    pub applied: RuntimeParams,
    /// Strength resolved for this frame, set exactly once.
    pub strength: Option<u8>,
    /// Emissions (own and of referencing neighbors) left before the record
    /// can be evicted.
    remaining_uses: u8,
    emitted: bool,
}

/// A reference selected for the frame currently at the output position.
#[derive(Debug, Clone)]
pub struct PlannedRef<H> {
    pub surface: H,
    /// Temporal offset from the filtered frame.
    pub offset: i8,
    /// Weight units out of the topology's total.
    pub weight: u16,
}

/// Display-order queue of frames awaiting their reference window.
#[derive(Debug)]
pub struct FrameQueue<H> {
    slots: VecDeque<FrameRecord<H>>,
    topology: RefTopology,
    /// Queue capacity; equals the buffered window of the topology.
    depth: usize,
    /// Index of the next frame to emit.
    out_pos: usize,
    /// Set once the queue first fills to `depth`. Until then no frame is
    /// emitted, so the very first frames get their full look-ahead.
    primed: bool,
    draining: bool,
}

impl<H: Clone> FrameQueue<H> {
    pub fn new(topology: RefTopology) -> Self {
        Self {
            slots: VecDeque::with_capacity(topology.required_depth()),
            topology,
            depth: topology.required_depth(),
            out_pos: 0,
            primed: false,
            draining: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn draining(&self) -> bool {
        self.draining
    }

    /// True when the buffered window is fully occupied and a frame must be
    /// emitted before another can enter.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.depth
    }

    /// Queues one frame. Fails with [`FilterError::QueueFull`] when the
    /// window is fully occupied; the caller must emit a frame first.
    pub fn push(&mut self, record: FrameRecord<H>) -> FilterResult<()> {
        debug_assert!(!self.draining);
        if self.slots.len() >= self.depth {
            return Err(FilterError::QueueFull);
        }
        log::trace!(
            "queueing frame {} (scene {}, scene_change: {})",
            record.frame_number,
            record.scene_index,
            record.scene_change
        );
        self.slots.push_back(record);
        if self.slots.len() == self.depth {
            self.primed = true;
        }
        Ok(())
    }

    /// Builds the record for `push`, deriving the use counter from the
    /// topology and the frame's position in the stream.
    pub fn make_record(
        &self,
        surface: H,
        frame_number: u32,
        meta: FrameMeta,
        scene_index: u32,
        scene_change: bool,
        stats: Option<FrameStats>,
        applied: RuntimeParams,
    ) -> FrameRecord<H> {
        // The frame is used once per emission whose window covers it: its
        // own, plus those of up to `forward_dist` predecessors and
        // `backward_dist` successors.
        let predecessors = std::cmp::min(u32::from(self.topology.forward_dist), frame_number) as u8;
        FrameRecord {
            surface,
            frame_number,
            meta,
            scene_index,
            scene_change,
            stats,
            applied,
            strength: None,
            remaining_uses: predecessors + self.topology.backward_dist + 1,
            emitted: false,
        }
    }

    /// True when the frame at the output position has its full reference
    /// window buffered, or any frame remains while draining.
    pub fn output_ready(&self) -> bool {
        if self.draining {
            return self.out_pos < self.slots.len();
        }
        self.primed
            && self.slots.len() - self.out_pos >= usize::from(self.topology.forward_dist) + 1
    }

    /// The frame next in line for emission.
    pub fn output(&self) -> Option<&FrameRecord<H>> {
        if self.output_ready() {
            self.slots.get(self.out_pos)
        } else {
            None
        }
    }

    pub fn output_mut(&mut self) -> Option<&mut FrameRecord<H>> {
        if self.output_ready() {
            self.slots.get_mut(self.out_pos)
        } else {
            None
        }
    }

    /// References available for the frame at the output position.
    ///
    /// Neighbors outside the buffer (head of stream, drain) or across a
    /// scene boundary are left out, degrading towards a spatial-only blend.
    pub fn reference_plan(&self) -> Vec<PlannedRef<H>> {
        let Some(src) = self.output() else {
            return vec![];
        };
        self.topology
            .reference_uses()
            .into_iter()
            .filter_map(|r| {
                let idx = self.out_pos.checked_add_signed(isize::from(r.offset))?;
                let slot = self.slots.get(idx)?;
                if slot.scene_index != src.scene_index {
                    return None;
                }
                Some(PlannedRef {
                    surface: slot.surface.clone(),
                    offset: r.offset,
                    weight: r.weight,
                })
            })
            .collect()
    }

    /// Marks the frame at the output position emitted, releases one use of
    /// every frame in its window and evicts records nothing needs anymore.
    pub fn finish_output(&mut self) {
        debug_assert!(self.output_ready());
        let Some(out) = self.slots.get_mut(self.out_pos) else {
            return;
        };
        out.emitted = true;
        let m = out.frame_number;
        let low = m.saturating_sub(u32::from(self.topology.backward_dist));
        let high = m + u32::from(self.topology.forward_dist);
        for slot in &mut self.slots {
            if (low..=high).contains(&slot.frame_number) {
                slot.remaining_uses = slot.remaining_uses.saturating_sub(1);
            }
        }
        self.out_pos += 1;
        while let Some(front) = self.slots.front() {
            if front.emitted && front.remaining_uses == 0 {
                let evicted = self.slots.pop_front();
                self.out_pos -= 1;
                if let Some(evicted) = evicted {
                    log::trace!("evicting frame {}", evicted.frame_number);
                }
            } else {
                break;
            }
        }
    }

    /// Switches the queue to drain mode: every remaining frame becomes
    /// emittable with whatever references are still buffered.
    pub fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        // Emissions of frames past the end of the stream will never happen;
        // forget the uses they would have released.
        if let Some(last) = self.slots.back().map(|s| s.frame_number) {
            let backward = u32::from(self.topology.backward_dist);
            for slot in &mut self.slots {
                let missing = (slot.frame_number + backward).saturating_sub(last);
                slot.remaining_uses = slot.remaining_uses.saturating_sub(missing as u8);
            }
        }
    }

    /// Empties the queue, returning every record still held so the caller
    /// can release the underlying surfaces.
    pub fn clear(&mut self) -> Vec<FrameRecord<H>> {
        self.out_pos = 0;
        self.primed = false;
        self.slots.drain(..).collect()
    }
}
