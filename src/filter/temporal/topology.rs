// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping from temporal mode to the reference layout of each frame.

use crate::filter::temporal::FilterError;
use crate::filter::temporal::FilterResult;
use crate::filter::TemporalMode;

/// One use of a neighboring frame as a blend reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefUse {
    /// Temporal offset from the frame being filtered. Negative offsets are
    /// earlier (backward) frames, positive are look-ahead.
    pub offset: i8,
    /// Relative weight units this reference carries in the blend.
    pub weight: u16,
}

/// Reference layout for one temporal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefTopology {
    /// Number of distinct frames used as references.
    pub ref_count: u8,
    /// Look-ahead distance, in frames.
    pub forward_dist: u8,
    /// Look-behind distance, in frames.
    pub backward_dist: u8,
}

impl RefTopology {
    /// Resolves the layout for `mode`.
    pub fn resolve(mode: TemporalMode) -> FilterResult<RefTopology> {
        match mode {
            TemporalMode::Unknown => {
                Err(FilterError::InvalidConfig("temporal mode must be known"))
            }
            TemporalMode::Spatial => Ok(RefTopology {
                ref_count: 0,
                forward_dist: 0,
                backward_dist: 0,
            }),
            TemporalMode::Ref1 => Ok(RefTopology {
                ref_count: 1,
                forward_dist: 0,
                backward_dist: 1,
            }),
            TemporalMode::Ref2 => Ok(RefTopology {
                ref_count: 2,
                forward_dist: 1,
                backward_dist: 1,
            }),
            // "4 references" in the sense that three distinct neighbors are
            // blended with four weight units; the near backward neighbor
            // counts twice.
            TemporalMode::Ref4 => Ok(RefTopology {
                ref_count: 3,
                forward_dist: 1,
                backward_dist: 2,
            }),
        }
    }

    /// How many frames must be buffered before a frame can be filtered with
    /// the full reference set: the frame itself plus its whole window.
    pub fn required_depth(&self) -> usize {
        1 + usize::from(self.forward_dist) + usize::from(self.backward_dist)
    }

    /// The weighted reference uses of one filtered frame, nearest first.
    pub fn reference_uses(&self) -> Vec<RefUse> {
        match (self.backward_dist, self.forward_dist) {
            (0, 0) => vec![],
            (1, 0) => vec![RefUse {
                offset: -1,
                weight: 1,
            }],
            (1, 1) => vec![
                RefUse {
                    offset: -1,
                    weight: 1,
                },
                RefUse {
                    offset: 1,
                    weight: 1,
                },
            ],
            (2, 1) => vec![
                RefUse {
                    offset: -1,
                    weight: 2,
                },
                RefUse {
                    offset: 1,
                    weight: 1,
                },
                RefUse {
                    offset: -2,
                    weight: 1,
                },
            ],
            _ => unreachable!("no such topology is ever constructed"),
        }
    }
}
