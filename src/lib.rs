// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control core for an adaptive motion-compensated temporal filter (MCTF).
//!
//! This crate implements the frame-queue and adaptive-control state machine of
//! a multi-reference temporal denoiser: a bounded look-ahead/look-behind buffer
//! of frames, selection of a reference topology per frame, scene-change-aware
//! invalidation of references, noise-driven and bitrate-driven filter strength,
//! and the staged analyze/estimate/compensate/blend/emit pipeline that turns
//! one input frame into one output frame in input order.
//!
//! The pixel-level work (motion search, compensation, blending, spatial
//! analysis) is delegated to a [backend](crate::backend), typically a GPU
//! compute queue. The controller in [`filter::temporal`] never touches frame
//! memory itself; it only holds handles with a lock/unlock contract.

pub mod backend;
pub mod filter;

/// Width and height of a frame surface, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Instructs the controller on whether it should block while waiting for
/// backend compute jobs. Nonblocking mode is conditional on backend support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}
