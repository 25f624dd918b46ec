//! Userspace waveform controller for an electrophoretic display panel.
//!
//! The panel sits behind a Linux framebuffer that consumes pre-encoded
//! drive frames rather than pixel intensities. [`Display`] accepts
//! rectangular grayscale updates, folds them into the per-pixel transition
//! state, encodes waveform frames and pans them out in lock-step with the
//! panel's vertical sync.

mod controller;
mod error;
mod fb;
mod generator;
mod geometry;
mod panel;
mod perf;
mod platform;
mod sensor;
mod update;
mod vsync;
mod waveform;

pub use controller::{Display, DisplayOptions, FrameBatch};
pub use error::{DisplayError, Result};
pub use geometry::Region;
pub use panel::{
    Frame, BUF_ACTUAL_DEPTH, BUF_DEPTH, BUF_FRAME, BUF_HEIGHT, BUF_STRIDE, BUF_TOTAL_FRAMES,
    BUF_WIDTH, EPD_HEIGHT, EPD_SIZE, EPD_WIDTH, INTENSITY_VALUES, MARGIN_LEFT, MARGIN_TOP,
};
pub use update::{Timing, Update, UpdateId, UpdateMeta};
pub use waveform::{Intensity, ModeId, ModeKind, Phase, PhaseMatrix, Waveform, WaveformTable};
