//! Frame synthesis worker.
//!
//! Owns the intensity planes and the per-pixel step plane exclusively.
//! Batch updates encode the whole waveform sequence up front; immediate
//! updates emit one frame at a time so that compatible queued updates
//! can be folded into the transition while it is still running.

use std::mem;
use std::sync::Arc;

use log::{debug, warn};

use crate::controller::Shared;
use crate::error::Result;
use crate::geometry::Region;
use crate::panel::{
    data_offset, Frame, BUF_ACTUAL_DEPTH, BUF_DEPTH, BUF_STRIDE, EPD_SIZE, EPD_WIDTH,
};
use crate::update::{now_micros, Update, UpdateMeta};
use crate::waveform::{Intensity, PhaseMatrix, WaveformTable};

/// Where finished frame batches go. The live sink hands them to the
/// vsync worker and blocks for the handshake; dry-run and test sinks
/// capture them instead.
pub(crate) trait FrameSink {
    /// Returns `false` when the pipeline is stopping.
    fn send(&mut self, frames: &mut Vec<Frame>, meta: UpdateMeta) -> bool;
}

pub(crate) struct ChannelSink {
    pub shared: Arc<Shared>,
}

impl FrameSink for ChannelSink {
    fn send(&mut self, frames: &mut Vec<Frame>, meta: UpdateMeta) -> bool {
        self.shared.channel().send(frames, meta)
    }
}

/// One captured hand-off to the vsync stage (dry-run diagnostics).
#[derive(Debug)]
pub struct FrameBatch {
    pub meta: UpdateMeta,
    pub frames: Vec<Frame>,
}

#[derive(Default)]
pub(crate) struct CaptureSink {
    pub batches: Vec<FrameBatch>,
}

impl FrameSink for CaptureSink {
    fn send(&mut self, frames: &mut Vec<Frame>, meta: UpdateMeta) -> bool {
        self.batches.push(FrameBatch {
            meta,
            frames: mem::take(frames),
        });
        true
    }
}

pub(crate) struct Generator<S: FrameSink> {
    shared: Arc<Shared>,
    table: WaveformTable,
    sink: S,
    /// Committed on-panel value of every pixel.
    current: Vec<Intensity>,
    /// Pending target, advanced as updates are merged in.
    next: Vec<Intensity>,
    /// Per-pixel waveform step; 0 means idle, anything else marks a
    /// transition in flight whose (current, next) pair must not change.
    steps: Vec<u16>,
    null_frame: Frame,
    frames: Vec<Frame>,
    /// Dry-run records perf rows itself since no vsync worker runs.
    record_perf: bool,
}

impl<S: FrameSink> Generator<S> {
    pub fn new(
        shared: Arc<Shared>,
        table: WaveformTable,
        null_frame: Frame,
        sink: S,
        record_perf: bool,
    ) -> Self {
        Self {
            shared,
            table,
            sink,
            current: vec![0; EPD_SIZE],
            next: vec![0; EPD_SIZE],
            steps: vec![0; EPD_SIZE],
            null_frame,
            frames: Vec::new(),
            record_perf,
        }
    }

    /// Worker loop: drain the queue until the controller stops it.
    pub fn run(mut self) {
        while let Some(update) = self.shared.queue().pop_blocking() {
            self.process(update);
        }
    }

    /// Synchronous variant used by the dry-run pipeline.
    pub fn process_pending(&mut self) -> bool {
        match self.shared.queue().try_pop() {
            Some(update) => {
                self.process(update);
                true
            }
            None => false,
        }
    }

    fn process(&mut self, mut update: Update) {
        if let Some(timing) = update.timing.as_mut() {
            timing.dequeue = now_micros();
        }

        let outcome = if update.immediate {
            self.generate_immediate(&mut update)
        } else {
            self.generate_batch(&mut update)
        };

        if let Err(err) = outcome {
            warn!("generator: update_dropped ids={:?} err={err}", update.ids);
        }
    }

    fn generate_batch(&mut self, update: &mut Update) -> Result<()> {
        let temperature = self.shared.temperature();
        let waveform = self.table.lookup(update.mode, temperature)?;

        self.next.copy_from_slice(&self.current);
        update.apply(&mut self.next, EPD_WIDTH);
        self.merge_pending(update);

        let aligned = update.region.aligned(BUF_ACTUAL_DEPTH);
        debug!(
            "generator: batch ids={:?} mode={} temp={} frames={} region={}x{}+{}+{}",
            update.ids,
            update.mode,
            temperature,
            waveform.len(),
            update.region.width,
            update.region.height,
            update.region.left,
            update.region.top,
        );

        if let Some(timing) = update.timing.as_mut() {
            timing.generate.push(now_micros());
        }

        self.frames.clear();
        self.frames.reserve(waveform.len());

        for matrix in waveform.iter() {
            let mut frame = self.null_frame.clone();
            encode_batch_step(
                &mut frame,
                matrix,
                &update.region,
                &aligned,
                &self.current,
                &self.next,
            );
            self.frames.push(frame);

            if let Some(timing) = update.timing.as_mut() {
                timing.generate.push(now_micros());
            }
        }

        let meta = UpdateMeta::of(update);
        if self.record_perf {
            self.shared.record_perf(&meta);
        }
        self.sink.send(&mut self.frames, meta);
        self.current.copy_from_slice(&self.next);
        Ok(())
    }

    fn generate_immediate(&mut self, update: &mut Update) -> Result<()> {
        let temperature = self.shared.temperature();
        let waveform = self.table.lookup(update.mode, temperature)?;
        let step_count = waveform.len() as u16;

        self.steps.fill(0);
        self.next.copy_from_slice(&self.current);
        update.apply(&mut self.next, EPD_WIDTH);

        loop {
            self.merge_pending(update);

            if let Some(timing) = update.timing.as_mut() {
                timing.generate.push(now_micros());
            }

            let aligned = update.region.aligned(BUF_ACTUAL_DEPTH);
            let mut active = Region::default();
            let mut finished = true;
            let mut frame = self.null_frame.clone();

            let mut offset = data_offset(aligned.top, aligned.left);
            let row_tail =
                BUF_STRIDE - (aligned.width / BUF_ACTUAL_DEPTH * BUF_DEPTH) as usize;

            for y in aligned.top..aligned.top + aligned.height {
                for sx in
                    (aligned.left..aligned.left + aligned.width).step_by(BUF_ACTUAL_DEPTH as usize)
                {
                    let mut phases: u16 = 0;

                    for x in sx..sx + BUF_ACTUAL_DEPTH {
                        phases <<= 2;

                        if update.region.contains(x, y) {
                            let pixel = (y * EPD_WIDTH + x) as usize;

                            if self.current[pixel] != self.next[pixel] {
                                finished = false;

                                let phase = waveform[self.steps[pixel] as usize]
                                    [self.current[pixel] as usize]
                                    [self.next[pixel] as usize];
                                active.extend_point(x, y);
                                self.steps[pixel] += 1;

                                if self.steps[pixel] == step_count {
                                    // Transition complete: commit and free
                                    // the pixel for retargeting.
                                    self.steps[pixel] = 0;
                                    self.current[pixel] = self.next[pixel];
                                }

                                phases |= phase as u16;
                            }
                        }
                    }

                    frame[offset..offset + 2].copy_from_slice(&phases.to_le_bytes());
                    offset += BUF_DEPTH as usize;
                }

                offset += row_tail;
            }

            if finished {
                break;
            }

            self.frames.clear();
            self.frames.push(frame);

            let meta = UpdateMeta::of(update);
            if self.record_perf {
                self.shared.record_perf(&meta);
            }
            if !self.sink.send(&mut self.frames, meta) {
                break;
            }

            // Later passes only need to visit pixels still moving.
            update.region = active;
        }

        Ok(())
    }

    /// Fold compatible queued updates into the one being processed.
    /// Merging stops at the first update with a different mode or
    /// pipeline, or (for immediate updates) one that would retarget a
    /// pixel whose transition is still in flight.
    fn merge_pending(&mut self, current: &mut Update) {
        let shared = Arc::clone(&self.shared);
        let mut queue = shared.queue().lock();

        while let Some(next) = queue.pending.front() {
            if next.immediate != current.immediate || next.mode != current.mode {
                return;
            }

            if current.immediate && !retarget_safe(&self.next, &self.steps, next) {
                return;
            }

            let absorbed = match queue.pending.pop_front() {
                Some(absorbed) => absorbed,
                None => return,
            };

            absorbed.apply(&mut self.next, EPD_WIDTH);
            current.region.extend(&absorbed.region);
            current.ids.extend_from_slice(&absorbed.ids);
            debug!("generator: merged ids={:?}", current.ids);
        }
    }

    pub fn committed(&self) -> &[Intensity] {
        &self.current
    }

    #[cfg(test)]
    pub fn step_plane(&self) -> &[u16] {
        &self.steps
    }

    #[cfg(test)]
    pub fn sink_ref(&self) -> &S {
        &self.sink
    }
}

impl Generator<CaptureSink> {
    pub fn take_batches(&mut self) -> Vec<FrameBatch> {
        mem::take(&mut self.sink.batches)
    }
}

/// A queued update may only change pixels that are idle or whose
/// pending target it leaves untouched; rewriting the target of a pixel
/// mid-waveform would corrupt the transition.
fn retarget_safe(next_plane: &[Intensity], steps: &[u16], candidate: &Update) -> bool {
    let region = &candidate.region;

    for row in 0..region.height {
        for col in 0..region.width {
            let pixel = ((region.top + row) * EPD_WIDTH + region.left + col) as usize;
            let target = candidate.buffer[(row * region.width + col) as usize];

            if next_plane[pixel] != target && steps[pixel] > 0 {
                return false;
            }
        }
    }

    true
}

fn encode_batch_step(
    frame: &mut [u8],
    matrix: &PhaseMatrix,
    region: &Region,
    aligned: &Region,
    current: &[Intensity],
    next: &[Intensity],
) {
    let mut offset = data_offset(aligned.top, aligned.left);
    let row_tail = BUF_STRIDE - (aligned.width / BUF_ACTUAL_DEPTH * BUF_DEPTH) as usize;

    for y in aligned.top..aligned.top + aligned.height {
        for sx in (aligned.left..aligned.left + aligned.width).step_by(BUF_ACTUAL_DEPTH as usize) {
            let mut phases: u16 = 0;

            for x in sx..sx + BUF_ACTUAL_DEPTH {
                // Leftmost pixel of the word lands in the top bits.
                phases <<= 2;

                if region.contains(x, y) {
                    let pixel = (y * EPD_WIDTH + x) as usize;
                    phases |= matrix[current[pixel] as usize][next[pixel] as usize] as u16;
                }
            }

            // Low half of the cell only; bytes 2..4 are control slots
            // inherited from the null frame.
            frame[offset..offset + 2].copy_from_slice(&phases.to_le_bytes());
            offset += BUF_DEPTH as usize;
        }

        offset += row_tail;
    }
}
