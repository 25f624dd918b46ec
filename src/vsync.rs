//! Frame hand-off between the generator and the vsync worker.
//!
//! The channel holds at most one batch. The generator publishes by
//! swapping its buffer in (recycling the previously scanned-out
//! allocation) and then blocks until the worker has finished panning
//! the whole batch, which is what paces frame synthesis against the
//! panel refresh.

use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::controller::Shared;
use crate::panel::Frame;
use crate::platform::PanelIo;
use crate::update::{now_micros, UpdateMeta};

struct ChannelInner {
    frames: Vec<Frame>,
    meta: Option<UpdateMeta>,
    ready: bool,
    stop_generator: bool,
    stop_vsync: bool,
}

pub(crate) enum Recv {
    Ready(UpdateMeta),
    TimedOut,
    Stopped,
}

pub(crate) struct FrameChannel {
    inner: Mutex<ChannelInner>,
    can_read: Condvar,
    can_write: Condvar,
}

impl FrameChannel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                frames: Vec::new(),
                meta: None,
                ready: false,
                stop_generator: false,
                stop_vsync: false,
            }),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
        }
    }

    /// Publish a batch, blocking until the previous one has been
    /// consumed. Returns `false` when the pipeline is stopping; the
    /// batch is then abandoned.
    pub fn send(&self, frames: &mut Vec<Frame>, meta: UpdateMeta) -> bool {
        let mut inner = self
            .can_write
            .wait_while(self.inner.lock().unwrap(), |inner| {
                inner.ready && !inner.stop_generator
            })
            .unwrap();

        if inner.stop_generator {
            return false;
        }

        mem::swap(&mut inner.frames, frames);
        inner.meta = Some(meta);
        inner.ready = true;
        self.can_read.notify_one();
        true
    }

    /// Take the pending batch, swapping the previously consumed frames
    /// back to the sender side. `complete` must be called once the
    /// batch has been scanned out.
    pub fn recv(&self, frames: &mut Vec<Frame>, timeout: Option<Duration>) -> Recv {
        let mut inner = self.inner.lock().unwrap();

        match timeout {
            Some(timeout) => {
                let (guard, wait) = self
                    .can_read
                    .wait_timeout_while(inner, timeout, |inner| {
                        !inner.ready && !inner.stop_vsync
                    })
                    .unwrap();
                inner = guard;

                if wait.timed_out() && !inner.ready && !inner.stop_vsync {
                    return Recv::TimedOut;
                }
            }
            None => {
                inner = self
                    .can_read
                    .wait_while(inner, |inner| !inner.ready && !inner.stop_vsync)
                    .unwrap();
            }
        }

        if inner.stop_vsync {
            return Recv::Stopped;
        }

        mem::swap(&mut inner.frames, frames);
        match inner.meta.take() {
            Some(meta) => Recv::Ready(meta),
            None => Recv::Stopped,
        }
    }

    /// Release the sender after the current batch has been scanned out.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready = false;
        self.can_write.notify_one();
    }

    pub fn stop_generator(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stop_generator = true;
        self.can_write.notify_all();
    }

    pub fn stop_vsync(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stop_vsync = true;
        self.can_read.notify_all();
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready = false;
        inner.meta = None;
        inner.stop_generator = false;
        inner.stop_vsync = false;
    }
}

/// Vsync worker: drains the frame channel, ping-pongs batches through
/// the two visible frame slots and blanks the panel when idle.
pub(crate) struct Pumper<P: PanelIo> {
    shared: Arc<Shared>,
    panel: P,
    power_off_timeout: Duration,
    slot: usize,
    first_frame: bool,
}

impl<P: PanelIo> Pumper<P> {
    pub fn new(shared: Arc<Shared>, panel: P, power_off_timeout: Duration) -> Self {
        Self {
            shared,
            panel,
            power_off_timeout,
            slot: 0,
            first_frame: true,
        }
    }

    pub fn run(mut self) {
        let mut frames: Vec<Frame> = Vec::new();

        loop {
            let recv = self
                .shared
                .channel()
                .recv(&mut frames, Some(self.power_off_timeout));

            let mut meta = match recv {
                Recv::Stopped => return,
                Recv::Ready(meta) => meta,
                Recv::TimedOut => {
                    // No updates coming; save the panel supply until the
                    // next batch arrives.
                    info!("vsync: idle_power_off");
                    if let Err(err) = self.panel.set_power(false) {
                        warn!("vsync: blank_failed err={err}");
                    }

                    match self.shared.channel().recv(&mut frames, None) {
                        Recv::Ready(meta) => meta,
                        Recv::Stopped | Recv::TimedOut => return,
                    }
                }
            };

            if let Err(err) = self.panel.set_power(true) {
                warn!("vsync: unblank_failed err={err}");
            }
            self.shared.refresh_temperature();

            if let Some(timing) = meta.timing.as_mut() {
                timing.vsync.push(now_micros());
            }

            for frame in &frames {
                self.slot = (self.slot + 1) % 2;
                self.panel.write_frame(self.slot, frame);

                if let Err(err) = self.panel.present(self.slot, self.first_frame) {
                    // Background worker: report and bow out, the device
                    // is gone.
                    error!("vsync: present_failed slot={} err={err}", self.slot);
                    return;
                }

                self.first_frame = false;

                if let Some(timing) = meta.timing.as_mut() {
                    timing.vsync.push(now_micros());
                }
            }

            self.shared.record_perf(&meta);
            self.shared.channel().complete();
        }
    }
}

#[cfg(test)]
mod tests;
