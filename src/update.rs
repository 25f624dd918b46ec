use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::geometry::Region;
use crate::waveform::{Intensity, ModeId};

pub type UpdateId = u64;

/// Microseconds since the Unix epoch, the unit of every perf timestamp.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

/// Pipeline timestamps collected when perf recording is enabled.
#[derive(Debug, Clone, Default)]
pub struct Timing {
    pub queue: u64,
    pub dequeue: u64,
    pub generate: Vec<u64>,
    pub vsync: Vec<u64>,
}

/// One pending display update in panel-native coordinates.
///
/// `ids` is multi-valued because merged updates accumulate the ids of
/// every update they absorbed.
#[derive(Debug, Clone)]
pub struct Update {
    pub ids: Vec<UpdateId>,
    pub mode: ModeId,
    pub immediate: bool,
    pub region: Region,
    pub buffer: Vec<Intensity>,
    pub timing: Option<Timing>,
}

impl Update {
    /// Copy the update buffer into `plane` at `region`. `stride` is the
    /// plane width in pixels.
    pub fn apply(&self, plane: &mut [Intensity], stride: u32) {
        let width = self.region.width as usize;

        for row in 0..self.region.height as usize {
            let src = row * width;
            let dst = (self.region.top as usize + row) * stride as usize + self.region.left as usize;
            plane[dst..dst + width].copy_from_slice(&self.buffer[src..src + width]);
        }
    }
}

/// Update metadata that travels with encoded frames to the vsync stage
/// and into the perf report.
#[derive(Debug, Clone)]
pub struct UpdateMeta {
    pub ids: Vec<UpdateId>,
    pub mode: ModeId,
    pub region: Region,
    pub timing: Option<Timing>,
}

impl UpdateMeta {
    pub(crate) fn of(update: &Update) -> Self {
        Self {
            ids: update.ids.clone(),
            mode: update.mode,
            region: update.region,
            timing: update.timing.clone(),
        }
    }
}

pub(crate) struct QueueInner {
    pub pending: VecDeque<Update>,
    pub stopping: bool,
}

/// FIFO hand-off point between producers and the generator worker.
pub(crate) struct UpdateQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, update: Update) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push_back(update);
        self.available.notify_one();
    }

    /// Block until an update arrives or the queue is stopped.
    pub fn pop_blocking(&self) -> Option<Update> {
        let mut inner = self.inner.lock().unwrap();
        while inner.pending.is_empty() && !inner.stopping {
            inner = self.available.wait(inner).unwrap();
        }

        if inner.stopping {
            return None;
        }

        inner.pending.pop_front()
    }

    pub fn try_pop(&self) -> Option<Update> {
        self.inner.lock().unwrap().pending.pop_front()
    }

    /// Lock the queue for merge scans; the generator folds compatible
    /// pending updates into the one it is processing under this guard.
    pub fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap()
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopping = true;
        self.available.notify_all();
    }

    /// Re-arm a stopped queue so the controller can be restarted.
    pub fn reset(&self) {
        self.inner.lock().unwrap().stopping = false;
    }
}
