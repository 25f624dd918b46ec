//! Public façade over the update pipeline.
//!
//! `Display` owns the device handles and the worker threads; producers
//! feed it updates in display-oriented coordinates and the pipeline
//! takes care of the rest. In dry-run mode no device is touched and no
//! thread runs: updates are processed synchronously from `push_update`
//! and the resulting frame batches are captured for inspection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::error::{DisplayError, Result};
use crate::fb::{self, FbPanel, Framebuffer};
use crate::generator::{CaptureSink, ChannelSink, Generator};
use crate::geometry::Region;
use crate::panel::{
    null_frame, BUF_FRAME, BUF_HEIGHT, BUF_TOTAL_FRAMES, BUF_WIDTH, EPD_HEIGHT, EPD_WIDTH,
    INTENSITY_VALUES,
};
use crate::perf::PerfReport;
use crate::sensor::{self, TemperatureSensor};
use crate::update::{now_micros, Timing, Update, UpdateMeta, UpdateQueue};
use crate::vsync::{FrameChannel, Pumper};
use crate::waveform::{Intensity, ModeId, ModeKind, WaveformTable};

pub use crate::generator::FrameBatch;

/// Temperature assumed when no sensor is attached.
const DRY_RUN_TEMPERATURE: i32 = 24;

/// Runtime pipeline configuration.
#[derive(Debug, Clone)]
pub struct DisplayOptions {
    /// Skip all device access and thread creation; process updates
    /// synchronously and capture the generated frames.
    pub dry_run: bool,
    /// Collect per-update pipeline timestamps, rendered by
    /// [`Display::perf_report`].
    pub perf_record: bool,
    /// Idle time after which the vsync worker blanks the panel.
    pub power_off_timeout: Duration,
    /// Minimum delay between two reads of the temperature sensor.
    pub temperature_read_interval: Duration,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            perf_record: false,
            power_off_timeout: Duration::from_secs(3),
            temperature_read_interval: Duration::from_secs(30),
        }
    }
}

/// State shared between the controller and its workers.
pub(crate) struct Shared {
    queue: UpdateQueue,
    channel: FrameChannel,
    temperature: AtomicI32,
    sensor: Option<Mutex<TemperatureSensor>>,
    perf: Option<Mutex<PerfReport>>,
    next_update_id: AtomicU64,
}

impl Shared {
    pub fn new(sensor: Option<TemperatureSensor>, perf_record: bool) -> Self {
        Self {
            queue: UpdateQueue::new(),
            channel: FrameChannel::new(),
            temperature: AtomicI32::new(DRY_RUN_TEMPERATURE),
            sensor: sensor.map(Mutex::new),
            perf: perf_record.then(|| Mutex::new(PerfReport::default())),
            next_update_id: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn channel(&self) -> &FrameChannel {
        &self.channel
    }

    pub fn temperature(&self) -> i32 {
        self.temperature.load(Ordering::Relaxed)
    }

    /// Refresh the cached temperature; failures at start-up are fatal.
    pub fn read_temperature(&self) -> Result<()> {
        if let Some(sensor) = &self.sensor {
            let value = sensor.lock().unwrap().read()?;
            self.temperature.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Refresh the cached temperature, keeping the previous value if
    /// the sensor misbehaves mid-run.
    pub fn refresh_temperature(&self) {
        if let Err(err) = self.read_temperature() {
            warn!("display: temperature_read_failed err={err}");
        }
    }

    pub fn perf_enabled(&self) -> bool {
        self.perf.is_some()
    }

    pub fn record_perf(&self, meta: &UpdateMeta) {
        if let Some(perf) = &self.perf {
            perf.lock().unwrap().record(meta);
        }
    }

    pub fn perf_report(&self) -> Option<String> {
        self.perf
            .as_ref()
            .map(|perf| perf.lock().unwrap().render())
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_update_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Display {
    shared: Arc<Shared>,
    table: WaveformTable,
    options: DisplayOptions,
    fb: Option<Arc<Framebuffer>>,
    dry: Option<Mutex<Generator<CaptureSink>>>,
    generator_thread: Option<JoinHandle<()>>,
    vsync_thread: Option<JoinHandle<()>>,
    started: bool,
}

impl Display {
    /// Open the panel devices found by the discovery helpers. In
    /// dry-run mode no device is needed and none is opened.
    pub fn new(table: WaveformTable, options: DisplayOptions) -> Result<Self> {
        if options.dry_run {
            return Self::build(None, None, table, options);
        }

        let fb_path = Self::discover_framebuffer()
            .ok_or(DisplayError::DeviceNotFound("framebuffer"))?;
        let sensor_path = Self::discover_temperature_sensor()
            .ok_or(DisplayError::DeviceNotFound("temperature sensor"))?;
        Self::with_paths(&fb_path, &sensor_path, table, options)
    }

    /// Open explicit device paths.
    pub fn with_paths(
        fb_path: &Path,
        sensor_path: &Path,
        table: WaveformTable,
        options: DisplayOptions,
    ) -> Result<Self> {
        if options.dry_run {
            return Self::build(None, None, table, options);
        }

        let fb = Framebuffer::open(fb_path).map_err(|source| DisplayError::Io {
            op: "open framebuffer device",
            source,
        })?;
        let sensor = TemperatureSensor::open(sensor_path, options.temperature_read_interval)?;
        Self::build(Some(fb), Some(sensor), table, options)
    }

    fn build(
        fb: Option<Framebuffer>,
        sensor: Option<TemperatureSensor>,
        table: WaveformTable,
        options: DisplayOptions,
    ) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared::new(sensor, options.perf_record)),
            table,
            options,
            fb: fb.map(Arc::new),
            dry: None,
            generator_thread: None,
            vsync_thread: None,
            started: false,
        })
    }

    /// First framebuffer device of the graphics class whose name
    /// matches the EPD controller.
    pub fn discover_framebuffer() -> Option<PathBuf> {
        fb::discover_framebuffer()
    }

    /// Panel temperature attribute of the matching hwmon device.
    pub fn discover_temperature_sensor() -> Option<PathBuf> {
        sensor::discover_temperature_sensor()
    }

    /// Power the panel, validate the framebuffer geometry, prime every
    /// virtual frame slot with the null frame and start both workers.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        if self.options.dry_run {
            self.dry = Some(Mutex::new(Generator::new(
                Arc::clone(&self.shared),
                self.table.clone(),
                null_frame(),
                CaptureSink::default(),
                self.options.perf_record,
            )));
            self.started = true;
            return Ok(());
        }

        let fb = self
            .fb
            .as_ref()
            .map(Arc::clone)
            .ok_or(DisplayError::DeviceNotFound("framebuffer"))?;

        if let Err(err) = fb.set_power(true) {
            warn!("display: unblank_failed err={err}");
        }
        self.shared.read_temperature()?;

        let var = fb.var_info().map_err(|source| DisplayError::Io {
            op: "fetch display vscreeninfo",
            source,
        })?;
        let fix = fb.fix_info().map_err(|source| DisplayError::Io {
            op: "fetch display fscreeninfo",
            source,
        })?;

        if var.xres != BUF_WIDTH
            || var.yres != BUF_HEIGHT
            || var.xres_virtual != BUF_WIDTH
            || var.yres_virtual != BUF_HEIGHT * BUF_TOTAL_FRAMES
            || (fix.smem_len as usize) < BUF_FRAME * BUF_TOTAL_FRAMES as usize
        {
            return Err(DisplayError::BadDimensions {
                xres: var.xres,
                yres: var.yres,
                yres_virtual: var.yres_virtual,
                smem_len: fix.smem_len,
            });
        }

        let mut map = fb.map(fix.smem_len as usize).map_err(|source| DisplayError::Io {
            op: "map framebuffer to memory",
            source,
        })?;

        let frame = null_frame();
        for slot in 0..BUF_TOTAL_FRAMES as usize {
            map.write_frame(slot, &frame);
        }

        self.shared.queue.reset();
        self.shared.channel.reset();

        let generator = Generator::new(
            Arc::clone(&self.shared),
            self.table.clone(),
            frame,
            ChannelSink {
                shared: Arc::clone(&self.shared),
            },
            false,
        );
        let generator_thread = thread::Builder::new()
            .name("epdc/generator".into())
            .spawn(move || generator.run())
            .map_err(|source| DisplayError::Io {
                op: "spawn generator thread",
                source,
            })?;

        let pumper = Pumper::new(
            Arc::clone(&self.shared),
            FbPanel {
                fb: Arc::clone(&fb),
                map,
                var,
            },
            self.options.power_off_timeout,
        );
        let vsync_thread = match thread::Builder::new()
            .name("epdc/vsync".into())
            .spawn(move || pumper.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                self.shared.queue.stop();
                self.shared.channel.stop_generator();
                let _ = generator_thread.join();
                return Err(DisplayError::Io {
                    op: "spawn vsync thread",
                    source,
                });
            }
        };

        self.generator_thread = Some(generator_thread);
        self.vsync_thread = Some(vsync_thread);
        self.started = true;
        info!(
            "display: started virtual={}x{} frames={}",
            var.xres, var.yres_virtual, BUF_TOTAL_FRAMES
        );
        Ok(())
    }

    /// Stop both workers and power the panel off. Idempotent; pending
    /// updates and frames in flight are abandoned.
    pub fn stop(&mut self) {
        if self.started {
            if self.options.dry_run {
                self.dry = None;
            } else {
                self.shared.queue.stop();
                self.shared.channel.stop_generator();
                if let Some(handle) = self.generator_thread.take() {
                    let _ = handle.join();
                }

                self.shared.channel.stop_vsync();
                if let Some(handle) = self.vsync_thread.take() {
                    let _ = handle.join();
                }
            }

            self.started = false;
            info!("display: stopped");
        }

        if let Some(fb) = &self.fb {
            if let Err(err) = fb.set_power(false) {
                warn!("display: blank_failed err={err}");
            }
        }
    }

    /// Queue an update by symbolic mode kind. Returns `false` when the
    /// kind is not in the waveform table or the update is invalid.
    pub fn push_update(
        &self,
        kind: ModeKind,
        immediate: bool,
        region: Region,
        buffer: &[Intensity],
    ) -> bool {
        let Some(mode) = self.table.mode_id(kind) else {
            warn!("display: unknown_mode kind={kind:?}");
            return false;
        };

        self.push_update_by_id(mode, immediate, region, buffer)
    }

    /// Queue an update. `region` and `buffer` are in display
    /// orientation; both are transformed into panel scan order here.
    /// Returns `false` on a buffer/region size mismatch or an
    /// out-of-bounds region, leaving the queue untouched.
    pub fn push_update_by_id(
        &self,
        mode: ModeId,
        immediate: bool,
        region: Region,
        buffer: &[Intensity],
    ) -> bool {
        let Some((epd_region, transposed)) = transpose_to_epd(&region, buffer) else {
            return false;
        };

        let timing = self.shared.perf_enabled().then(|| Timing {
            queue: now_micros(),
            ..Timing::default()
        });

        self.shared.queue.push(Update {
            ids: vec![self.shared.allocate_id()],
            mode,
            immediate,
            region: epd_region,
            buffer: transposed,
            timing,
        });

        if let Some(generator) = &self.dry {
            generator.lock().unwrap().process_pending();
        }

        true
    }

    /// Blank or unblank the panel supply. Edge-triggered; a no-op in
    /// dry-run mode.
    pub fn set_power(&self, on: bool) -> Result<()> {
        if let Some(fb) = &self.fb {
            fb.set_power(on).map_err(|source| DisplayError::Io {
                op: "set panel power",
                source,
            })?;
        }
        Ok(())
    }

    /// Re-read the panel temperature, rate-limited to the configured
    /// interval.
    pub fn update_temperature(&self) -> Result<()> {
        self.shared.read_temperature()
    }

    /// Frame batches captured since the last call (dry-run only).
    pub fn take_frame_log(&self) -> Vec<FrameBatch> {
        match &self.dry {
            Some(generator) => generator.lock().unwrap().take_batches(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the committed per-pixel intensities (dry-run only).
    pub fn committed_intensity(&self) -> Option<Vec<Intensity>> {
        self.dry
            .as_ref()
            .map(|generator| generator.lock().unwrap().committed().to_vec())
    }

    /// Rendered perf CSV, when `perf_record` is enabled.
    pub fn perf_report(&self) -> Option<String> {
        self.shared.perf_report()
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Rotate a display-oriented update into panel scan order: transpose,
/// flip both axes, mask intensities. `None` marks a validation failure.
pub(crate) fn transpose_to_epd(
    region: &Region,
    buffer: &[Intensity],
) -> Option<(Region, Vec<Intensity>)> {
    if buffer.len() != (region.width * region.height) as usize || region.is_empty() {
        return None;
    }

    let width = region.width as usize;
    let height = region.height as usize;
    let mask = (INTENSITY_VALUES - 1) as u8;

    let mut transposed = vec![0u8; buffer.len()];
    for (k, slot) in transposed.iter_mut().enumerate() {
        let i = height - 1 - (k % height);
        let j = width - 1 - (k / height);
        *slot = buffer[i * width + j] & mask;
    }

    let top = EPD_HEIGHT as i64 - region.left as i64 - region.width as i64;
    let left = EPD_WIDTH as i64 - region.top as i64 - region.height as i64;
    if top < 0 || left < 0 {
        return None;
    }

    let epd_region = Region::new(top as u32, left as u32, region.height, region.width);
    if epd_region.left >= EPD_WIDTH
        || epd_region.top >= EPD_HEIGHT
        || epd_region.left + epd_region.width > EPD_WIDTH
        || epd_region.top + epd_region.height > EPD_HEIGHT
    {
        return None;
    }

    Some((epd_region, transposed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_flips_both_axes() {
        // A full-screen rectangle in display orientation maps onto the
        // full panel.
        let region = Region::new(0, 0, EPD_HEIGHT, EPD_WIDTH);
        let buffer = vec![0u8; (EPD_WIDTH * EPD_HEIGHT) as usize];
        let (epd_region, _) = transpose_to_epd(&region, &buffer).unwrap();
        assert_eq!(epd_region, Region::new(0, 0, EPD_WIDTH, EPD_HEIGHT));
    }

    #[test]
    fn transpose_reverses_single_row() {
        let region = Region::new(0, 0, 8, 1);
        let buffer: Vec<u8> = (0..8).collect();
        let (epd_region, transposed) = transpose_to_epd(&region, &buffer).unwrap();

        assert_eq!(
            epd_region,
            Region::new(EPD_HEIGHT - 8, EPD_WIDTH - 1, 1, 8)
        );
        assert_eq!(transposed, vec![7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn transpose_masks_intensities() {
        let region = Region::new(0, 0, 2, 1);
        let (_, transposed) = transpose_to_epd(&region, &[0xFF, 0x21]).unwrap();
        assert_eq!(transposed, vec![0x01, 0x1F]);
    }

    #[test]
    fn transpose_rejects_size_mismatch() {
        let region = Region::new(0, 0, 4, 2);
        assert!(transpose_to_epd(&region, &[0u8; 7]).is_none());
        assert!(transpose_to_epd(&Region::new(0, 0, 0, 4), &[]).is_none());
    }

    #[test]
    fn transpose_rejects_out_of_bounds() {
        // Sits past the right edge in display orientation.
        let region = Region::new(0, EPD_WIDTH, 1, 1);
        assert!(transpose_to_epd(&region, &[0u8; 1]).is_none());

        // Sits past the bottom edge in display orientation.
        let region = Region::new(EPD_WIDTH, 0, 1, 1);
        assert!(transpose_to_epd(&region, &[0u8; 1]).is_none());

        let region = Region::new(0, EPD_HEIGHT - 2, 4, 1);
        assert!(transpose_to_epd(&region, &[0u8; 4]).is_none());
    }

    #[test]
    fn options_default_to_live_quiet_pipeline() {
        let options = DisplayOptions::default();
        assert!(!options.dry_run);
        assert!(!options.perf_record);
        assert!(options.power_off_timeout > Duration::ZERO);
    }
}
