use std::fmt;
use std::io;

use crate::waveform::{ModeId, ModeKind};

pub type Result<T> = std::result::Result<T, DisplayError>;

#[derive(Debug)]
pub enum DisplayError {
    /// A device ioctl, open or mmap failed. Fatal when raised from `start`.
    Io { op: &'static str, source: io::Error },
    /// The framebuffer does not expose the expected virtual geometry.
    BadDimensions {
        xres: u32,
        yres: u32,
        yres_virtual: u32,
        smem_len: u32,
    },
    /// Reading or parsing the panel temperature sensor failed.
    Sensor { source: io::Error },
    /// Device discovery walked the whole sysfs class without a match.
    DeviceNotFound(&'static str),
    /// The waveform table has no entry for this mode kind.
    UnknownMode(ModeKind),
    /// The waveform table has no waveform covering this temperature.
    NoWaveform { mode: ModeId, temperature: i32 },
    /// Inconsistent in-memory waveform table construction.
    BadTable(&'static str),
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { op, source } => write!(f, "{op}: {source}"),
            Self::BadDimensions {
                xres,
                yres,
                yres_virtual,
                smem_len,
            } => write!(
                f,
                "framebuffer has invalid dimensions \
                 ({xres}x{yres}, virtual height {yres_virtual}, {smem_len} bytes)"
            ),
            Self::Sensor { source } => write!(f, "read panel temperature: {source}"),
            Self::DeviceNotFound(class) => write!(f, "no {class} device found"),
            Self::UnknownMode(kind) => write!(f, "waveform table has no {kind:?} mode"),
            Self::NoWaveform { mode, temperature } => write!(
                f,
                "no waveform for mode {mode} at {temperature} degrees"
            ),
            Self::BadTable(reason) => write!(f, "invalid waveform table: {reason}"),
        }
    }
}

impl std::error::Error for DisplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::Sensor { source } => Some(source),
            _ => None,
        }
    }
}
