use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{DisplayError, Result};

const SENSOR_NAME: &str = "sy7636a_temperature";

/// Panel temperature sensor exposed as a sysfs text attribute.
///
/// Reads are rate-limited: within `read_interval` of the previous read
/// the cached value is returned without touching the device.
pub(crate) struct TemperatureSensor {
    file: File,
    read_interval: Duration,
    cached: i32,
    last_read: Option<Instant>,
}

impl TemperatureSensor {
    pub fn open(path: &Path, read_interval: Duration) -> Result<Self> {
        let file = File::open(path).map_err(|source| DisplayError::Sensor { source })?;
        Ok(Self {
            file,
            read_interval,
            cached: 0,
            last_read: None,
        })
    }

    /// Degrees Celsius, freshly read or cached.
    pub fn read(&mut self) -> Result<i32> {
        if let Some(last_read) = self.last_read {
            if last_read.elapsed() <= self.read_interval {
                return Ok(self.cached);
            }
        }

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| DisplayError::Sensor { source })?;

        let mut text = String::new();
        self.file
            .read_to_string(&mut text)
            .map_err(|source| DisplayError::Sensor { source })?;

        let value = text.trim().parse::<i32>().map_err(|_| DisplayError::Sensor {
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("not a temperature: {:?}", text.trim()),
            ),
        })?;

        self.cached = value;
        self.last_read = Some(Instant::now());
        Ok(value)
    }
}

/// Scan a hwmon-style sysfs class for the panel temperature sensor and
/// return the path of its `temp0` attribute.
pub fn discover_temperature_sensor() -> Option<PathBuf> {
    discover_in(Path::new("/sys/class/hwmon"))
}

pub(crate) fn discover_in(sys_class: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(sys_class).ok()?;

    for entry in entries.flatten() {
        let name = fs::read_to_string(entry.path().join("name")).unwrap_or_default();
        if name.trim() != SENSOR_NAME {
            continue;
        }

        let sensor_path = entry.path().join("temp0");
        if sensor_path.exists() {
            return Some(sensor_path);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_parses_decimal_text() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "24").unwrap();

        let mut sensor = TemperatureSensor::open(file.path(), Duration::ZERO).unwrap();
        assert_eq!(sensor.read().unwrap(), 24);
    }

    #[test]
    fn read_accepts_negative_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "-7").unwrap();

        let mut sensor = TemperatureSensor::open(file.path(), Duration::ZERO).unwrap();
        assert_eq!(sensor.read().unwrap(), -7);
    }

    #[test]
    fn read_within_interval_returns_cached_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "20").unwrap();

        let mut sensor =
            TemperatureSensor::open(file.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(sensor.read().unwrap(), 20);

        file.as_file_mut().set_len(0).unwrap();
        file.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        writeln!(file, "35").unwrap();

        // Still inside the interval, must not re-read the device.
        assert_eq!(sensor.read().unwrap(), 20);
    }

    #[test]
    fn read_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cold").unwrap();

        let mut sensor = TemperatureSensor::open(file.path(), Duration::ZERO).unwrap();
        assert!(matches!(sensor.read(), Err(DisplayError::Sensor { .. })));
    }

    #[test]
    fn discover_matches_on_sensor_name() {
        let sys = tempfile::tempdir().unwrap();

        let other = sys.path().join("hwmon0");
        fs::create_dir(&other).unwrap();
        fs::write(other.join("name"), "cpu_thermal\n").unwrap();
        fs::write(other.join("temp0"), "50\n").unwrap();

        let panel = sys.path().join("hwmon1");
        fs::create_dir(&panel).unwrap();
        fs::write(panel.join("name"), "sy7636a_temperature\n").unwrap();
        fs::write(panel.join("temp0"), "24\n").unwrap();

        assert_eq!(discover_in(sys.path()), Some(panel.join("temp0")));
    }

    #[test]
    fn discover_skips_sensor_without_attribute() {
        let sys = tempfile::tempdir().unwrap();
        let panel = sys.path().join("hwmon0");
        fs::create_dir(&panel).unwrap();
        fs::write(panel.join("name"), "sy7636a_temperature\n").unwrap();

        assert_eq!(discover_in(sys.path()), None);
    }
}
