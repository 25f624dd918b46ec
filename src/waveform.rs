//! Waveform lookup tables.
//!
//! A waveform is a sequence of per-step phase matrices mapping a
//! (from, to) intensity pair to the 2-bit drive phase for one frame.
//! Tables are parameterised by rendering mode and panel temperature;
//! parsing the vendor file format into a table happens upstream, this
//! module only holds the in-memory shape the pipeline queries.

use std::sync::Arc;

use crate::error::{DisplayError, Result};
use crate::panel::INTENSITY_VALUES;

/// Grayscale level in `[0, INTENSITY_VALUES)`.
pub type Intensity = u8;

/// Resolved index into the waveform table's mode list.
pub type ModeId = u8;

/// Column-driver phase for one pixel during one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// Leave the pixel untouched.
    #[default]
    Noop = 0b00,
    /// Drive towards black.
    Black = 0b01,
    /// Drive towards white.
    White = 0b10,
}

pub type PhaseMatrix = [[Phase; INTENSITY_VALUES]; INTENSITY_VALUES];

/// One full transition: `waveform[step][from][to]`.
pub type Waveform = Vec<PhaseMatrix>;

/// Standard rendering mode families of the vendor waveform format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    /// Panel initialisation flash.
    Init,
    /// Direct update, fast monochrome.
    Du,
    /// Full-quality 16-level grayscale.
    Gc16,
    /// Lighter-flashing 16-level grayscale.
    Gl16,
    Glr16,
    Gld16,
    /// Fast 1-bit animation mode.
    A2,
    Du4,
}

/// Read-only waveform store, cheap to clone and share across threads.
///
/// Temperatures are bucketed into half-open ranges
/// `[thresholds[i], thresholds[i + 1])`; each mode carries one waveform
/// per range.
#[derive(Debug, Clone)]
pub struct WaveformTable {
    thresholds: Arc<Vec<i32>>,
    kinds: Arc<Vec<ModeKind>>,
    waveforms: Arc<Vec<Vec<Arc<Waveform>>>>,
}

impl WaveformTable {
    pub fn new(thresholds: Vec<i32>, modes: Vec<(ModeKind, Vec<Waveform>)>) -> Result<Self> {
        if thresholds.len() < 2 {
            return Err(DisplayError::BadTable("fewer than two temperature bounds"));
        }

        if !thresholds.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(DisplayError::BadTable("temperature bounds not ascending"));
        }

        if modes.is_empty() {
            return Err(DisplayError::BadTable("no modes"));
        }

        let range_count = thresholds.len() - 1;
        let mut kinds = Vec::with_capacity(modes.len());
        let mut waveforms = Vec::with_capacity(modes.len());

        for (kind, mode_waveforms) in modes {
            if mode_waveforms.len() != range_count {
                return Err(DisplayError::BadTable(
                    "mode does not cover every temperature range",
                ));
            }

            if mode_waveforms.iter().any(|waveform| waveform.is_empty()) {
                return Err(DisplayError::BadTable("waveform with no steps"));
            }

            kinds.push(kind);
            waveforms.push(mode_waveforms.into_iter().map(Arc::new).collect());
        }

        Ok(Self {
            thresholds: Arc::new(thresholds),
            kinds: Arc::new(kinds),
            waveforms: Arc::new(waveforms),
        })
    }

    pub fn mode_count(&self) -> usize {
        self.kinds.len()
    }

    /// Resolve a symbolic mode kind to its table index.
    pub fn mode_id(&self, kind: ModeKind) -> Option<ModeId> {
        self.kinds
            .iter()
            .position(|candidate| *candidate == kind)
            .map(|index| index as ModeId)
    }

    pub fn lookup(&self, mode: ModeId, temperature: i32) -> Result<Arc<Waveform>> {
        let mode_waveforms = self
            .waveforms
            .get(mode as usize)
            .ok_or(DisplayError::NoWaveform { mode, temperature })?;

        let range = self
            .thresholds
            .windows(2)
            .position(|pair| temperature >= pair[0] && temperature < pair[1])
            .ok_or(DisplayError::NoWaveform { mode, temperature })?;

        Ok(Arc::clone(&mode_waveforms[range]))
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::uniform_matrix;
    use super::*;

    fn two_mode_table() -> WaveformTable {
        let du: Waveform = vec![uniform_matrix(Phase::Black); 2];
        let gc16: Waveform = vec![uniform_matrix(Phase::White); 4];
        WaveformTable::new(
            vec![0, 20, 50],
            vec![
                (ModeKind::Du, vec![du.clone(), du]),
                (ModeKind::Gc16, vec![gc16.clone(), gc16]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn mode_id_resolves_listed_kinds() {
        let table = two_mode_table();
        assert_eq!(table.mode_id(ModeKind::Du), Some(0));
        assert_eq!(table.mode_id(ModeKind::Gc16), Some(1));
        assert_eq!(table.mode_id(ModeKind::A2), None);
    }

    #[test]
    fn lookup_selects_temperature_range() {
        let table = two_mode_table();
        assert_eq!(table.lookup(0, 0).unwrap().len(), 2);
        assert_eq!(table.lookup(0, 19).unwrap().len(), 2);
        assert_eq!(table.lookup(1, 20).unwrap().len(), 4);
        assert_eq!(table.lookup(1, 49).unwrap().len(), 4);
    }

    #[test]
    fn lookup_rejects_uncovered_temperature() {
        let table = two_mode_table();
        assert!(matches!(
            table.lookup(0, -1),
            Err(DisplayError::NoWaveform { .. })
        ));
        assert!(matches!(
            table.lookup(0, 50),
            Err(DisplayError::NoWaveform { .. })
        ));
        assert!(matches!(
            table.lookup(7, 25),
            Err(DisplayError::NoWaveform { .. })
        ));
    }

    #[test]
    fn new_rejects_inconsistent_tables() {
        let waveform: Waveform = vec![uniform_matrix(Phase::Black)];
        assert!(WaveformTable::new(vec![0], vec![(ModeKind::Du, vec![waveform.clone()])]).is_err());
        assert!(WaveformTable::new(
            vec![20, 0],
            vec![(ModeKind::Du, vec![waveform.clone()])]
        )
        .is_err());
        assert!(WaveformTable::new(vec![0, 50], vec![]).is_err());
        assert!(WaveformTable::new(
            vec![0, 20, 50],
            vec![(ModeKind::Du, vec![waveform])]
        )
        .is_err());
        assert!(WaveformTable::new(vec![0, 50], vec![(ModeKind::Du, vec![Vec::new()])]).is_err());
    }
}
