//! Meter values and meter sections
//!
//! Meters divide the pulse into bars and beats: `divisions_per_bar`
//! divisions to a bar, each division being one `note_divisor`-th of a
//! whole pulse.

use serde::{Deserialize, Serialize};

use crate::section::{next_section_id, PositionLockStyle, SectionId};
use crate::tempo::Tempo;
use crate::{Bbt, FrameCnt, FramePos};

/// An immutable meter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    divisions_per_bar: f64,
    note_divisor: f64,
}

impl Meter {
    /// Session default (4/4)
    pub const DEFAULT: Self = Self {
        divisions_per_bar: 4.0,
        note_divisor: 4.0,
    };

    pub fn new(divisions_per_bar: f64, note_divisor: f64) -> Self {
        Self {
            divisions_per_bar,
            note_divisor,
        }
    }

    pub fn divisions_per_bar(&self) -> f64 {
        self.divisions_per_bar
    }

    pub fn note_divisor(&self) -> f64 {
        self.note_divisor
    }

    /// Interval in frames between two adjacent grid lines under this meter
    /// and the given tempo. The result is tempo- and meter-sensitive and is
    /// not interpretable in terms of beats.
    pub fn frames_per_grid(&self, tempo: &Tempo, frame_rate: FrameCnt) -> f64 {
        (60.0 * frame_rate as f64)
            / (tempo.beats_per_minute() * (self.note_divisor / tempo.note_type()))
    }

    /// Frames of one bar under this meter and the given tempo
    pub fn frames_per_bar(&self, tempo: &Tempo, frame_rate: FrameCnt) -> f64 {
        self.frames_per_grid(tempo, frame_rate) * self.divisions_per_bar
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A meter anchored at a (pulse, frame, beat, bbt) quadruple. The bbt of a
/// meter always falls on the first beat of a bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSection {
    pub(crate) id: SectionId,
    pub(crate) meter: Meter,
    pub(crate) pulse: f64,
    pub(crate) frame: FramePos,
    pub(crate) beat: f64,
    pub(crate) bbt: Bbt,
    pub(crate) lock_style: PositionLockStyle,
    pub(crate) movable: bool,
}

impl MeterSection {
    pub fn new(
        pulse: f64,
        frame: FramePos,
        beat: f64,
        bbt: Bbt,
        meter: Meter,
        lock_style: PositionLockStyle,
    ) -> Self {
        Self {
            id: next_section_id(),
            meter,
            pulse,
            frame,
            beat,
            bbt,
            lock_style,
            movable: true,
        }
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn meter(&self) -> Meter {
        self.meter
    }

    pub fn divisions_per_bar(&self) -> f64 {
        self.meter.divisions_per_bar()
    }

    pub fn note_divisor(&self) -> f64 {
        self.meter.note_divisor()
    }

    pub fn pulse(&self) -> f64 {
        self.pulse
    }

    pub fn frame(&self) -> FramePos {
        self.frame
    }

    pub fn beat(&self) -> f64 {
        self.beat
    }

    pub fn bbt(&self) -> Bbt {
        self.bbt
    }

    pub fn position_lock_style(&self) -> PositionLockStyle {
        self.lock_style
    }

    pub fn movable(&self) -> bool {
        self.movable
    }

    pub(crate) fn set_beat(&mut self, beat: f64, bbt: Bbt) {
        self.beat = beat;
        self.bbt = bbt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_per_grid_and_bar() {
        let meter = Meter::new(4.0, 4.0);
        let tempo = Tempo::new(120.0, 4.0);
        assert_eq!(meter.frames_per_grid(&tempo, 48000), 24000.0);
        assert_eq!(meter.frames_per_bar(&tempo, 48000), 96000.0);
    }

    #[test]
    fn test_grid_respects_note_type_ratio() {
        // 6/8 against an eighth-note tempo: one grid line per division
        let meter = Meter::new(6.0, 8.0);
        let tempo = Tempo::new(120.0, 8.0);
        assert_eq!(meter.frames_per_grid(&tempo, 48000), 24000.0);
        assert_eq!(meter.frames_per_bar(&tempo, 48000), 144000.0);
    }
}
