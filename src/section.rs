//! Metric sections and the metrics list
//!
//! A section is either a tempo or a meter. The metrics list owns all
//! sections in an order that is simultaneously by frame and by pulse among
//! active sections; the solver refuses edits that would break either
//! ordering.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::meter::MeterSection;
use crate::tempo::TempoSection;
use crate::FramePos;

/// Section ID, stable across clones of the metrics list
pub type SectionId = u64;

static NEXT_SECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_section_id() -> SectionId {
    NEXT_SECTION_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Which of a section's two positions is authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionLockStyle {
    /// The frame is authoritative; pulse is derived
    AudioTime,
    /// The pulse (or BBT) is authoritative; frame is derived
    MusicTime,
}

/// One entry of the metrics list
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Section {
    Tempo(TempoSection),
    Meter(MeterSection),
}

impl Section {
    pub fn id(&self) -> SectionId {
        match self {
            Section::Tempo(t) => t.id,
            Section::Meter(m) => m.id,
        }
    }

    pub fn is_tempo(&self) -> bool {
        matches!(self, Section::Tempo(_))
    }

    pub fn frame(&self) -> FramePos {
        match self {
            Section::Tempo(t) => t.frame,
            Section::Meter(m) => m.frame,
        }
    }

    pub fn pulse(&self) -> f64 {
        match self {
            Section::Tempo(t) => t.pulse,
            Section::Meter(m) => m.pulse,
        }
    }

    pub fn movable(&self) -> bool {
        match self {
            Section::Tempo(t) => t.movable,
            Section::Meter(m) => m.movable,
        }
    }

    pub fn position_lock_style(&self) -> PositionLockStyle {
        match self {
            Section::Tempo(t) => t.lock_style,
            Section::Meter(m) => m.lock_style,
        }
    }

    pub(crate) fn set_frame(&mut self, frame: FramePos) {
        match self {
            Section::Tempo(t) => t.frame = frame,
            Section::Meter(m) => m.frame = frame,
        }
    }

    pub fn as_tempo(&self) -> Option<&TempoSection> {
        match self {
            Section::Tempo(t) => Some(t),
            Section::Meter(_) => None,
        }
    }

    pub(crate) fn as_tempo_mut(&mut self) -> Option<&mut TempoSection> {
        match self {
            Section::Tempo(t) => Some(t),
            Section::Meter(_) => None,
        }
    }

    pub fn as_meter(&self) -> Option<&MeterSection> {
        match self {
            Section::Tempo(_) => None,
            Section::Meter(m) => Some(m),
        }
    }

    pub(crate) fn as_meter_mut(&mut self) -> Option<&mut MeterSection> {
        match self {
            Section::Tempo(_) => None,
            Section::Meter(m) => Some(m),
        }
    }
}

/// The ordered list of sections
pub type Metrics = Vec<Section>;

/// Sort by pulse. Used when musical positions are authoritative.
pub(crate) fn sort_by_pulse(metrics: &mut Metrics) {
    metrics.sort_by(|a, b| a.pulse().partial_cmp(&b.pulse()).unwrap_or(Ordering::Equal));
}

/// Sort by frame. Used when audio positions are authoritative.
pub(crate) fn sort_by_frame(metrics: &mut Metrics) {
    metrics.sort_by(|a, b| a.frame().cmp(&b.frame()));
}

/// Index of the section with the given id
pub(crate) fn find_section(metrics: &Metrics, id: SectionId) -> Option<usize> {
    metrics.iter().position(|s| s.id() == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::Meter;
    use crate::tempo::{Tempo, TempoType};
    use crate::Bbt;

    fn tempo_at(pulse: f64, frame: FramePos) -> Section {
        Section::Tempo(TempoSection::new(
            pulse,
            frame,
            Tempo::DEFAULT,
            TempoType::Constant,
            PositionLockStyle::AudioTime,
        ))
    }

    fn meter_at(pulse: f64, frame: FramePos) -> Section {
        Section::Meter(MeterSection::new(
            pulse,
            frame,
            0.0,
            Bbt::default(),
            Meter::DEFAULT,
            PositionLockStyle::AudioTime,
        ))
    }

    #[test]
    fn test_sort_orders() {
        let mut metrics = vec![tempo_at(3.0, 100), meter_at(1.0, 300), tempo_at(2.0, 200)];

        sort_by_pulse(&mut metrics);
        assert_eq!(metrics[0].pulse(), 1.0);
        assert_eq!(metrics[2].pulse(), 3.0);

        sort_by_frame(&mut metrics);
        assert_eq!(metrics[0].frame(), 100);
        assert_eq!(metrics[2].frame(), 300);
    }

    #[test]
    fn test_find_section_by_id() {
        let metrics = vec![tempo_at(0.0, 0), meter_at(0.0, 0)];
        let id = metrics[1].id();
        assert_eq!(find_section(&metrics, id), Some(1));
        assert_eq!(find_section(&metrics, u64::MAX), None);
    }

    #[test]
    fn test_ids_are_unique_and_survive_clone() {
        let a = tempo_at(0.0, 0);
        let b = tempo_at(0.0, 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());
        assert_eq!(a.id(), a.clone().id());
    }
}
