//! Persisted form of the tempo map
//!
//! Each section serialises to a small attributed record. Legacy sessions
//! positioned sections with a bare `start` BBT instead of a pulse; those
//! are promoted by a one-pass fix-up before the first recompute. Loads
//! are all-or-nothing: any bad record aborts the load and the previous
//! map is kept.

use serde::{Deserialize, Serialize};

use crate::bbt::TICKS_PER_BEAT;
use crate::map::{recompute_map, TempoMap};
use crate::meter::{Meter, MeterSection};
use crate::section::{sort_by_pulse, Metrics, PositionLockStyle, Section};
use crate::tempo::{Tempo, TempoSection, TempoType};
use crate::{Bbt, FramePos, TactusError, TactusResult};

fn default_true() -> bool {
    true
}

fn default_note_type() -> f64 {
    4.0
}

/// Persisted tempo section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<f64>,
    #[serde(default)]
    pub frame: FramePos,
    #[serde(rename = "beats-per-minute")]
    pub beats_per_minute: f64,
    #[serde(rename = "note-type", default = "default_note_type")]
    pub note_type: f64,
    pub movable: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(rename = "tempo-type", default)]
    pub tempo_type: TempoType,
    #[serde(rename = "lock-style", default, skip_serializing_if = "Option::is_none")]
    pub lock_style: Option<PositionLockStyle>,
    #[serde(rename = "locked-to-meter", default)]
    pub locked_to_meter: bool,
    /// Legacy position, a bare BBT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Bbt>,
}

impl TempoRecord {
    fn to_section(&self) -> TactusResult<TempoSection> {
        if !(self.beats_per_minute > 0.0) {
            return Err(TactusError::Construction(format!(
                "tempo record has an illegal \"beats-per-minute\" value ({})",
                self.beats_per_minute
            )));
        }
        if !(self.note_type >= 1.0) {
            return Err(TactusError::Construction(format!(
                "tempo record has an illegal \"note-type\" value ({})",
                self.note_type
            )));
        }

        let lock_style = self.lock_style.unwrap_or(if self.movable {
            PositionLockStyle::MusicTime
        } else {
            PositionLockStyle::AudioTime
        });

        // a record positioned only by a start BBT is a legacy session
        let (pulse, legacy_bbt) = match (self.pulse, self.start) {
            (Some(p), _) => (p, None),
            (None, Some(start)) => (-1.0, Some(start)),
            (None, None) => (0.0, None),
        };

        let mut t = TempoSection::new(
            pulse,
            self.frame,
            Tempo::new(self.beats_per_minute, self.note_type),
            self.tempo_type,
            lock_style,
        );
        t.movable = self.movable;
        t.active = self.active;
        t.locked_to_meter = self.locked_to_meter;
        t.legacy_bbt = legacy_bbt;
        Ok(t)
    }

    fn from_section(t: &TempoSection) -> Self {
        Self {
            pulse: Some(t.pulse()),
            frame: t.frame(),
            beats_per_minute: t.beats_per_minute(),
            note_type: t.note_type(),
            movable: t.movable(),
            active: t.active(),
            tempo_type: t.tempo_type(),
            lock_style: Some(t.position_lock_style()),
            locked_to_meter: t.locked_to_meter(),
            start: None,
        }
    }
}

/// Persisted meter section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<f64>,
    #[serde(default)]
    pub beat: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbt: Option<Bbt>,
    #[serde(default)]
    pub frame: FramePos,
    #[serde(rename = "divisions-per-bar", alias = "beats-per-bar")]
    pub divisions_per_bar: f64,
    #[serde(rename = "note-type")]
    pub note_type: f64,
    pub movable: bool,
    #[serde(rename = "lock-style", default, skip_serializing_if = "Option::is_none")]
    pub lock_style: Option<PositionLockStyle>,
    /// Legacy position, a bare BBT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Bbt>,
}

impl MeterRecord {
    fn to_section(&self) -> TactusResult<MeterSection> {
        if !(self.divisions_per_bar > 0.0) {
            return Err(TactusError::Construction(format!(
                "meter record has an illegal \"divisions-per-bar\" value ({})",
                self.divisions_per_bar
            )));
        }
        if !(self.note_type >= 1.0) {
            return Err(TactusError::Construction(format!(
                "meter record has an illegal \"note-type\" value ({})",
                self.note_type
            )));
        }

        let bbt = match self.bbt.or(self.start) {
            Some(bbt) => bbt,
            None => {
                return Err(TactusError::Construction(
                    "meter record has no \"bbt\" property".to_string(),
                ))
            }
        };

        let lock_style = self.lock_style.unwrap_or(if self.movable {
            PositionLockStyle::MusicTime
        } else {
            PositionLockStyle::AudioTime
        });

        let pulse = match (self.pulse, self.start) {
            (Some(p), _) => p,
            (None, Some(_)) => -1.0,
            (None, None) => 0.0,
        };

        let mut m = MeterSection::new(
            pulse,
            self.frame,
            self.beat,
            bbt,
            Meter::new(self.divisions_per_bar, self.note_type),
            lock_style,
        );
        m.movable = self.movable;
        Ok(m)
    }

    fn from_section(m: &MeterSection) -> Self {
        Self {
            pulse: Some(m.pulse()),
            beat: m.beat(),
            bbt: Some(m.bbt()),
            frame: m.frame(),
            divisions_per_bar: m.divisions_per_bar(),
            note_type: m.note_divisor(),
            movable: m.movable(),
            lock_style: Some(m.position_lock_style()),
            start: None,
        }
    }
}

/// One persisted section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "lowercase")]
pub enum SectionRecord {
    Tempo(TempoRecord),
    Meter(MeterRecord),
}

/// The persisted tempo map: the ordered section records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMapState {
    pub sections: Vec<SectionRecord>,
}

impl TempoMap {
    /// Snapshot the map as persisted records
    pub fn get_state(&self) -> TempoMapState {
        let metrics = self.metrics.read();
        TempoMapState {
            sections: metrics
                .iter()
                .map(|s| match s {
                    Section::Tempo(t) => SectionRecord::Tempo(TempoRecord::from_section(t)),
                    Section::Meter(m) => SectionRecord::Meter(MeterRecord::from_section(m)),
                })
                .collect(),
        }
    }

    /// Replace the whole map from persisted records. All-or-nothing: on
    /// any error the previous map is untouched.
    pub fn set_state(&self, state: &TempoMapState) -> TactusResult<()> {
        let mut new_metrics: Metrics = Vec::with_capacity(state.sections.len());

        for record in &state.sections {
            match record {
                SectionRecord::Tempo(r) => new_metrics.push(Section::Tempo(r.to_section()?)),
                SectionRecord::Meter(r) => new_metrics.push(Section::Meter(r.to_section()?)),
            }
        }

        if !new_metrics.iter().any(|s| s.is_tempo()) {
            return Err(TactusError::Construction(
                "no tempo section in tempo map".to_string(),
            ));
        }
        if !new_metrics.iter().any(|s| !s.is_tempo()) {
            return Err(TactusError::Construction(
                "no meter section in tempo map".to_string(),
            ));
        }

        sort_by_pulse(&mut new_metrics);

        // legacy sessions used bbt as the base musical unit
        let legacy = new_metrics.iter().any(|s| match s {
            Section::Tempo(t) => t.legacy_bbt.is_some(),
            Section::Meter(m) => m.pulse() < 0.0,
        });
        if legacy {
            log::info!("Legacy session detected; promoting bbt-positioned sections.");
            fix_legacy_map(&mut new_metrics);
        }

        // multiple tempi or meters at the same position used to be possible
        for pair in new_metrics.windows(2) {
            match (&pair[0], &pair[1]) {
                (Section::Tempo(a), Section::Tempo(b)) if a.pulse() == b.pulse() => {
                    return Err(TactusError::DuplicatePosition {
                        kind: "tempo",
                        pulse: a.pulse(),
                    });
                }
                (Section::Meter(a), Section::Meter(b)) if a.pulse() == b.pulse() => {
                    return Err(TactusError::DuplicatePosition {
                        kind: "meter",
                        pulse: a.pulse(),
                    });
                }
                _ => {}
            }
        }

        recompute_map(&mut new_metrics, self.frame_rate());

        *self.metrics.write() = new_metrics;
        self.notify();
        Ok(())
    }
}

/// Promote a legacy metrics list whose musical positions were bare BBTs
fn fix_legacy_map(metrics: &mut Metrics) {
    let mut prev_m: Option<MeterSection> = None;
    let mut seen_tempo = false;

    for i in 0..metrics.len() {
        match metrics[i] {
            Section::Meter(mut m) => {
                if !m.movable() {
                    m.set_beat(0.0, Bbt::default());
                    m.pulse = 0.0;
                    m.frame = 0;
                    m.lock_style = PositionLockStyle::AudioTime;
                } else if let Some(pm) = prev_m {
                    let beat = (m.bbt().bars as f64 - 1.0) * pm.note_divisor()
                        + (m.bbt().beats as f64 - 1.0)
                        + m.bbt().ticks as f64 / TICKS_PER_BEAT;
                    let bbt = m.bbt();
                    m.set_beat(beat, bbt);
                    m.pulse = beat / pm.note_divisor();
                }
                if let Some(slot) = metrics[i].as_meter_mut() {
                    *slot = m;
                }
                prev_m = Some(m);
            }
            Section::Tempo(mut t) => {
                if !t.active() {
                    continue;
                }
                if !t.movable() {
                    t.pulse = 0.0;
                    t.frame = 0;
                    t.lock_style = PositionLockStyle::AudioTime;
                } else if seen_tempo {
                    if let Some(legacy) = t.legacy_bbt {
                        let note_divisor = prev_m.map(|m| m.note_divisor()).unwrap_or(4.0);
                        let beat = (legacy.bars as f64 - 1.0) * note_divisor
                            + (legacy.beats as f64 - 1.0)
                            + legacy.ticks as f64 / TICKS_PER_BEAT;
                        t.pulse = beat / note_divisor;
                    }
                }
                t.legacy_bbt = None;
                if let Some(slot) = metrics[i].as_tempo_mut() {
                    *slot = t;
                }
                seen_tempo = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameCnt;

    const SR: FrameCnt = 48000;

    fn double_tempo_map() -> TempoMap {
        let map = TempoMap::new(SR);
        map.replace_tempo(
            map.first_tempo().id(),
            Tempo::new(120.0, 4.0),
            0.0,
            0,
            TempoType::Constant,
            PositionLockStyle::AudioTime,
        );
        map.add_tempo(
            Tempo::new(240.0, 4.0),
            3.0,
            0,
            TempoType::Constant,
            PositionLockStyle::MusicTime,
        );
        map
    }

    #[test]
    fn test_state_roundtrip_through_json() {
        let map = double_tempo_map();
        let state = map.get_state();

        let json = serde_json::to_string(&state).unwrap();
        let parsed: TempoMapState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);

        let restored = TempoMap::new(SR);
        restored.set_state(&parsed).unwrap();
        assert_eq!(restored.get_state(), state);
        assert_eq!(restored.frame_at_beat(13.0), 300_000);
    }

    #[test]
    fn test_record_defaults() {
        let json = r#"{
            "section": "tempo",
            "pulse": 0.0,
            "frame": 0,
            "beats-per-minute": 120.0,
            "movable": false
        }"#;
        let record: SectionRecord = serde_json::from_str(json).unwrap();
        match record {
            SectionRecord::Tempo(t) => {
                assert_eq!(t.note_type, 4.0);
                assert!(t.active);
                assert_eq!(t.tempo_type, TempoType::Constant);
                assert!(!t.locked_to_meter);
                // lock style defaults from movable at construction
                let section = t.to_section().unwrap();
                assert_eq!(section.position_lock_style(), PositionLockStyle::AudioTime);
            }
            SectionRecord::Meter(_) => panic!("expected a tempo record"),
        }
    }

    #[test]
    fn test_meter_accepts_legacy_beats_per_bar_key() {
        let json = r#"{
            "section": "meter",
            "pulse": 0.0,
            "beat": 0.0,
            "bbt": "1|1|0",
            "frame": 0,
            "beats-per-bar": 3.0,
            "note-type": 4.0,
            "movable": false
        }"#;
        let record: SectionRecord = serde_json::from_str(json).unwrap();
        match record {
            SectionRecord::Meter(m) => assert_eq!(m.divisions_per_bar, 3.0),
            SectionRecord::Tempo(_) => panic!("expected a meter record"),
        }
    }

    #[test]
    fn test_out_of_range_record_aborts_load() {
        let map = double_tempo_map();
        let before = map.get_state();

        let mut state = before.clone();
        if let Some(SectionRecord::Tempo(t)) = state
            .sections
            .iter_mut()
            .find(|s| matches!(s, SectionRecord::Tempo(_)))
        {
            t.beats_per_minute = -10.0;
        }

        assert!(matches!(
            map.set_state(&state),
            Err(TactusError::Construction(_))
        ));
        assert_eq!(map.get_state(), before);
    }

    #[test]
    fn test_duplicate_positions_abort_load() {
        let map = double_tempo_map();
        let before = map.get_state();

        let mut state = before.clone();
        let dup = state
            .sections
            .iter()
            .find(|s| matches!(s, SectionRecord::Tempo(t) if t.movable))
            .cloned()
            .unwrap();
        state.sections.push(dup);

        assert!(matches!(
            map.set_state(&state),
            Err(TactusError::DuplicatePosition { kind: "tempo", .. })
        ));
        assert_eq!(map.get_state(), before);
    }

    #[test]
    fn test_legacy_start_records_are_promoted() {
        let state = TempoMapState {
            sections: vec![
                SectionRecord::Tempo(TempoRecord {
                    pulse: None,
                    frame: 0,
                    beats_per_minute: 120.0,
                    note_type: 4.0,
                    movable: false,
                    active: true,
                    tempo_type: TempoType::Constant,
                    lock_style: None,
                    locked_to_meter: false,
                    start: Some(Bbt::new(1, 1, 0)),
                }),
                SectionRecord::Meter(MeterRecord {
                    pulse: None,
                    beat: 0.0,
                    bbt: None,
                    frame: 0,
                    divisions_per_bar: 4.0,
                    note_type: 4.0,
                    movable: false,
                    lock_style: None,
                    start: Some(Bbt::new(1, 1, 0)),
                }),
                SectionRecord::Tempo(TempoRecord {
                    pulse: None,
                    frame: 0,
                    beats_per_minute: 240.0,
                    note_type: 4.0,
                    movable: true,
                    active: true,
                    tempo_type: TempoType::Constant,
                    lock_style: None,
                    locked_to_meter: false,
                    start: Some(Bbt::new(4, 1, 0)),
                }),
            ],
        };

        let map = TempoMap::new(SR);
        map.set_state(&state).unwrap();

        // bar 4 under 4/4 is beat 12, pulse 3; at 120 bpm that is 288e3
        let second = map
            .sections()
            .iter()
            .filter_map(|s| s.as_tempo().copied())
            .find(|t| t.movable())
            .unwrap();
        assert_eq!(second.pulse(), 3.0);
        assert_eq!(second.frame(), 288_000);
    }

    #[test]
    fn test_missing_meter_aborts_load() {
        let map = TempoMap::new(SR);
        let before = map.get_state();

        let state = TempoMapState {
            sections: vec![SectionRecord::Tempo(TempoRecord {
                pulse: Some(0.0),
                frame: 0,
                beats_per_minute: 120.0,
                note_type: 4.0,
                movable: false,
                active: true,
                tempo_type: TempoType::Constant,
                lock_style: None,
                locked_to_meter: false,
                start: None,
            })],
        };

        assert!(map.set_state(&state).is_err());
        assert_eq!(map.get_state(), before);
    }
}
