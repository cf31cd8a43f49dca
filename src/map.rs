//! The tempo map
//!
//! Tempo is the rate of the musical pulse. Meters divide the pulses into
//! measures and beats. Tempo sections provide pulses via
//! `beats_per_minute` and `note_type`; meter sections divide pulses into
//! measures (via `divisions_per_bar`) and beats (via `note_divisor`).
//!
//! Both kinds of section carry a pulse position and a frame position, and
//! may be locked to either audio or music. The lock style determines the
//! authoritative position of the section, from which the other position
//! is derived. The first tempo and first meter are special: they move
//! together and are locked to audio. Audio-locked tempi that lie before
//! the first meter are made inactive, and re-activated if the first meter
//! is again placed after them.
//!
//! Because tempo sections can be ramped, meters map beats to whole pulses
//! without involving the tempo curve: every meter falls on a known pulse
//! derived from its bar, and the pulse distance between two meters is
//! `(bars_between) * divisions_per_bar / note_divisor`.
//!
//! Recomputing the map derives the missing position of every section
//! (pulse for audio-locked sections, frame for music-locked) and refits
//! every ramp constant in one forward pass. Edits go through the solver,
//! which proposes the change on a scratch copy and applies it to the live
//! list only if the copy checks out as solved.
//!
//! The map owns a readers-writer lock. Queries take a read lease, every
//! mutator takes the write lease and publishes only solved states, so no
//! reader ever observes a torn metrics list. The `*_rt` query variants
//! fail fast on lock contention instead of blocking the audio thread.

use std::fmt::Write as _;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::meter::{Meter, MeterSection};
use crate::query::{
    beat_at_bbt_locked, bbt_from_beat_offset, frame_at_pulse_locked,
    meter_section_at_frame_locked, pulse_at_beat_locked, tempo_at_frame_locked,
};
use crate::section::{find_section, Metrics, PositionLockStyle, Section, SectionId};
use crate::solver::{solve_map_meter_bbt, solve_map_meter_frame, solve_map_tempo_frame, solve_map_tempo_pulse};
use crate::tempo::{Tempo, TempoSection, TempoType};
use crate::{Bbt, FrameCnt, FramePos, TICKS_PER_BEAT};

/// Notification sent to subscribers after every successful mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapChanged;

/// A tempo map: the ordered tempo and meter sections of a session, plus
/// conversions between frames, pulses, beats and BBT under them
pub struct TempoMap {
    pub(crate) metrics: RwLock<Metrics>,
    frame_rate: FrameCnt,
    subscribers: Mutex<Vec<Sender<MapChanged>>>,
}

impl TempoMap {
    /// A fresh map at the default tempo and meter, both pinned to frame 0
    pub fn new(frame_rate: FrameCnt) -> Self {
        let mut t = TempoSection::new(
            0.0,
            0,
            Tempo::DEFAULT,
            TempoType::Ramp,
            PositionLockStyle::AudioTime,
        );
        t.movable = false;
        let mut m = MeterSection::new(
            0.0,
            0,
            0.0,
            Bbt::default(),
            Meter::DEFAULT,
            PositionLockStyle::AudioTime,
        );
        m.movable = false;

        // frame time is correct (zero) for both of these
        Self {
            metrics: RwLock::new(vec![Section::Tempo(t), Section::Meter(m)]),
            frame_rate,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn frame_rate(&self) -> FrameCnt {
        self.frame_rate
    }

    /// Subscribe to change notifications. One [`MapChanged`] is delivered
    /// per successful mutation.
    pub fn subscribe(&self) -> Receiver<MapChanged> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn notify(&self) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(MapChanged).is_ok());
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn n_tempos(&self) -> usize {
        self.metrics.read().iter().filter(|s| s.is_tempo()).count()
    }

    pub fn n_meters(&self) -> usize {
        self.metrics.read().iter().filter(|s| !s.is_tempo()).count()
    }

    /// Snapshot of the metrics list in order
    pub fn sections(&self) -> Vec<Section> {
        self.metrics.read().clone()
    }

    /// The non-movable tempo section
    pub fn first_tempo(&self) -> TempoSection {
        let metrics = self.metrics.read();
        first_tempo(&metrics)
    }

    /// The non-movable meter section
    pub fn first_meter(&self) -> MeterSection {
        let metrics = self.metrics.read();
        first_meter(&metrics)
    }

    /// Last active tempo section at or before the frame
    pub fn tempo_section_at_frame(&self, frame: FramePos) -> TempoSection {
        let metrics = self.metrics.read();
        crate::query::tempo_section_at_frame_locked(&metrics, frame)
    }

    /// Last meter section at or before the frame
    pub fn meter_section_at_frame(&self, frame: FramePos) -> MeterSection {
        let metrics = self.metrics.read();
        meter_section_at_frame_locked(&metrics, frame)
    }

    /// Last meter section at or before the beat
    pub fn meter_section_at_beat(&self, beat: f64) -> MeterSection {
        let metrics = self.metrics.read();
        crate::query::meter_section_at_beat_locked(&metrics, beat)
    }

    /// Meter value in effect at the frame
    pub fn meter_at_frame(&self, frame: FramePos) -> Meter {
        self.meter_section_at_frame(frame).meter()
    }

    /// Human-readable dump of the metrics list, for diagnostics
    pub fn dump(&self) -> String {
        let metrics = self.metrics.read();
        let mut out = String::new();
        for s in metrics.iter() {
            match s {
                Section::Tempo(t) => {
                    let _ = writeln!(
                        out,
                        "Tempo {} BPM (pulse = 1/{}) at pulse {} frame {} (movable? {}) {:?} c {}",
                        t.beats_per_minute(),
                        t.note_type(),
                        t.pulse(),
                        t.frame(),
                        t.movable(),
                        t.position_lock_style(),
                        t.c_func(),
                    );
                }
                Section::Meter(m) => {
                    let _ = writeln!(
                        out,
                        "Meter {}/{} at {} frame {} pulse {} beat {} {:?} (movable? {})",
                        m.divisions_per_bar(),
                        m.note_divisor(),
                        m.bbt(),
                        m.frame(),
                        m.pulse(),
                        m.beat(),
                        m.position_lock_style(),
                        m.movable(),
                    );
                }
            }
        }
        out
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Structural edits
    // ─────────────────────────────────────────────────────────────────────────────

    /// Add a tempo section. The authoritative position is `pulse` for
    /// MusicTime, `frame` for AudioTime.
    pub fn add_tempo(
        &self,
        tempo: Tempo,
        pulse: f64,
        frame: FramePos,
        ty: TempoType,
        pls: PositionLockStyle,
    ) -> SectionId {
        let id = {
            let mut metrics = self.metrics.write();
            add_tempo_locked(
                &mut metrics,
                self.frame_rate,
                tempo,
                pulse,
                frame,
                ty,
                pls,
                true,
                false,
            )
        };
        self.notify();
        id
    }

    /// Replace a tempo section wholesale. The non-movable section cannot
    /// be removed, so replacing it overwrites its tempo in place.
    pub fn replace_tempo(
        &self,
        id: SectionId,
        tempo: Tempo,
        pulse: f64,
        frame: FramePos,
        ty: TempoType,
        pls: PositionLockStyle,
    ) {
        {
            let mut metrics = self.metrics.write();
            let first_id = first_tempo(&metrics).id();
            if id != first_id {
                let locked_to_meter = find_section(&metrics, id)
                    .and_then(|i| metrics[i].as_tempo().map(|t| t.locked_to_meter()))
                    .unwrap_or(false);
                remove_tempo_locked(&mut metrics, id);
                add_tempo_locked(
                    &mut metrics,
                    self.frame_rate,
                    tempo,
                    pulse,
                    frame,
                    ty,
                    pls,
                    true,
                    locked_to_meter,
                );
            } else if let Some(i) = find_section(&metrics, first_id) {
                // cannot move the first tempo section
                if let Some(first) = metrics[i].as_tempo_mut() {
                    first.ty = ty;
                    first.pulse = 0.0;
                    first.frame = frame;
                    first.lock_style = PositionLockStyle::AudioTime;
                    first.tempo = tempo;
                }
                recompute_map(&mut metrics, self.frame_rate);
            }
        }
        self.notify();
    }

    /// Remove a movable tempo section. Returns false if the section was
    /// not found or is not movable.
    pub fn remove_tempo(&self, id: SectionId) -> bool {
        let removed = {
            let mut metrics = self.metrics.write();
            let removed = remove_tempo_locked(&mut metrics, id);
            if removed {
                recompute_map(&mut metrics, self.frame_rate);
            }
            removed
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Add a meter section at the given bar. An AudioTime meter also gets
    /// a companion tempo locked to it at the same frame.
    pub fn add_meter(
        &self,
        meter: Meter,
        beat: f64,
        bbt: Bbt,
        frame: FramePos,
        pls: PositionLockStyle,
    ) -> SectionId {
        let id = {
            let mut metrics = self.metrics.write();
            add_meter_locked(
                &mut metrics,
                self.frame_rate,
                meter,
                beat,
                bbt,
                frame,
                pls,
                true,
            )
        };
        self.notify();
        id
    }

    /// Replace a meter section wholesale. The non-movable meter cannot be
    /// removed, so replacing it overwrites its value in place and drags
    /// the first tempo with it.
    pub fn replace_meter(
        &self,
        id: SectionId,
        meter: Meter,
        bbt: Bbt,
        frame: FramePos,
        pls: PositionLockStyle,
    ) {
        {
            let mut metrics = self.metrics.write();
            let beat = beat_at_bbt_locked(&metrics, bbt);
            let movable = find_section(&metrics, id)
                .map(|i| metrics[i].movable())
                .unwrap_or(false);

            if movable {
                remove_meter_locked(&mut metrics, id);
                add_meter_locked(
                    &mut metrics,
                    self.frame_rate,
                    meter,
                    beat,
                    bbt,
                    frame,
                    pls,
                    true,
                );
            } else {
                // cannot move the first meter section
                let first_id = first_meter(&metrics).id();
                if let Some(i) = find_section(&metrics, first_id) {
                    if let Some(first) = metrics[i].as_meter_mut() {
                        first.meter = meter;
                        first.lock_style = PositionLockStyle::AudioTime;
                        first.pulse = 0.0;
                        first.frame = frame;
                        first.set_beat(0.0, Bbt::default());
                    }
                }
                let first_t_id = first_tempo(&metrics).id();
                if let Some(i) = find_section(&metrics, first_t_id) {
                    if let Some(first_t) = metrics[i].as_tempo_mut() {
                        first_t.frame = frame;
                        first_t.pulse = 0.0;
                        first_t.lock_style = PositionLockStyle::AudioTime;
                    }
                }
                recompute_map(&mut metrics, self.frame_rate);
            }
        }
        self.notify();
    }

    /// Remove a movable meter section, along with its meter-locked tempo
    /// when audio-locked
    pub fn remove_meter(&self, id: SectionId) -> bool {
        let removed = {
            let mut metrics = self.metrics.write();
            let removed = remove_meter_locked(&mut metrics, id);
            if removed {
                recompute_map(&mut metrics, self.frame_rate);
            }
            removed
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Replace the tempo of the first active section, keeping position
    pub fn change_initial_tempo(&self, beats_per_minute: f64, note_type: f64) {
        let newtempo = Tempo::new(beats_per_minute, note_type);
        let changed = {
            let mut metrics = self.metrics.write();
            let first = metrics
                .iter()
                .position(|s| matches!(s, Section::Tempo(t) if t.active()));
            match first {
                Some(i) => {
                    if let Some(t) = metrics[i].as_tempo_mut() {
                        t.tempo = newtempo;
                    }
                    recompute_map(&mut metrics, self.frame_rate);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Replace the tempo of the section in effect at `where`, keeping
    /// position
    pub fn change_existing_tempo_at(&self, frame: FramePos, beats_per_minute: f64, note_type: f64) {
        let newtempo = Tempo::new(beats_per_minute, note_type);
        let changed = {
            let mut metrics = self.metrics.write();

            let mut first: Option<usize> = None;
            let mut prev: Option<usize> = None;
            for (i, s) in metrics.iter().enumerate() {
                if s.frame() > frame {
                    break;
                }
                if let Section::Tempo(t) = s {
                    if !t.active() {
                        continue;
                    }
                    if first.is_none() {
                        first = Some(i);
                    }
                    prev = Some(i);
                }
            }

            let target = prev.or(first);
            match target {
                Some(i) => {
                    if let Some(t) = metrics[i].as_tempo_mut() {
                        t.tempo = newtempo;
                    }
                    recompute_map(&mut metrics, self.frame_rate);
                    true
                }
                None => {
                    log::error!("no tempo sections defined in tempo map - cannot change tempo @ {frame}");
                    false
                }
            }
        };
        if changed {
            self.notify();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Bulk operations
    // ─────────────────────────────────────────────────────────────────────────────

    /// Shift every movable section at or after `where` later by `amount`
    /// frames, re-timestamping their musical positions from the new audio
    /// positions
    pub fn insert_time(&self, frame: FramePos, amount: FramePos) {
        {
            let mut metrics = self.metrics.write();
            for s in metrics.iter_mut() {
                if s.frame() >= frame && s.movable() {
                    let f = s.frame();
                    s.set_frame(f + amount);
                }
            }

            // reset the musical position of every movable metric from its
            // new audio position, walking forward so each section is
            // timestamped against its already-updated predecessors; this
            // is the only place this reverse timestamp happens
            let mut prev_t_i: Option<usize> = None;
            let mut prev_m_i: Option<usize> = None;
            let mut first_meter_seen = false;
            for i in 0..metrics.len() {
                match metrics[i] {
                    Section::Tempo(t) => {
                        if !t.active() {
                            continue;
                        }
                        if t.movable() {
                            if let Some(pi) = prev_t_i {
                                let pulse = metrics[pi]
                                    .as_tempo()
                                    .map(|p| p.pulse_at_frame(t.frame(), self.frame_rate))
                                    .unwrap_or(t.pulse());
                                if let Some(tm) = metrics[i].as_tempo_mut() {
                                    tm.pulse = pulse;
                                }
                            }
                        }
                        prev_t_i = Some(i);
                    }
                    Section::Meter(m) => {
                        if !m.movable() {
                            first_meter_seen = true;
                            prev_m_i = Some(i);
                            continue;
                        }
                        if let (Some(pi), Some(pmi)) = (prev_t_i, prev_m_i) {
                            let pm = match metrics[pmi].as_meter() {
                                Some(pm) => *pm,
                                None => continue,
                            };
                            let pulse = metrics[pi]
                                .as_tempo()
                                .map(|p| p.pulse_at_frame(m.frame(), self.frame_rate))
                                .unwrap_or(m.pulse());
                            let beat = pm.beat() + (pulse - pm.pulse()) * pm.note_divisor();
                            let mut bbt = bbt_from_beat_offset(&pm, beat - pm.beat());
                            if first_meter_seen {
                                // meters after the first land on the nearest bar
                                if bbt.ticks as f64 > TICKS_PER_BEAT / 2.0 {
                                    bbt.beats += 1;
                                }
                                bbt.ticks = 0;
                                if bbt.beats != 1 {
                                    bbt.bars += 1;
                                    bbt.beats = 1;
                                }
                            }
                            first_meter_seen = true;
                            if let Some(mm) = metrics[i].as_meter_mut() {
                                mm.set_beat(beat.max(0.0), bbt);
                                mm.pulse = pulse;
                            }
                        }
                        prev_m_i = Some(i);
                    }
                }
            }

            recompute_map(&mut metrics, self.frame_rate);
        }
        self.notify();
    }

    /// Remove `amount` frames of time starting at `where`. Sections inside
    /// the removed range are deleted, except that the last tempo and meter
    /// in effect are transplanted to `where` when nothing replaces them
    /// there. Returns true if anything moved.
    pub fn remove_time(&self, frame: FramePos, amount: FramePos) -> bool {
        let moved = {
            let mut metrics = self.metrics.write();
            let mut kill_ids: Vec<SectionId> = Vec::new();
            let mut last_tempo: Option<SectionId> = None;
            let mut last_meter: Option<SectionId> = None;
            let mut tempo_after = false;
            let mut meter_after = false;
            let mut moved = false;

            for s in metrics.iter_mut() {
                let id = s.id();
                let is_tempo = s.is_tempo();
                if s.frame() >= frame && s.frame() < frame + amount {
                    kill_ids.push(id);
                    if is_tempo {
                        last_tempo = Some(id);
                    } else {
                        last_meter = Some(id);
                    }
                } else if s.frame() >= frame {
                    let f = s.frame();
                    s.set_frame(f - amount);
                    if s.frame() == frame {
                        // marker was immediately after the end of the range
                        if is_tempo {
                            tempo_after = true;
                        } else {
                            meter_after = true;
                        }
                    }
                    moved = true;
                }
            }

            // transplant the last tempo and meter in effect to the cut
            // point so everything later stays correct
            if let Some(id) = last_tempo {
                if !tempo_after {
                    kill_ids.retain(|k| *k != id);
                    if let Some(i) = find_section(&metrics, id) {
                        metrics[i].set_frame(frame);
                    }
                    moved = true;
                }
            }
            if let Some(id) = last_meter {
                if !meter_after {
                    kill_ids.retain(|k| *k != id);
                    if let Some(i) = find_section(&metrics, id) {
                        metrics[i].set_frame(frame);
                    }
                    moved = true;
                }
            }

            if !kill_ids.is_empty() {
                metrics.retain(|s| !kill_ids.contains(&s.id()));
                moved = true;
            }

            if moved {
                recompute_map(&mut metrics, self.frame_rate);
            }
            moved
        };
        if moved {
            self.notify();
        }
        moved
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOCKED HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// The first (non-movable, active) tempo section
pub(crate) fn first_tempo(metrics: &Metrics) -> TempoSection {
    for s in metrics {
        if let Section::Tempo(t) = s {
            if t.active() && !t.movable() {
                return *t;
            }
        }
    }
    // the map is constructed with one; a fresh section only results from
    // querying an empty scratch list
    TempoSection::new(
        0.0,
        0,
        Tempo::DEFAULT,
        TempoType::Ramp,
        PositionLockStyle::AudioTime,
    )
}

/// The first meter section
pub(crate) fn first_meter(metrics: &Metrics) -> MeterSection {
    for s in metrics {
        if let Section::Meter(m) = s {
            return *m;
        }
    }
    MeterSection::new(
        0.0,
        0,
        0.0,
        Bbt::default(),
        Meter::DEFAULT,
        PositionLockStyle::AudioTime,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECOMPUTE
// ═══════════════════════════════════════════════════════════════════════════════

/// Forward pass over the tempo sections: refit each ramp constant from its
/// successor and derive each section's missing coordinate. The terminal
/// section gets `c = 0`.
pub(crate) fn recompute_tempi(metrics: &mut Metrics, frame_rate: FrameCnt) {
    let mut prev_i: Option<usize> = None;

    for i in 0..metrics.len() {
        let cur = match &metrics[i] {
            Section::Tempo(t) if t.active() => *t,
            _ => continue,
        };

        if !cur.movable() && prev_i.is_none() {
            if let Some(t) = metrics[i].as_tempo_mut() {
                t.pulse = 0.0;
            }
            prev_i = Some(i);
            continue;
        }

        if let Some(pi) = prev_i {
            let mut prev = match metrics[pi].as_tempo() {
                Some(p) => *p,
                None => continue,
            };
            let mut cur = cur;
            match cur.position_lock_style() {
                PositionLockStyle::AudioTime => {
                    prev.c = prev.compute_c_frame(cur.pulses_per_minute(), cur.frame(), frame_rate);
                    if !cur.locked_to_meter() {
                        cur.pulse =
                            prev.pulse_at_tempo(cur.pulses_per_minute(), cur.frame(), frame_rate);
                    }
                }
                PositionLockStyle::MusicTime => {
                    prev.c = prev.compute_c_pulse(cur.pulses_per_minute(), cur.pulse());
                    cur.frame =
                        prev.frame_at_tempo(cur.pulses_per_minute(), cur.pulse(), frame_rate);
                }
            }
            if let Some(p) = metrics[pi].as_tempo_mut() {
                *p = prev;
            }
            if let Some(c) = metrics[i].as_tempo_mut() {
                *c = cur;
            }
        }
        prev_i = Some(i);
    }

    if let Some(pi) = prev_i {
        if let Some(p) = metrics[pi].as_tempo_mut() {
            p.c = 0.0;
        }
    }
}

/// Forward pass over the meter sections. A meter's bbt is its base
/// position unit: an audio-locked meter needs its pulse and beat
/// recomputed (but not bbt), a music-locked meter needs frame, pulse and
/// beat recomputed (but not bbt).
pub(crate) fn recompute_meters(metrics: &mut Metrics, frame_rate: FrameCnt) {
    let mut prev_m_i: Option<usize> = None;

    for i in 0..metrics.len() {
        let mut m = match &metrics[i] {
            Section::Meter(m) => *m,
            _ => continue,
        };

        match m.position_lock_style() {
            PositionLockStyle::AudioTime => {
                let mut pulse = 0.0;
                let mut beat_bbt = (0.0, Bbt::default());
                let mlt_i = metrics.iter().position(|s| {
                    matches!(s, Section::Tempo(t)
                        if (t.locked_to_meter() || !t.movable()) && t.frame() == m.frame())
                });

                if let Some(pmi) = prev_m_i {
                    let pm = match metrics[pmi].as_meter() {
                        Some(pm) => *pm,
                        None => continue,
                    };
                    let beats =
                        (m.bbt().bars as f64 - pm.bbt().bars as f64) * pm.divisions_per_bar();
                    if beats + pm.beat() != m.beat() {
                        // reordering caused a bbt change
                        beat_bbt = (
                            beats + pm.beat(),
                            Bbt::new(
                                (beats / pm.divisions_per_bar()) as u32 + pm.bbt().bars,
                                1,
                                0,
                            ),
                        );
                        pulse = pm.pulse() + beats / pm.note_divisor();
                    } else if m.movable() {
                        beat_bbt = (m.beat(), m.bbt());
                        pulse = pm.pulse() + beats / pm.note_divisor();
                    }
                }

                if let Some(j) = mlt_i {
                    if let Some(t) = metrics[j].as_tempo_mut() {
                        t.pulse = pulse;
                    }
                }
                m.set_beat(beat_bbt.0, beat_bbt.1);
                m.pulse = pulse;
            }
            PositionLockStyle::MusicTime => {
                let pulse;
                let beat_bbt;
                if let Some(pmi) = prev_m_i {
                    let pm = match metrics[pmi].as_meter() {
                        Some(pm) => *pm,
                        None => continue,
                    };
                    let beats =
                        (m.bbt().bars as f64 - pm.bbt().bars as f64) * pm.divisions_per_bar();
                    if beats + pm.beat() != m.beat() {
                        // reordering caused a bbt change
                        beat_bbt = (
                            beats + pm.beat(),
                            Bbt::new(
                                (beats / pm.divisions_per_bar()) as u32 + pm.bbt().bars,
                                1,
                                0,
                            ),
                        );
                    } else {
                        beat_bbt = (beats + pm.beat(), m.bbt());
                    }
                    pulse = (beats / pm.note_divisor()) + pm.pulse();
                } else {
                    // the first meter is audio-locked, so this is a
                    // degenerate list
                    pulse = pulse_at_beat_locked(metrics, m.beat());
                    beat_bbt = (m.beat(), m.bbt());
                }

                m.set_beat(beat_bbt.0, beat_bbt.1);
                m.pulse = pulse;
                m.frame = frame_at_pulse_locked(metrics, frame_rate, pulse);
            }
        }

        if let Some(slot) = metrics[i].as_meter_mut() {
            *slot = m;
        }
        prev_m_i = Some(i);
    }
}

/// Full recompute: tempi first, then meters
pub(crate) fn recompute_map(metrics: &mut Metrics, frame_rate: FrameCnt) {
    recompute_tempi(metrics, frame_rate);
    recompute_meters(metrics, frame_rate);
}

// ═══════════════════════════════════════════════════════════════════════════════
// INSERTION AND REMOVAL
// ═══════════════════════════════════════════════════════════════════════════════

/// Insert a section at its ordered position, replacing any same-kind
/// section already in that position. Returns the id of the section that
/// ended up in the list (the existing non-movable one when the insert
/// amounts to overwriting it).
pub(crate) fn do_insert(metrics: &mut Metrics, section: Section) -> SectionId {
    let mut section = section;

    // new meters may only be inserted on beat 1 of an existing measure
    if let Section::Meter(m) = &mut section {
        if !m.bbt().is_bar_start() {
            let corrected = Bbt::new(m.bbt().bars, 1, 0);
            let corrected_beat = beat_at_bbt_locked(metrics, corrected);
            log::warn!(
                "Meter changes can only be positioned on the first beat of a bar. Moving from {} to {}",
                m.bbt(),
                corrected
            );
            m.set_beat(corrected_beat, corrected);
        }
    }

    let mut need_add = true;
    let mut ret_id = section.id();
    let mut remove_i: Option<usize> = None;

    // look for an existing section of the same kind in the same position
    for (i, s) in metrics.iter_mut().enumerate() {
        match (s, &section) {
            (Section::Tempo(t), Section::Tempo(ins)) => {
                let ipm = ins.position_lock_style() == PositionLockStyle::MusicTime;
                if (ipm && t.pulse() == ins.pulse()) || (!ipm && t.frame() == ins.frame()) {
                    if !t.movable() {
                        // can't (re)move this section, so overwrite its
                        // data content but not its properties as a section
                        t.tempo = ins.tempo();
                        t.ty = ins.tempo_type();
                        t.lock_style = PositionLockStyle::AudioTime;
                        need_add = false;
                        ret_id = t.id();
                    } else {
                        remove_i = Some(i);
                    }
                    break;
                }
            }
            (Section::Meter(m), Section::Meter(ins)) => {
                let ipm = ins.position_lock_style() == PositionLockStyle::MusicTime;
                if (ipm && m.beat() == ins.beat()) || (!ipm && m.frame() == ins.frame()) {
                    if !m.movable() {
                        m.meter = ins.meter();
                        m.lock_style = PositionLockStyle::AudioTime;
                        need_add = false;
                        ret_id = m.id();
                    } else {
                        remove_i = Some(i);
                    }
                    break;
                }
            }
            _ => {}
        }
    }
    if let Some(i) = remove_i {
        metrics.remove(i);
    }

    if need_add {
        let at = match &section {
            Section::Tempo(ins) => {
                let ipm = ins.position_lock_style() == PositionLockStyle::MusicTime;
                metrics.iter().position(|s| {
                    matches!(s, Section::Tempo(t)
                        if (ipm && t.pulse() > ins.pulse()) || (!ipm && t.frame() > ins.frame()))
                })
            }
            Section::Meter(ins) => {
                let ipm = ins.position_lock_style() == PositionLockStyle::MusicTime;
                metrics.iter().position(|s| {
                    matches!(s, Section::Meter(m)
                        if (ipm && m.beat() > ins.beat()) || (!ipm && m.frame() > ins.frame()))
                })
            }
        };
        match at {
            Some(i) => metrics.insert(i, section),
            None => metrics.push(section),
        }
    }

    ret_id
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn add_tempo_locked(
    metrics: &mut Metrics,
    frame_rate: FrameCnt,
    tempo: Tempo,
    pulse: f64,
    frame: FramePos,
    ty: TempoType,
    pls: PositionLockStyle,
    recompute: bool,
    locked_to_meter: bool,
) -> SectionId {
    let mut t = TempoSection::new(pulse, frame, tempo, ty, pls);
    t.locked_to_meter = locked_to_meter;

    let id = do_insert(metrics, Section::Tempo(t));

    if recompute {
        let solved = if pls == PositionLockStyle::AudioTime {
            solve_map_tempo_frame(metrics, frame_rate, id, frame)
        } else {
            solve_map_tempo_pulse(metrics, frame_rate, id, pulse)
        };
        recompute_meters(metrics, frame_rate);

        if !solved {
            // little we can do beyond making sure the map is recalculated
            log::warn!("Adding tempo may have left the tempo map unsolved.");
            recompute_map(metrics, frame_rate);
        }
    }

    id
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn add_meter_locked(
    metrics: &mut Metrics,
    frame_rate: FrameCnt,
    meter: Meter,
    beat: f64,
    bbt: Bbt,
    frame: FramePos,
    pls: PositionLockStyle,
    recompute: bool,
) -> SectionId {
    // meters live on the first beat of a bar
    let (beat, bbt) = if bbt.is_bar_start() {
        (beat, bbt)
    } else {
        let corrected = Bbt::new(bbt.bars, 1, 0);
        log::warn!(
            "Meter changes can only be positioned on the first beat of a bar. Moving from {bbt} to {corrected}"
        );
        (beat_at_bbt_locked(metrics, corrected), corrected)
    };

    let prev_m = meter_section_at_frame_locked(metrics, frame - 1);
    let pulse = (bbt.bars as f64 - prev_m.bbt().bars as f64)
        * (prev_m.divisions_per_bar() / prev_m.note_divisor())
        + prev_m.pulse();

    if pls == PositionLockStyle::AudioTime {
        // add the meter-locked tempo first
        let mlt = tempo_at_frame_locked(metrics, frame_rate, frame);
        add_tempo_locked(
            metrics,
            frame_rate,
            mlt,
            pulse,
            frame,
            TempoType::Ramp,
            PositionLockStyle::AudioTime,
            true,
            true,
        );
    }

    let m = MeterSection::new(pulse, frame, beat, bbt, meter, pls);
    let id = do_insert(metrics, Section::Meter(m));

    if recompute {
        let solved = if pls == PositionLockStyle::AudioTime {
            solve_map_meter_frame(metrics, frame_rate, id, frame)
        } else {
            let solved = solve_map_meter_bbt(metrics, frame_rate, id, bbt);
            // required after resetting the pulse of meter-locked tempi
            recompute_map(metrics, frame_rate);
            solved
        };

        if !solved {
            log::warn!("Adding meter may have left the tempo map unsolved.");
            recompute_map(metrics, frame_rate);
        }
    }

    id
}

pub(crate) fn remove_tempo_locked(metrics: &mut Metrics, id: SectionId) -> bool {
    if let Some(i) = find_section(metrics, id) {
        if metrics[i].is_tempo() && metrics[i].movable() {
            metrics.remove(i);
            return true;
        }
    }
    false
}

pub(crate) fn remove_meter_locked(metrics: &mut Metrics, id: SectionId) -> bool {
    let target = match find_section(metrics, id) {
        Some(i) => match metrics[i].as_meter() {
            Some(m) => *m,
            None => return false,
        },
        None => return false,
    };

    if target.position_lock_style() == PositionLockStyle::AudioTime {
        // remove the meter-locked tempo as well
        if let Some(ti) = metrics.iter().position(|s| {
            matches!(s, Section::Tempo(t) if t.locked_to_meter() && t.frame() == target.frame())
        }) {
            metrics.remove(ti);
        }
    }

    if let Some(i) = find_section(metrics, id) {
        if metrics[i].movable() {
            metrics.remove(i);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: FrameCnt = 48000;

    fn double_tempo_map() -> TempoMap {
        // 120 bpm at bar 1, 240 bpm at bar 4 (pulse 3)
        let map = TempoMap::new(SR);
        map.replace_meter(
            map.first_meter().id(),
            Meter::new(4.0, 4.0),
            Bbt::new(1, 1, 0),
            0,
            PositionLockStyle::AudioTime,
        );
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
    fn test_fresh_map_has_default_sections() {
        let map = TempoMap::new(SR);
        assert_eq!(map.n_tempos(), 1);
        assert_eq!(map.n_meters(), 1);
        assert_eq!(map.first_tempo().frame(), 0);
        assert_eq!(map.first_meter().frame(), 0);
        assert!(!map.first_tempo().movable());
        assert!(!map.first_meter().movable());
    }

    #[test]
    fn test_recompute_places_music_locked_tempo() {
        let map = double_tempo_map();
        map.add_meter(
            Meter::new(3.0, 4.0),
            12.0,
            Bbt::new(4, 1, 0),
            0,
            PositionLockStyle::MusicTime,
        );

        let sections = map.sections();
        assert_eq!(sections[0].frame(), 0);
        // the 240 bpm tempo and the 3/4 meter both land at 288e3
        assert_eq!(sections.last().map(|s| s.frame()), Some(288_000));
    }

    #[test]
    fn test_remove_tempo_refuses_non_movable() {
        let map = TempoMap::new(SR);
        assert!(!map.remove_tempo(map.first_tempo().id()));
        assert_eq!(map.n_tempos(), 1);
    }

    #[test]
    fn test_remove_audio_meter_drops_companion_tempo() {
        let map = double_tempo_map();
        let id = map.add_meter(
            Meter::new(3.0, 4.0),
            12.0,
            Bbt::new(4, 1, 0),
            288_000,
            PositionLockStyle::AudioTime,
        );
        let tempos_with_meter = map.n_tempos();
        assert!(map.remove_meter(id));
        assert_eq!(map.n_meters(), 1);
        assert_eq!(map.n_tempos(), tempos_with_meter - 1);
    }

    #[test]
    fn test_change_initial_tempo() {
        let map = double_tempo_map();
        map.change_initial_tempo(60.0, 4.0);
        // first beat now lasts 48e3 frames
        assert_eq!(map.frame_at_beat(1.0), 48_000);
    }

    #[test]
    fn test_insert_time_shifts_movable_sections() {
        let map = double_tempo_map();
        // tempo step sits at 288e3
        map.insert_time(100_000, 96_000);
        let last = map.sections().last().map(|s| s.frame());
        assert_eq!(last, Some(288_000 + 96_000));
        // the non-movable sections stay at zero
        assert_eq!(map.first_tempo().frame(), 0);
        assert_eq!(map.first_meter().frame(), 0);
    }

    #[test]
    fn test_remove_time_transplants_in_effect_section() {
        // an audio-locked 240 bpm change at 288e3
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
            0.0,
            288_000,
            TempoType::Constant,
            PositionLockStyle::AudioTime,
        );

        // cut a window that swallows the change
        assert!(map.remove_time(280_000, 20_000));
        // the change is transplanted to the cut point
        let frames: Vec<FramePos> = map
            .sections()
            .iter()
            .filter(|s| s.is_tempo())
            .map(|s| s.frame())
            .collect();
        assert!(frames.contains(&280_000));
    }

    #[test]
    fn test_subscription_fires_once_per_mutation() {
        let map = TempoMap::new(SR);
        let rx = map.subscribe();
        map.change_initial_tempo(100.0, 4.0);
        assert_eq!(rx.try_iter().count(), 1);

        // a rejected edit does not notify
        assert!(!map.remove_tempo(map.first_tempo().id()));
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_meter_coerced_to_bar_start() {
        let map = double_tempo_map();
        let id = map.add_meter(
            Meter::new(3.0, 4.0),
            13.0,
            Bbt::new(4, 2, 0),
            0,
            PositionLockStyle::MusicTime,
        );
        let meter = map
            .sections()
            .iter()
            .find_map(|s| s.as_meter().filter(|m| m.id() == id).copied());
        assert_eq!(meter.map(|m| m.bbt()), Some(Bbt::new(4, 1, 0)));
    }
}
