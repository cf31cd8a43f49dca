//! The solver
//!
//! Every position edit is proposed on a scratch copy of the metrics list
//! and validated with [`check_solved`] before the same edit is applied to
//! the live list. A mutator either fully applies (returns true) or leaves
//! the map untouched (returns false); partial states never escape the
//! write critical section.
//!
//! Because ramped music-locked and audio-locked tempi interact, moving a
//! section reorders the list frequently. After an edit the dependent
//! coordinate of every other section is reassigned, the list is re-sorted
//! by the now-authoritative coordinate, every ramp constant is refitted in
//! one forward pass, and the result is validated. Solved means ordered by
//! frame and by pulse with frame-accurate precision.

use crate::map::{recompute_map, recompute_meters, recompute_tempi, TempoMap};
use crate::meter::MeterSection;
use crate::query::{
    beat_at_bbt_locked, beat_at_frame_locked, bbt_at_beat_locked, exact_beat_at_frame_locked,
    frame_at_pulse_locked, meter_section_at_frame_locked, pulse_at_beat_locked,
    pulse_at_bbt_locked, pulse_at_frame_locked, tempo_section_at_frame_locked,
};
use crate::section::{find_section, sort_by_frame, sort_by_pulse, Metrics, PositionLockStyle, Section, SectionId};
use crate::tempo::{Tempo, TempoSection, TempoType, MAX_TEMPO, MIN_TEMPO};
use crate::{Bbt, FrameCnt, FramePos};

/// Gradient limit for fitted ramp constants
const MAX_C_FUNC: f64 = 1000.0;

/// Minimum measurement distance in frames for a rate dilation
const MIN_DFRAME: FramePos = 2;

// ═══════════════════════════════════════════════════════════════════════════════
// VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Is the metrics list solved? Active tempi must be strictly increasing
/// in both frame and pulse, each section's frame must agree with the frame
/// computed via its predecessor's ramp to within one sample, ramp
/// constants must stay within the gradient limit, and each audio-locked
/// meter's frame must agree with the prior tempo segment within one
/// sample.
pub(crate) fn check_solved(metrics: &Metrics, frame_rate: FrameCnt) -> bool {
    let mut prev_t: Option<&TempoSection> = None;
    let mut prev_m: Option<&MeterSection> = None;

    for s in metrics {
        match s {
            Section::Tempo(t) => {
                if !t.active() {
                    continue;
                }
                if let Some(p) = prev_t {
                    // ordering
                    if t.frame() <= p.frame() || t.pulse() <= p.pulse() {
                        return false;
                    }

                    // precision check ensures tempo and frames align
                    if t.frame() != p.frame_at_tempo(t.pulses_per_minute(), t.pulse(), frame_rate)
                        && !t.locked_to_meter()
                    {
                        return false;
                    }

                    // gradient limit
                    if p.c_func().abs() > MAX_C_FUNC {
                        return false;
                    }
                }
                prev_t = Some(t);
            }
            Section::Meter(m) => {
                if prev_m.is_some() && m.position_lock_style() == PositionLockStyle::AudioTime {
                    let t = tempo_section_at_frame_locked(metrics, m.frame() - 1);
                    let nascent_m_frame = t.frame_at_pulse(m.pulse(), frame_rate);
                    // an audio-locked meter places an exact pulse at a
                    // time expressed only in frames, shifting the frame
                    // calculated from the previous section of music away
                    // from the actual frame by up to one sample
                    if nascent_m_frame > m.frame() + 1 || nascent_m_frame < 0 {
                        return false;
                    }
                }
                prev_m = Some(m);
            }
        }
    }

    true
}

/// Deactivate audio-locked tempi that land before the first meter's new
/// frame, reactivate ones after it. Refuses the move when an audio-locked
/// tempo sits exactly at the frame.
pub(crate) fn set_active_tempos(metrics: &mut Metrics, frame: FramePos) -> bool {
    for s in metrics.iter_mut() {
        if let Section::Tempo(t) = s {
            if !t.movable() {
                t.active = true;
                continue;
            }
            if t.position_lock_style() == PositionLockStyle::AudioTime {
                if t.active() && t.frame() < frame {
                    t.active = false;
                    t.pulse = 0.0;
                } else if t.frame() > frame {
                    t.active = true;
                } else if t.frame() == frame {
                    return false;
                }
            }
        }
    }
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO MOVES
// ═══════════════════════════════════════════════════════════════════════════════

/// Move a tempo section to a frame. Audio-locked positions become
/// authoritative: every other tempo's dependent coordinate is reassigned,
/// the list is re-sorted by frame and refitted.
pub(crate) fn solve_map_tempo_frame(
    metrics: &mut Metrics,
    frame_rate: FrameCnt,
    section_id: SectionId,
    frame: FramePos,
) -> bool {
    // a tempo can't be moved before the first meter
    let mut first_m_frame: FramePos = 0;
    for s in metrics.iter() {
        if let Section::Meter(m) = s {
            if !m.movable() {
                first_m_frame = m.frame();
                break;
            }
        }
    }

    let sec_i = match find_section(metrics, section_id) {
        Some(i) if metrics[i].is_tempo() => i,
        _ => return false,
    };
    let section = match metrics[sec_i].as_tempo() {
        Some(t) => *t,
        None => return false,
    };
    if section.movable() && frame <= first_m_frame {
        return false;
    }

    if let Some(t) = metrics[sec_i].as_tempo_mut() {
        t.active = true;
        t.frame = frame;
    }

    let mut prev_i: Option<usize> = None;
    let mut section_prev_i: Option<usize> = None;

    for i in 0..metrics.len() {
        let cur = match &metrics[i] {
            Section::Tempo(t) if t.active() => *t,
            _ => continue,
        };

        if let Some(pi) = prev_i {
            if i == sec_i {
                section_prev_i = Some(pi);
                if cur.locked_to_meter() {
                    prev_i = Some(i);
                }
                continue;
            }

            let mut prev = match metrics[pi].as_tempo() {
                Some(p) => *p,
                None => continue,
            };
            let mut cur = cur;
            match cur.position_lock_style() {
                PositionLockStyle::MusicTime => {
                    prev.c = prev.compute_c_pulse(cur.pulses_per_minute(), cur.pulse());
                    cur.frame = prev.frame_at_pulse(cur.pulse(), frame_rate);
                }
                PositionLockStyle::AudioTime => {
                    prev.c = prev.compute_c_frame(cur.pulses_per_minute(), cur.frame(), frame_rate);
                    if !cur.locked_to_meter() {
                        cur.pulse = prev.pulse_at_frame(cur.frame(), frame_rate);
                    }
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

    if let Some(spi) = section_prev_i {
        let mut sp = match metrics[spi].as_tempo() {
            Some(p) => *p,
            None => return false,
        };
        sp.c = sp.compute_c_frame(section.pulses_per_minute(), frame, frame_rate);
        let pulse = sp.pulse_at_frame(frame, frame_rate);
        if let Some(p) = metrics[spi].as_tempo_mut() {
            *p = sp;
        }
        if !section.locked_to_meter() {
            if let Some(t) = metrics[sec_i].as_tempo_mut() {
                t.pulse = pulse;
            }
        }
    }

    sort_by_frame(metrics);
    recompute_tempi(metrics, frame_rate);

    check_solved(metrics, frame_rate)
}

/// Move a tempo section to a pulse. Music-locked positions become
/// authoritative; the list is re-sorted by pulse and refitted.
///
/// Cross-dragging a music-locked tempo past a ramped neighbour can make
/// the only solution absurd; it fails the solved check and the edit is
/// rejected.
pub(crate) fn solve_map_tempo_pulse(
    metrics: &mut Metrics,
    frame_rate: FrameCnt,
    section_id: SectionId,
    pulse: f64,
) -> bool {
    let sec_i = match find_section(metrics, section_id) {
        Some(i) if metrics[i].is_tempo() => i,
        _ => return false,
    };
    let section = match metrics[sec_i].as_tempo() {
        Some(t) => *t,
        None => return false,
    };

    if let Some(t) = metrics[sec_i].as_tempo_mut() {
        t.pulse = pulse;
    }

    let mut prev_i: Option<usize> = None;
    let mut section_prev_i: Option<usize> = None;

    for i in 0..metrics.len() {
        let cur = match &metrics[i] {
            Section::Tempo(t) if t.active() => *t,
            _ => continue,
        };

        if !cur.movable() {
            if let Some(t) = metrics[i].as_tempo_mut() {
                t.pulse = 0.0;
            }
            prev_i = Some(i);
            continue;
        }

        if let Some(pi) = prev_i {
            if i == sec_i {
                section_prev_i = Some(pi);
                continue;
            }

            let mut prev = match metrics[pi].as_tempo() {
                Some(p) => *p,
                None => continue,
            };
            let mut cur = cur;
            match cur.position_lock_style() {
                PositionLockStyle::MusicTime => {
                    prev.c = prev.compute_c_pulse(cur.pulses_per_minute(), cur.pulse());
                    cur.frame = prev.frame_at_pulse(cur.pulse(), frame_rate);
                }
                PositionLockStyle::AudioTime => {
                    prev.c = prev.compute_c_frame(cur.pulses_per_minute(), cur.frame(), frame_rate);
                    if !cur.locked_to_meter() {
                        cur.pulse = prev.pulse_at_frame(cur.frame(), frame_rate);
                    }
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

    if let Some(spi) = section_prev_i {
        let mut sp = match metrics[spi].as_tempo() {
            Some(p) => *p,
            None => return false,
        };
        sp.c = sp.compute_c_pulse(section.pulses_per_minute(), pulse);
        let frame = sp.frame_at_pulse(pulse, frame_rate);
        if let Some(p) = metrics[spi].as_tempo_mut() {
            *p = sp;
        }
        if let Some(t) = metrics[sec_i].as_tempo_mut() {
            t.frame = frame;
        }
    }

    sort_by_pulse(metrics);
    recompute_tempi(metrics, frame_rate);

    check_solved(metrics, frame_rate)
}

// ═══════════════════════════════════════════════════════════════════════════════
// METER MOVES
// ═══════════════════════════════════════════════════════════════════════════════

/// Move a meter section to a frame. An audio-locked meter drags its
/// meter-locked tempo: the tempo's pulse is recomputed from the prior
/// meter's bar arithmetic and the tempo is pinned to the frame.
pub(crate) fn solve_map_meter_frame(
    metrics: &mut Metrics,
    frame_rate: FrameCnt,
    section_id: SectionId,
    frame: FramePos,
) -> bool {
    let sec_i = match find_section(metrics, section_id) {
        Some(i) if !metrics[i].is_tempo() => i,
        _ => return false,
    };
    let section = match metrics[sec_i].as_meter() {
        Some(m) => *m,
        None => return false,
    };

    // disallow moving the first meter past any subsequent one, and any
    // movable meter before the first one
    let other = meter_section_at_frame_locked(metrics, frame);
    if (!section.movable() && other.movable())
        || (!other.movable() && section.movable() && other.frame() >= frame)
    {
        return false;
    }

    if !section.movable() {
        // lock the first tempo to our first meter
        if !set_active_tempos(metrics, frame) {
            return false;
        }
    }

    let mlt_id = match metrics.iter().find_map(|s| match s {
        Section::Tempo(t)
            if (t.locked_to_meter() || !t.movable()) && t.frame() == section.frame() =>
        {
            Some(t.id())
        }
        _ => None,
    }) {
        Some(id) => id,
        None => return false,
    };

    let mut future = metrics.clone();

    let mut prev_m: Option<MeterSection> = None;
    for i in 0..metrics.len() {
        let m = match &metrics[i] {
            Section::Meter(m) => *m,
            _ => continue,
        };

        if m.id() == section_id {
            if let (Some(pm), true) = (prev_m, section.movable()) {
                let beats = (pulse_at_frame_locked(metrics, frame_rate, frame) - pm.pulse())
                    * pm.note_divisor();
                if beats + pm.beat() < section.beat() {
                    // an earlier time than the section's musical position
                    // has been requested; move to the frame of the musical
                    // position instead
                    let new_pulse =
                        ((section.beat() - pm.beat()) / pm.note_divisor()) + pm.pulse();
                    let smallest_frame = frame_at_pulse_locked(&future, frame_rate, new_pulse);

                    if !solve_map_tempo_frame(&mut future, frame_rate, mlt_id, smallest_frame) {
                        return false;
                    }
                    if let Some(ti) = find_section(metrics, mlt_id) {
                        if let Some(t) = metrics[ti].as_tempo_mut() {
                            t.pulse = new_pulse;
                        }
                    }
                    solve_map_tempo_frame(metrics, frame_rate, mlt_id, smallest_frame);
                    if let Some(si) = find_section(metrics, section_id) {
                        if let Some(mm) = metrics[si].as_meter_mut() {
                            mm.frame = smallest_frame;
                            mm.pulse = new_pulse;
                        }
                    }
                } else {
                    // all is ok; pin the section's locked tempo
                    if let Some(fi) = find_section(&future, section_id) {
                        future[fi].set_frame(frame);
                    }
                    if !solve_map_tempo_frame(&mut future, frame_rate, mlt_id, frame) {
                        return false;
                    }
                    if let Some(si) = find_section(metrics, section_id) {
                        if let Some(mm) = metrics[si].as_meter_mut() {
                            mm.frame = frame;
                        }
                    }
                    let new_pulse =
                        ((section.beat() - pm.beat()) / pm.note_divisor()) + pm.pulse();
                    if let Some(ti) = find_section(metrics, mlt_id) {
                        if let Some(t) = metrics[ti].as_tempo_mut() {
                            t.pulse = new_pulse;
                        }
                    }
                    solve_map_tempo_frame(metrics, frame_rate, mlt_id, frame);
                }
            } else {
                // not movable (the first meter)
                if let Some(fi) = find_section(&future, mlt_id) {
                    if let Some(t) = future[fi].as_tempo_mut() {
                        t.frame = frame;
                        t.pulse = 0.0;
                    }
                }
                if !solve_map_tempo_frame(&mut future, frame_rate, mlt_id, frame) {
                    return false;
                }
                if let Some(si) = find_section(metrics, section_id) {
                    if let Some(mm) = metrics[si].as_meter_mut() {
                        mm.frame = frame;
                    }
                }
                if let Some(ti) = find_section(metrics, mlt_id) {
                    if let Some(t) = metrics[ti].as_tempo_mut() {
                        t.frame = frame;
                        t.pulse = 0.0;
                    }
                }
                solve_map_tempo_frame(metrics, frame_rate, mlt_id, frame);
                if let Some(si) = find_section(metrics, section_id) {
                    if let Some(mm) = metrics[si].as_meter_mut() {
                        mm.set_beat(0.0, Bbt::default());
                        mm.pulse = 0.0;
                    }
                }
            }
            break;
        }

        prev_m = Some(m);
    }

    sort_by_frame(metrics);
    recompute_meters(metrics, frame_rate);

    true
}

/// Move a meter section to a bar. No two meters may share a bar number.
pub(crate) fn solve_map_meter_bbt(
    metrics: &mut Metrics,
    frame_rate: FrameCnt,
    section_id: SectionId,
    when: Bbt,
) -> bool {
    // disallow setting the section to an existing meter's bbt
    if metrics.iter().any(|s| {
        matches!(s, Section::Meter(m) if m.id() != section_id && m.bbt().bars == when.bars)
    }) {
        return false;
    }

    let sec_i = match find_section(metrics, section_id) {
        Some(i) if !metrics[i].is_tempo() => i,
        _ => return false,
    };

    let mut prev_m_i: Option<usize> = None;
    let mut section_placed = false;

    for i in 0..metrics.len() {
        let mut m = match &metrics[i] {
            Section::Meter(m) => *m,
            _ => continue,
        };

        if let Some(pmi) = prev_m_i {
            if m.bbt().bars > when.bars && !section_placed {
                section_placed = true;
                let sp = match metrics[pmi].as_meter() {
                    Some(pm) => *pm,
                    None => return false,
                };
                let beats = (when.bars as f64 - sp.bbt().bars as f64) * sp.divisions_per_bar();
                let pulse = (beats / sp.note_divisor()) + sp.pulse();
                let frame = frame_at_pulse_locked(metrics, frame_rate, pulse);
                if let Some(mm) = metrics[sec_i].as_meter_mut() {
                    mm.set_beat(beats + sp.beat(), when);
                    mm.pulse = pulse;
                    mm.frame = frame;
                }
                prev_m_i = Some(sec_i);
                continue;
            }
        }

        match m.position_lock_style() {
            PositionLockStyle::AudioTime => {
                let mlt_i = metrics.iter().position(|s| {
                    matches!(s, Section::Tempo(t)
                        if (t.locked_to_meter() || !t.movable()) && t.frame() == m.frame())
                });
                let mlt_i = match mlt_i {
                    Some(j) => j,
                    None => return false,
                };

                let mut pulse = 0.0;
                let mut beat_bbt = (0.0, Bbt::default());
                if let Some(pmi) = prev_m_i {
                    let pm = match metrics[pmi].as_meter() {
                        Some(pm) => *pm,
                        None => return false,
                    };
                    let beats =
                        (m.bbt().bars as f64 - pm.bbt().bars as f64) * pm.divisions_per_bar();
                    if beats + pm.beat() != m.beat() {
                        // tempo or meter change caused a change in bar
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

                if let Some(t) = metrics[mlt_i].as_tempo_mut() {
                    t.pulse = pulse;
                }
                m.set_beat(beat_bbt.0, beat_bbt.1);
                m.pulse = pulse;
            }
            PositionLockStyle::MusicTime => {
                let pm = match prev_m_i.and_then(|pmi| metrics[pmi].as_meter().copied()) {
                    Some(pm) => pm,
                    // the first meter is audio-locked
                    None => {
                        prev_m_i = Some(i);
                        continue;
                    }
                };
                let beats = (m.bbt().bars as f64 - pm.bbt().bars as f64) * pm.divisions_per_bar();
                let beat_bbt = if beats + pm.beat() != m.beat() {
                    (
                        beats + pm.beat(),
                        Bbt::new(
                            (beats / pm.divisions_per_bar()) as u32 + pm.bbt().bars,
                            1,
                            0,
                        ),
                    )
                } else {
                    (beats + pm.beat(), m.bbt())
                };
                let new_pulse = (beats / pm.note_divisor()) + pm.pulse();
                m.set_beat(beat_bbt.0, beat_bbt.1);
                m.pulse = new_pulse;
                m.frame = frame_at_pulse_locked(metrics, frame_rate, new_pulse);
            }
        }

        if let Some(slot) = metrics[i].as_meter_mut() {
            *slot = m;
        }
        prev_m_i = Some(i);
    }

    if !section_placed {
        let pm = match prev_m_i.and_then(|pmi| metrics[pmi].as_meter().copied()) {
            Some(pm) => pm,
            None => return false,
        };
        let beats = (when.bars as f64 - pm.bbt().bars as f64) * pm.divisions_per_bar();
        let pulse = (beats / pm.note_divisor()) + pm.pulse();
        let frame = frame_at_pulse_locked(metrics, frame_rate, pulse);
        if let Some(mm) = metrics[sec_i].as_meter_mut() {
            mm.set_beat(beats + pm.beat(), when);
            mm.pulse = pulse;
            mm.frame = frame;
        }
    }

    sort_by_pulse(metrics);
    recompute_meters(metrics, frame_rate);

    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC MUTATORS
// ═══════════════════════════════════════════════════════════════════════════════

impl TempoMap {
    /// Move a tempo section towards a frame, snapping to the grid division
    /// `sub_num` when non-zero. Returns true if the edit was applied.
    pub fn gui_move_tempo(&self, id: SectionId, frame: FramePos, sub_num: i32) -> bool {
        let frame_rate = self.frame_rate();
        let applied = {
            let mut metrics = self.metrics.write();
            let ts = match find_section(&metrics, id).and_then(|i| metrics[i].as_tempo().copied()) {
                Some(t) => t,
                None => return false,
            };

            match ts.position_lock_style() {
                PositionLockStyle::MusicTime => {
                    // when snapping to a musical grid, set the pulse
                    // exactly instead of via the supplied frame
                    let mut future = metrics.clone();
                    if let Some(fi) = find_section(&future, id) {
                        if let Some(t) = future[fi].as_tempo_mut() {
                            t.lock_style = PositionLockStyle::AudioTime;
                        }
                    }

                    let mut applied = false;
                    if solve_map_tempo_frame(&mut future, frame_rate, id, frame) {
                        let beat = exact_beat_at_frame_locked(&future, frame_rate, frame, sub_num);
                        let pulse = pulse_at_beat_locked(&future, beat);
                        if solve_map_tempo_pulse(&mut future, frame_rate, id, pulse) {
                            applied = solve_map_tempo_pulse(&mut metrics, frame_rate, id, pulse);
                            recompute_meters(&mut metrics, frame_rate);
                        }
                    }
                    applied
                }
                PositionLockStyle::AudioTime => {
                    let mut future = metrics.clone();
                    let mut applied = false;
                    if solve_map_tempo_frame(&mut future, frame_rate, id, frame) {
                        if sub_num != 0 {
                            // moving the object that defines the grid
                            // while snapping to it: place the section at
                            // the requested frame in the scratch map, then
                            // snap to the closest division found there, so
                            // the grid doesn't jitter under the pointer
                            let beat =
                                exact_beat_at_frame_locked(&future, frame_rate, frame, sub_num);
                            let pulse = pulse_at_beat_locked(&future, beat);
                            if solve_map_tempo_pulse(&mut future, frame_rate, id, pulse) {
                                // snapping to a grid: force MusicTime
                                // for the placement
                                if let Some(i) = find_section(&metrics, id) {
                                    if let Some(t) = metrics[i].as_tempo_mut() {
                                        t.lock_style = PositionLockStyle::MusicTime;
                                    }
                                }
                                applied = solve_map_tempo_pulse(&mut metrics, frame_rate, id, pulse);
                                if let Some(i) = find_section(&metrics, id) {
                                    if let Some(t) = metrics[i].as_tempo_mut() {
                                        t.lock_style = PositionLockStyle::AudioTime;
                                    }
                                }
                                recompute_meters(&mut metrics, frame_rate);
                            }
                        } else {
                            applied = solve_map_tempo_frame(&mut metrics, frame_rate, id, frame);
                            recompute_meters(&mut metrics, frame_rate);
                        }
                    }
                    applied
                }
            }
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Move a meter section towards a frame. Returns true if the edit was
    /// applied.
    pub fn gui_move_meter(&self, id: SectionId, frame: FramePos) -> bool {
        let frame_rate = self.frame_rate();
        let applied = {
            let mut metrics = self.metrics.write();
            let ms = match find_section(&metrics, id).and_then(|i| metrics[i].as_meter().copied()) {
                Some(m) => m,
                None => return false,
            };

            match ms.position_lock_style() {
                PositionLockStyle::AudioTime => {
                    let mut future = metrics.clone();
                    let mut applied = false;
                    if solve_map_meter_frame(&mut future, frame_rate, id, frame) {
                        applied = solve_map_meter_frame(&mut metrics, frame_rate, id, frame);
                        recompute_tempi(&mut metrics, frame_rate);
                    }
                    applied
                }
                PositionLockStyle::MusicTime => {
                    let mut future = metrics.clone();
                    let beat = beat_at_frame_locked(&metrics, frame_rate, frame);
                    let bbt = bbt_at_beat_locked(&metrics, beat);
                    let mut applied = false;
                    if solve_map_meter_bbt(&mut future, frame_rate, id, bbt) {
                        applied = solve_map_meter_bbt(&mut metrics, frame_rate, id, bbt);
                        recompute_tempi(&mut metrics, frame_rate);
                    }
                    applied
                }
            }
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Change a tempo section's rate in place. Returns true if the new
    /// rate leaves the map solved.
    pub fn gui_change_tempo(&self, id: SectionId, bpm: Tempo) -> bool {
        let frame_rate = self.frame_rate();
        let applied = {
            let mut metrics = self.metrics.write();
            let mut future = metrics.clone();

            let note_type = match find_section(&future, id)
                .and_then(|i| future[i].as_tempo().map(|t| t.note_type()))
            {
                Some(nt) => nt,
                None => return false,
            };
            if let Some(i) = find_section(&future, id) {
                if let Some(t) = future[i].as_tempo_mut() {
                    t.tempo = Tempo::new(bpm.beats_per_minute(), note_type);
                }
            }
            recompute_tempi(&mut future, frame_rate);

            if check_solved(&future, frame_rate) {
                if let Some(i) = find_section(&metrics, id) {
                    if let Some(t) = metrics[i].as_tempo_mut() {
                        t.tempo = Tempo::new(bpm.beats_per_minute(), note_type);
                    }
                }
                recompute_map(&mut metrics, frame_rate);
                true
            } else {
                false
            }
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Stretch the rate of the tempo section so that the pulse grabbed at
    /// `frame` lands at `end_frame`. The new rate accounts for the
    /// contribution of a ramped section before it and is clamped to the
    /// legal tempo range; a drag that would need a negative rate is
    /// abandoned.
    pub fn gui_dilate_tempo(
        &self,
        id: SectionId,
        frame: FramePos,
        end_frame: FramePos,
        pulse: f64,
    ) -> bool {
        let frame_rate = self.frame_rate();
        let applied = {
            let mut metrics = self.metrics.write();
            let mut future = metrics.clone();

            let prev_t = match find_section(&future, id).and_then(|i| future[i].as_tempo().copied())
            {
                Some(t) => t,
                None => return false,
            };

            let prev_to_prev_t = if prev_t.pulse() > 0.0 {
                Some(tempo_section_at_frame_locked(&future, prev_t.frame() - 1))
            } else {
                None
            };

            let mut next_t: Option<TempoSection> = None;
            for s in future.iter() {
                if let Section::Tempo(t) = s {
                    if t.frame() > prev_t.frame() {
                        next_t = Some(*t);
                        break;
                    }
                }
            }

            let fr_off = end_frame - frame;

            // the change in frames is the result of changing the slope of
            // at most two previous tempo sections
            let mut contribution = 0.0;
            if let (Some(next), Some(ptp)) = (&next_t, &prev_to_prev_t) {
                if ptp.tempo_type() == TempoType::Ramp {
                    contribution = (prev_t.frame() - ptp.frame()) as f64
                        / (next.frame() - ptp.frame()) as f64;
                }
            }
            let prev_t_frame_contribution = fr_off as f64 - (contribution * fr_off as f64);

            let start_pulse = prev_t.pulse_at_frame(frame, frame_rate);
            let end_pulse = prev_t.pulse_at_frame(end_frame, frame_rate);

            let ramped_ptp = prev_to_prev_t
                .as_ref()
                .filter(|p| p.tempo_type() == TempoType::Ramp);

            let new_bpm;
            if prev_t.tempo_type() == TempoType::Constant || prev_t.c_func() == 0.0 {
                if prev_t.position_lock_style() == PositionLockStyle::MusicTime {
                    if let Some(ptp) = ramped_ptp {
                        if frame > ptp.frame() + MIN_DFRAME
                            && frame as f64 + prev_t_frame_contribution
                                > (ptp.frame() + MIN_DFRAME) as f64
                        {
                            new_bpm = prev_t.beats_per_minute()
                                * ((frame - ptp.frame()) as f64
                                    / (frame as f64 + prev_t_frame_contribution
                                        - ptp.frame() as f64));
                        } else {
                            new_bpm = prev_t.beats_per_minute();
                        }
                    } else {
                        // a constant or absent predecessor is irrelevant
                        if start_pulse > prev_t.pulse() && end_pulse > prev_t.pulse() {
                            new_bpm = prev_t.beats_per_minute()
                                * ((start_pulse - prev_t.pulse())
                                    / (end_pulse - prev_t.pulse()));
                        } else {
                            new_bpm = prev_t.beats_per_minute();
                        }
                    }
                } else {
                    // AudioTime
                    if let Some(ptp) = ramped_ptp {
                        if frame > ptp.frame() + MIN_DFRAME && end_frame > ptp.frame() + MIN_DFRAME
                        {
                            new_bpm = prev_t.beats_per_minute()
                                * ((frame - ptp.frame()) as f64
                                    / (end_frame - ptp.frame()) as f64);
                        } else {
                            new_bpm = prev_t.beats_per_minute();
                        }
                    } else if frame > prev_t.frame() + MIN_DFRAME
                        && end_frame > prev_t.frame() + MIN_DFRAME
                    {
                        new_bpm = prev_t.beats_per_minute()
                            * ((frame - prev_t.frame()) as f64
                                / (end_frame - prev_t.frame()) as f64);
                    } else {
                        new_bpm = prev_t.beats_per_minute();
                    }
                }
            } else {
                let mut frame_ratio = 1.0;
                let mut pulse_ratio = 1.0;
                let pulse_pos = prev_t.frame_at_pulse(pulse, frame_rate);

                if let Some(ptp) = &prev_to_prev_t {
                    if pulse_pos > ptp.frame() + MIN_DFRAME
                        && pulse_pos - fr_off > ptp.frame() + MIN_DFRAME
                    {
                        frame_ratio = (pulse_pos - fr_off - ptp.frame()) as f64
                            / (pulse_pos - ptp.frame()) as f64;
                    }
                    if end_pulse > ptp.pulse() && start_pulse > ptp.pulse() {
                        pulse_ratio =
                            (start_pulse - ptp.pulse()) / (end_pulse - ptp.pulse());
                    }
                } else {
                    if pulse_pos > prev_t.frame() + MIN_DFRAME
                        && pulse_pos - fr_off > prev_t.frame() + MIN_DFRAME
                    {
                        frame_ratio = (pulse_pos - fr_off - prev_t.frame()) as f64
                            / (pulse_pos - prev_t.frame()) as f64;
                    }
                    pulse_ratio = start_pulse / end_pulse;
                }
                new_bpm = prev_t.beats_per_minute() * (pulse_ratio * frame_ratio);
            }

            // this can go negative, which is an entirely different thing
            // to just being too low; don't clamp and proceed
            if new_bpm < MIN_TEMPO {
                return false;
            }
            let new_bpm = new_bpm.min(MAX_TEMPO);

            if let Some(i) = find_section(&future, id) {
                if let Some(t) = future[i].as_tempo_mut() {
                    t.tempo = Tempo::new(new_bpm, t.note_type());
                }
            }
            recompute_tempi(&mut future, frame_rate);
            recompute_meters(&mut future, frame_rate);

            if check_solved(&future, frame_rate) {
                if let Some(i) = find_section(&metrics, id) {
                    if let Some(t) = metrics[i].as_tempo_mut() {
                        t.tempo = Tempo::new(new_bpm, t.note_type());
                    }
                }
                recompute_tempi(&mut metrics, frame_rate);
                recompute_meters(&mut metrics, frame_rate);
                true
            } else {
                false
            }
        };
        if applied {
            self.notify();
        }
        applied
    }

    /// Would moving the tempo section to this bbt leave the map solved?
    pub fn can_solve_bbt(&self, id: SectionId, bbt: Bbt) -> bool {
        let mut copy = { self.metrics.read().clone() };
        if find_section(&copy, id).is_none() {
            return false;
        }
        let pulse = pulse_at_bbt_locked(&copy, bbt);
        solve_map_tempo_pulse(&mut copy, self.frame_rate(), id, pulse)
    }

    /// Where would the tempo section land if moved to this bbt, taking any
    /// resulting reordering into account? Returns (pulse, frame); the
    /// section's current position if the move would not solve.
    pub fn predict_tempo_position(&self, id: SectionId, bbt: Bbt) -> (f64, FramePos) {
        let metrics = self.metrics.read();
        let mut future = metrics.clone();

        let current = match find_section(&metrics, id).and_then(|i| metrics[i].as_tempo().copied())
        {
            Some(t) => (t.pulse(), t.frame()),
            None => return (0.0, 0),
        };
        drop(metrics);

        let beat = beat_at_bbt_locked(&future, bbt);
        let pulse = pulse_at_beat_locked(&future, beat);

        if solve_map_tempo_pulse(&mut future, self.frame_rate(), id, pulse) {
            match find_section(&future, id).and_then(|i| future[i].as_tempo().copied()) {
                Some(t) => (t.pulse(), t.frame()),
                None => current,
            }
        } else {
            current
        }
    }
}
