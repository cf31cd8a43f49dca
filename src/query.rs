//! Conversions between time domains
//!
//! The `*_locked` functions operate on a metrics list the caller has
//! leased; the public methods on [`TempoMap`] take the read lease
//! themselves.
//!
//! Beat is a function of time, not of sample rate, but frame quantisation
//! gets in the way of precision: `frame_at_beat` rounds to audio frames,
//! `beat_at_frame` does not round. So `frame_at_beat(beat_at_frame(f))
//! == f` exactly, while the other direction carries up to half a frame of
//! quantisation. Work in pulses or beats and only translate to frames at
//! the edges.

use crate::bbt::TICKS_PER_BEAT;
use crate::map::TempoMap;
use crate::meter::{Meter, MeterSection};
use crate::section::{Metrics, Section};
use crate::tempo::{Tempo, TempoSection, TempoType};
use crate::{Bbt, FrameCnt, FramePos, TactusError, TactusResult};

// ═══════════════════════════════════════════════════════════════════════════════
// COVERING-SECTION LOOKUPS
// ═══════════════════════════════════════════════════════════════════════════════

fn fallback_tempo() -> TempoSection {
    TempoSection::new(
        0.0,
        0,
        Tempo::DEFAULT,
        TempoType::Constant,
        crate::PositionLockStyle::AudioTime,
    )
}

fn fallback_meter() -> MeterSection {
    MeterSection::new(
        0.0,
        0,
        0.0,
        Bbt::default(),
        Meter::DEFAULT,
        crate::PositionLockStyle::AudioTime,
    )
}

/// Last active tempo section at or before the frame
pub(crate) fn tempo_section_at_frame_locked(metrics: &Metrics, frame: FramePos) -> TempoSection {
    let mut prev: Option<&TempoSection> = None;
    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if prev.is_some() && t.frame() > frame {
                break;
            }
            prev = Some(t);
        }
    }
    prev.copied().unwrap_or_else(fallback_tempo)
}

/// Last active tempo section at or before the beat
pub(crate) fn tempo_section_at_beat_locked(metrics: &Metrics, beat: f64) -> TempoSection {
    let prev_m = meter_section_at_beat_locked(metrics, beat);
    let mut prev: Option<&TempoSection> = None;
    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if prev.is_some()
                && ((t.pulse() - prev_m.pulse()) * prev_m.note_divisor()) + prev_m.beat() > beat
            {
                break;
            }
            prev = Some(t);
        }
    }
    prev.copied().unwrap_or_else(fallback_tempo)
}

/// Last meter section at or before the frame
pub(crate) fn meter_section_at_frame_locked(metrics: &Metrics, frame: FramePos) -> MeterSection {
    let mut prev: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev.is_some() && m.frame() > frame {
                break;
            }
            prev = Some(m);
        }
    }
    prev.copied().unwrap_or_else(fallback_meter)
}

/// Last meter section at or before the beat
pub(crate) fn meter_section_at_beat_locked(metrics: &Metrics, beat: f64) -> MeterSection {
    let mut prev: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev.is_some() && m.beat() > beat {
                break;
            }
            prev = Some(m);
        }
    }
    prev.copied().unwrap_or_else(fallback_meter)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PULSE <-> FRAME (tempo sections only)
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn pulse_at_frame_locked(metrics: &Metrics, frame_rate: FrameCnt, frame: FramePos) -> f64 {
    let mut prev: Option<&TempoSection> = None;
    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if let Some(p) = prev {
                if t.frame() > frame {
                    return p.pulse_at_frame(frame, frame_rate);
                }
            }
            prev = Some(t);
        }
    }
    let prev = match prev {
        Some(t) => t,
        None => return 0.0,
    };
    // the terminal section is treated as constant
    ((frame - prev.frame()) as f64 / prev.frames_per_pulse(frame_rate)) + prev.pulse()
}

pub(crate) fn frame_at_pulse_locked(metrics: &Metrics, frame_rate: FrameCnt, pulse: f64) -> FramePos {
    let mut prev: Option<&TempoSection> = None;
    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if let Some(p) = prev {
                if t.pulse() > pulse {
                    return p.frame_at_pulse(pulse, frame_rate);
                }
            }
            prev = Some(t);
        }
    }
    let prev = match prev {
        Some(t) => t,
        None => return 0,
    };
    let dtime = (pulse - prev.pulse()) * prev.frames_per_pulse(frame_rate);
    dtime.floor() as FramePos + prev.frame()
}

// ═══════════════════════════════════════════════════════════════════════════════
// BEAT <-> FRAME (tempo and meter)
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn beat_at_frame_locked(metrics: &Metrics, frame_rate: FrameCnt, frame: FramePos) -> f64 {
    let ts = tempo_section_at_frame_locked(metrics, frame);
    let mut prev_m: Option<&MeterSection> = None;
    let mut next_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev_m.is_some() && m.frame() > frame {
                next_m = Some(m);
                break;
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return 0.0,
    };

    let beat =
        prev_m.beat() + (ts.pulse_at_frame(frame, frame_rate) - prev_m.pulse()) * prev_m.note_divisor();

    // audio-locked meters fake their beat
    if let Some(next_m) = next_m {
        if next_m.beat() < beat {
            return next_m.beat();
        }
    }

    beat
}

pub(crate) fn frame_at_beat_locked(metrics: &Metrics, frame_rate: FrameCnt, beat: f64) -> FramePos {
    let mut prev_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev_m.is_some() && m.beat() > beat {
                break;
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return 0,
    };

    let mut prev_t: Option<&TempoSection> = None;
    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if prev_t.is_some()
                && ((t.pulse() - prev_m.pulse()) * prev_m.note_divisor()) + prev_m.beat() > beat
            {
                break;
            }
            prev_t = Some(t);
        }
    }
    let prev_t = match prev_t {
        Some(t) => t,
        None => return 0,
    };

    prev_t.frame_at_pulse(
        ((beat - prev_m.beat()) / prev_m.note_divisor()) + prev_m.pulse(),
        frame_rate,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// PULSE <-> BEAT (meter sections only)
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn pulse_at_beat_locked(metrics: &Metrics, beat: f64) -> f64 {
    let prev_m = meter_section_at_beat_locked(metrics, beat);
    prev_m.pulse() + ((beat - prev_m.beat()) / prev_m.note_divisor())
}

pub(crate) fn beat_at_pulse_locked(metrics: &Metrics, pulse: f64) -> f64 {
    let mut prev_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if let Some(pm) = prev_m {
                if m.pulse() > pulse
                    && ((pulse - pm.pulse()) * pm.note_divisor()) + pm.beat() > m.beat()
                {
                    break;
                }
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return 0.0,
    };
    ((pulse - prev_m.pulse()) * prev_m.note_divisor()) + prev_m.beat()
}

// ═══════════════════════════════════════════════════════════════════════════════
// BBT ARITHMETIC (meter sections only)
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn beat_at_bbt_locked(metrics: &Metrics, bbt: Bbt) -> f64 {
    // audio-locked meters carry fake integral beats, so there is no pulse
    // offset here
    let mut prev_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if let Some(pm) = prev_m {
                let bars_to_m = (m.beat() - pm.beat()) / pm.divisions_per_bar();
                if bars_to_m + (pm.bbt().bars as f64 - 1.0) > (bbt.bars as f64 - 1.0) {
                    break;
                }
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return 0.0,
    };

    let remaining_bars = bbt.bars as f64 - prev_m.bbt().bars as f64;
    let remaining_bars_in_beats = remaining_bars * prev_m.divisions_per_bar();
    remaining_bars_in_beats
        + prev_m.beat()
        + (bbt.beats as f64 - 1.0)
        + (bbt.ticks as f64 / TICKS_PER_BEAT)
}

pub(crate) fn bbt_at_beat_locked(metrics: &Metrics, b: f64) -> Bbt {
    let beats = b.max(0.0);
    let mut prev_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev_m.is_some() && m.beat() > beats {
                break;
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return Bbt::default(),
    };

    bbt_from_beat_offset(prev_m, beats - prev_m.beat())
}

pub(crate) fn pulse_at_bbt_locked(metrics: &Metrics, bbt: Bbt) -> f64 {
    let mut prev_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev_m.is_some() && m.bbt().bars > bbt.bars {
                break;
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return 0.0,
    };

    let remaining_bars = bbt.bars as f64 - prev_m.bbt().bars as f64;
    let remaining_pulses = remaining_bars * prev_m.divisions_per_bar() / prev_m.note_divisor();
    remaining_pulses
        + prev_m.pulse()
        + (((bbt.beats as f64 - 1.0) + (bbt.ticks as f64 / TICKS_PER_BEAT)) / prev_m.note_divisor())
}

pub(crate) fn bbt_at_pulse_locked(metrics: &Metrics, pulse: f64) -> Bbt {
    let mut prev_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev_m.is_some() && m.pulse() > pulse {
                break;
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return Bbt::default(),
    };

    let beats_in_ms = (pulse - prev_m.pulse()) * prev_m.note_divisor();
    bbt_from_beat_offset(prev_m, beats_in_ms)
}

/// Bar arithmetic shared by the bbt_at_* conversions: a (possibly
/// fractional) beat offset from a covering meter becomes a one-based BBT.
pub(crate) fn bbt_from_beat_offset(prev_m: &MeterSection, beats_in_ms: f64) -> Bbt {
    let bars_in_ms = (beats_in_ms / prev_m.divisions_per_bar()).floor() as u32;
    let total_bars = bars_in_ms + (prev_m.bbt().bars - 1);
    let remaining_beats = beats_in_ms - (bars_in_ms as f64 * prev_m.divisions_per_bar());
    let remaining_ticks = (remaining_beats - remaining_beats.floor()) * TICKS_PER_BEAT;

    let mut ret = Bbt {
        bars: total_bars,
        beats: remaining_beats.floor() as u32,
        ticks: (remaining_ticks + 0.5).floor() as u32,
    };

    // 0|0|0 to 1|1|0 based mapping
    ret.bars += 1;
    ret.beats += 1;

    if ret.ticks as f64 >= TICKS_PER_BEAT {
        ret.beats += 1;
        ret.ticks -= TICKS_PER_BEAT as u32;
    }

    if ret.beats as f64 >= prev_m.divisions_per_bar() + 1.0 {
        ret.bars += 1;
        ret.beats = 1;
    }

    ret
}

pub(crate) fn bbt_at_frame_locked(metrics: &Metrics, frame_rate: FrameCnt, frame: FramePos) -> Bbt {
    if frame < 0 {
        return Bbt::default();
    }

    let ts = tempo_section_at_frame_locked(metrics, frame);
    let mut prev_m: Option<&MeterSection> = None;
    let mut next_m: Option<&MeterSection> = None;
    for s in metrics {
        if let Section::Meter(m) = s {
            if prev_m.is_some() && m.frame() > frame {
                next_m = Some(m);
                break;
            }
            prev_m = Some(m);
        }
    }
    let prev_m = match prev_m {
        Some(m) => m,
        None => return Bbt::default(),
    };

    let mut beat =
        prev_m.beat() + (ts.pulse_at_frame(frame, frame_rate) - prev_m.pulse()) * prev_m.note_divisor();

    // frame before the first meter
    if frame < prev_m.frame() {
        beat = 0.0;
    }
    // audio-locked meters fake their beat
    if let Some(next_m) = next_m {
        if next_m.beat() < beat {
            beat = next_m.beat();
        }
    }
    beat = beat.max(0.0);

    bbt_from_beat_offset(prev_m, beat - prev_m.beat())
}

pub(crate) fn frame_at_bbt_locked(metrics: &Metrics, frame_rate: FrameCnt, bbt: Bbt) -> FramePos {
    frame_at_beat_locked(metrics, frame_rate, beat_at_bbt_locked(metrics, bbt))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO QUERIES
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn tempo_at_frame_locked(metrics: &Metrics, frame_rate: FrameCnt, frame: FramePos) -> Tempo {
    let mut prev: Option<&TempoSection> = None;
    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if let Some(p) = prev {
                if t.frame() > frame {
                    // t is the section past the frame
                    let bpm = p.tempo_at_frame(frame, frame_rate) * p.note_type();
                    return Tempo::new(bpm, p.note_type());
                }
            }
            prev = Some(t);
        }
    }
    match prev {
        Some(p) => Tempo::new(p.beats_per_minute(), p.note_type()),
        None => Tempo::DEFAULT,
    }
}

/// Frame of the first place the supplied tempo occurs. The search walks
/// active sections looking for a bracketing pair; an exact hit on a
/// section's own rate is the degenerate case of the bracket.
pub(crate) fn frame_at_tempo_locked(metrics: &Metrics, frame_rate: FrameCnt, tempo: Tempo) -> FramePos {
    let target = tempo.pulses_per_minute();
    let mut prev: Option<&TempoSection> = None;

    for s in metrics {
        if let Section::Tempo(t) = s {
            if !t.active() {
                continue;
            }
            if let Some(p) = prev {
                let t_ppm = t.pulses_per_minute();
                let p_ppm = p.pulses_per_minute();
                if (p_ppm <= target && target <= t_ppm) || (t_ppm <= target && target <= p_ppm) {
                    return p.frame_at_tempo(target, p.pulse(), frame_rate);
                }
            }
            prev = Some(t);
        }
    }
    prev.map(|p| p.frame()).unwrap_or(0)
}

pub(crate) fn exact_beat_at_frame_locked(
    metrics: &Metrics,
    frame_rate: FrameCnt,
    frame: FramePos,
    sub_num: i32,
) -> f64 {
    let mut beat = beat_at_frame_locked(metrics, frame_rate, frame);

    if sub_num > 1 {
        beat = beat.floor()
            + (((beat - beat.floor()) * sub_num as f64 + 0.5).floor() / sub_num as f64);
    } else if sub_num == 1 {
        // snap to beat
        beat = (beat + 0.5).floor();
    } else if sub_num == -1 {
        // snap to bar
        let mut bbt = bbt_at_beat_locked(metrics, beat);
        bbt.beats = 1;
        bbt.ticks = 0;

        let prev_b = beat_at_bbt_locked(metrics, bbt);
        bbt.bars += 1;
        let next_b = beat_at_bbt_locked(metrics, bbt);

        if (beat - prev_b) > (next_b - prev_b) / 2.0 {
            beat = next_b;
        } else {
            beat = prev_b;
        }
    }

    beat
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC QUERY API
// ═══════════════════════════════════════════════════════════════════════════════

/// Rounding direction for frame snapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    /// Always round to an earlier position
    Down,
    /// Round down unless already on the boundary
    DownMaybe,
    /// Round to the closest boundary
    Nearest,
    /// Round up unless already on the boundary
    UpMaybe,
    /// Always round to a later position
    Up,
}

/// What to snap to when rounding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbtPointType {
    Bar,
    Beat,
}

/// One enumerated grid line
#[derive(Debug, Clone, Copy)]
pub struct BbtPoint {
    pub bbt: Bbt,
    pub frame: FramePos,
    pub tempo: Tempo,
    pub meter: Meter,
    pub c: f64,
}

impl TempoMap {
    /// Pulse (whole notes since origin) at the frame
    pub fn pulse_at_frame(&self, frame: FramePos) -> f64 {
        let metrics = self.metrics.read();
        pulse_at_frame_locked(&metrics, self.frame_rate(), frame)
    }

    /// Frame at the pulse
    pub fn frame_at_pulse(&self, pulse: f64) -> FramePos {
        let metrics = self.metrics.read();
        frame_at_pulse_locked(&metrics, self.frame_rate(), pulse)
    }

    /// Beat (meter divisions since origin) at the frame. Negative if the
    /// frame lies before the first meter, using the backwards continuation
    /// of the tempo curve.
    pub fn beat_at_frame(&self, frame: FramePos) -> f64 {
        let metrics = self.metrics.read();
        beat_at_frame_locked(&metrics, self.frame_rate(), frame)
    }

    /// Frame at the beat
    pub fn frame_at_beat(&self, beat: f64) -> FramePos {
        let metrics = self.metrics.read();
        frame_at_beat_locked(&metrics, self.frame_rate(), beat)
    }

    /// Pulse at the beat, via the covering meter only (no frame rounding)
    pub fn pulse_at_beat(&self, beat: f64) -> f64 {
        let metrics = self.metrics.read();
        pulse_at_beat_locked(&metrics, beat)
    }

    /// Beat at the pulse, via the covering meter only (no frame rounding)
    pub fn beat_at_pulse(&self, pulse: f64) -> f64 {
        let metrics = self.metrics.read();
        beat_at_pulse_locked(&metrics, pulse)
    }

    /// Beat at the BBT position
    pub fn beat_at_bbt(&self, bbt: Bbt) -> f64 {
        let metrics = self.metrics.read();
        beat_at_bbt_locked(&metrics, bbt)
    }

    /// BBT position at the beat
    pub fn bbt_at_beat(&self, beat: f64) -> Bbt {
        let metrics = self.metrics.read();
        bbt_at_beat_locked(&metrics, beat)
    }

    /// Pulse at the BBT position
    pub fn pulse_at_bbt(&self, bbt: Bbt) -> f64 {
        let metrics = self.metrics.read();
        pulse_at_bbt_locked(&metrics, bbt)
    }

    /// Realtime-safe variant of [`pulse_at_bbt`](Self::pulse_at_bbt);
    /// fails fast instead of blocking on the lock
    pub fn pulse_at_bbt_rt(&self, bbt: Bbt) -> TactusResult<f64> {
        let metrics = self.metrics.try_read().ok_or(TactusError::Contention)?;
        Ok(pulse_at_bbt_locked(&metrics, bbt))
    }

    /// BBT position at the pulse
    pub fn bbt_at_pulse(&self, pulse: f64) -> Bbt {
        let metrics = self.metrics.read();
        bbt_at_pulse_locked(&metrics, pulse)
    }

    /// BBT position at the frame. Frames before zero clamp to 1|1|0.
    pub fn bbt_at_frame(&self, frame: FramePos) -> Bbt {
        if frame < 0 {
            log::warn!("tempo map asked for BBT time at frame {frame}");
            return Bbt::default();
        }
        let metrics = self.metrics.read();
        bbt_at_frame_locked(&metrics, self.frame_rate(), frame)
    }

    /// Realtime-safe variant of [`bbt_at_frame`](Self::bbt_at_frame)
    pub fn bbt_at_frame_rt(&self, frame: FramePos) -> TactusResult<Bbt> {
        let metrics = self.metrics.try_read().ok_or(TactusError::Contention)?;
        Ok(bbt_at_frame_locked(&metrics, self.frame_rate(), frame))
    }

    /// Frame at the BBT position. Bars and beats are counted from one.
    pub fn frame_at_bbt(&self, bbt: Bbt) -> FramePos {
        if bbt.bars < 1 {
            log::warn!("tempo map asked for frame time at bar < 1 ({bbt})");
            return 0;
        }
        let metrics = self.metrics.read();
        frame_at_bbt_locked(&metrics, self.frame_rate(), bbt)
    }

    /// Tempo in effect at the frame, evaluated on the covering ramp
    pub fn tempo_at_frame(&self, frame: FramePos) -> Tempo {
        let metrics = self.metrics.read();
        tempo_at_frame_locked(&metrics, self.frame_rate(), frame)
    }

    /// Tempo in effect at the beat. More precise than
    /// `tempo_at_frame(frame_at_beat(b))` as there is no intermediate
    /// frame rounding.
    pub fn tempo_at_beat(&self, beat: f64) -> Tempo {
        let metrics = self.metrics.read();
        let prev_m = meter_section_at_beat_locked(&metrics, beat);
        let prev_t = tempo_section_at_beat_locked(&metrics, beat);
        let note_type = prev_t.note_type();
        let pulse = ((beat - prev_m.beat()) / prev_m.note_divisor()) + prev_m.pulse();
        Tempo::new(prev_t.tempo_at_pulse(pulse) * note_type, note_type)
    }

    /// Frame at which the supplied tempo first occurs, or the frame of the
    /// last tempo section if the search is exhausted
    pub fn frame_at_tempo(&self, tempo: Tempo) -> FramePos {
        let metrics = self.metrics.read();
        frame_at_tempo_locked(&metrics, self.frame_rate(), tempo)
    }

    /// Quarter-note (quarter pulse) distance from origin to the frame.
    /// Ignores meter.
    pub fn quarter_note_at_frame(&self, frame: FramePos) -> f64 {
        let metrics = self.metrics.read();
        pulse_at_frame_locked(&metrics, self.frame_rate(), frame) * 4.0
    }

    /// Realtime-safe variant of
    /// [`quarter_note_at_frame`](Self::quarter_note_at_frame)
    pub fn quarter_note_at_frame_rt(&self, frame: FramePos) -> TactusResult<f64> {
        let metrics = self.metrics.try_read().ok_or(TactusError::Contention)?;
        Ok(pulse_at_frame_locked(&metrics, self.frame_rate(), frame) * 4.0)
    }

    /// Frame at the quarter-note distance
    pub fn frame_at_quarter_note(&self, quarter_note: f64) -> FramePos {
        let metrics = self.metrics.read();
        frame_at_pulse_locked(&metrics, self.frame_rate(), quarter_note / 4.0)
    }

    /// Exact beat subdivision closest to the frame. `sub_num > 1` snaps to
    /// `1/sub_num` of a beat, `1` snaps to the beat, `-1` snaps to the
    /// nearest bar.
    pub fn exact_beat_at_frame(&self, frame: FramePos, sub_num: i32) -> f64 {
        let metrics = self.metrics.read();
        exact_beat_at_frame_locked(&metrics, self.frame_rate(), frame, sub_num)
    }

    /// Frames of one beat at the frame. With a following section the
    /// covering ramp is evaluated at the frame, otherwise the terminal
    /// section is constant.
    pub fn frames_per_beat_at(&self, frame: FramePos) -> f64 {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();

        let mut ts_at: Option<&TempoSection> = None;
        let mut ts_after: Option<&TempoSection> = None;
        for s in metrics.iter() {
            if let Section::Tempo(t) = s {
                if !t.active() {
                    continue;
                }
                if ts_at.is_some() && t.frame() > frame {
                    ts_after = Some(t);
                    break;
                }
                ts_at = Some(t);
            }
        }
        let ts_at = match ts_at {
            Some(t) => t,
            None => return Tempo::DEFAULT.frames_per_beat(frame_rate),
        };

        if ts_after.is_some() {
            (60.0 * frame_rate as f64) / (ts_at.tempo_at_frame(frame, frame_rate) * ts_at.note_type())
        } else {
            ts_at.frames_per_beat(frame_rate)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Rounding
    // ─────────────────────────────────────────────────────────────────────────────

    /// Round a frame to a bar boundary
    pub fn round_to_bar(&self, frame: FramePos, dir: RoundMode) -> FramePos {
        self.round_to_type(frame, dir, BbtPointType::Bar)
    }

    /// Round a frame to a beat boundary
    pub fn round_to_beat(&self, frame: FramePos, dir: RoundMode) -> FramePos {
        self.round_to_type(frame, dir, BbtPointType::Beat)
    }

    /// Round a frame to a bar or beat boundary
    pub fn round_to_type(&self, frame: FramePos, dir: RoundMode, ty: BbtPointType) -> FramePos {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();
        let beat_at_framepos = beat_at_frame_locked(&metrics, frame_rate, frame).max(0.0);
        let mut bbt = bbt_at_beat_locked(&metrics, beat_at_framepos);

        match ty {
            BbtPointType::Bar => match dir {
                RoundMode::Down | RoundMode::DownMaybe => {
                    // bar previous to frame
                    bbt.beats = 1;
                    bbt.ticks = 0;
                    frame_at_bbt_locked(&metrics, frame_rate, bbt)
                }
                RoundMode::Up | RoundMode::UpMaybe => {
                    // bar following frame
                    bbt.bars += 1;
                    bbt.beats = 1;
                    bbt.ticks = 0;
                    frame_at_bbt_locked(&metrics, frame_rate, bbt)
                }
                RoundMode::Nearest => {
                    let raw_ft = frame_at_bbt_locked(&metrics, frame_rate, bbt);
                    bbt.beats = 1;
                    bbt.ticks = 0;
                    let prev_ft = frame_at_bbt_locked(&metrics, frame_rate, bbt);
                    bbt.bars += 1;
                    let next_ft = frame_at_bbt_locked(&metrics, frame_rate, bbt);

                    if (raw_ft - prev_ft) > (next_ft - prev_ft) / 2 {
                        next_ft
                    } else {
                        prev_ft
                    }
                }
            },
            BbtPointType::Beat => match dir {
                RoundMode::Down | RoundMode::DownMaybe => {
                    frame_at_beat_locked(&metrics, frame_rate, beat_at_framepos.floor())
                }
                RoundMode::Up | RoundMode::UpMaybe => {
                    frame_at_beat_locked(&metrics, frame_rate, beat_at_framepos.ceil())
                }
                RoundMode::Nearest => {
                    frame_at_beat_locked(&metrics, frame_rate, (beat_at_framepos + 0.5).floor())
                }
            },
        }
    }

    /// Round a frame to the closest subdivision of a beat. `sub_num` must
    /// divide the ticks in a beat.
    pub fn round_to_beat_subdivision(
        &self,
        frame: FramePos,
        sub_num: u32,
        dir: RoundMode,
    ) -> FramePos {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();
        let mut ticks =
            (beat_at_frame_locked(&metrics, frame_rate, frame).max(0.0) * TICKS_PER_BEAT).floor()
                as u32;
        let mut beats = (ticks as f64 / TICKS_PER_BEAT).floor() as u32;
        let ticks_one_subdivisions_worth = TICKS_PER_BEAT as u32 / sub_num;

        ticks -= beats * TICKS_PER_BEAT as u32;

        match dir {
            RoundMode::Up | RoundMode::UpMaybe => {
                let modulo = ticks % ticks_one_subdivisions_worth;
                if modulo == 0 && dir == RoundMode::UpMaybe {
                    // right on the subdivision
                } else if modulo == 0 {
                    ticks += ticks_one_subdivisions_worth;
                } else {
                    ticks += ticks_one_subdivisions_worth - modulo;
                }
                if ticks >= TICKS_PER_BEAT as u32 {
                    ticks -= TICKS_PER_BEAT as u32;
                    beats += 1;
                }
            }
            RoundMode::Down | RoundMode::DownMaybe => {
                let mut difference = ticks % ticks_one_subdivisions_worth;
                if difference == 0 && dir == RoundMode::Down {
                    // right on the subdivision, but force-rounding down
                    difference = ticks_one_subdivisions_worth;
                }
                if ticks < difference {
                    if beats == 0 {
                        ticks = 0;
                    } else {
                        beats -= 1;
                        ticks = TICKS_PER_BEAT as u32 - (difference - ticks);
                    }
                } else {
                    ticks -= difference;
                }
            }
            RoundMode::Nearest => {
                let rem = ticks % ticks_one_subdivisions_worth;
                if rem as f64 > ticks_one_subdivisions_worth as f64 / 2.0 {
                    // closer to the next subdivision
                    ticks += ticks_one_subdivisions_worth - rem;
                    if ticks >= TICKS_PER_BEAT as u32 {
                        ticks -= TICKS_PER_BEAT as u32;
                        beats += 1;
                    }
                } else {
                    // closer to the previous subdivision (or on it)
                    ticks -= rem;
                }
            }
        }

        frame_at_beat_locked(
            &metrics,
            frame_rate,
            beats as f64 + ticks as f64 / TICKS_PER_BEAT,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Grid
    // ─────────────────────────────────────────────────────────────────────────────

    /// Enumerate the integer beats covering `[lower, upper)`
    pub fn get_grid(&self, lower: FramePos, upper: FramePos) -> Vec<BbtPoint> {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();
        let mut points = Vec::new();

        // the map handles negative beats; bbt does not
        let mut cnt = beat_at_frame_locked(&metrics, frame_rate, lower).ceil().max(0.0);

        if frame_at_beat_locked(&metrics, frame_rate, cnt) >= upper {
            return points;
        }

        let mut pos = 0;
        while pos < upper {
            pos = frame_at_beat_locked(&metrics, frame_rate, cnt);
            let tempo_section = tempo_section_at_frame_locked(&metrics, pos);
            let meter_section = meter_section_at_frame_locked(&metrics, pos);
            points.push(BbtPoint {
                bbt: bbt_at_beat_locked(&metrics, cnt),
                frame: pos,
                tempo: tempo_at_frame_locked(&metrics, frame_rate, pos),
                meter: meter_section.meter(),
                c: tempo_section.c_func(),
            });
            cnt += 1.0;
        }

        points
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Beat-walk arithmetic
    // ─────────────────────────────────────────────────────────────────────────────

    /// Add (fractional) beats to a frame position, returning frames. The
    /// position may be negative.
    pub fn framepos_plus_beats(&self, pos: FramePos, beats: f64) -> FramePos {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();
        frame_at_beat_locked(
            &metrics,
            frame_rate,
            beat_at_frame_locked(&metrics, frame_rate, pos) + beats,
        )
    }

    /// Subtract (fractional) beats from a frame position, returning frames
    pub fn framepos_minus_beats(&self, pos: FramePos, beats: f64) -> FramePos {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();
        frame_at_beat_locked(
            &metrics,
            frame_rate,
            beat_at_frame_locked(&metrics, frame_rate, pos) - beats,
        )
    }

    /// Add a BBT interval to a frame position, carrying beats across meter
    /// changes
    pub fn framepos_plus_bbt(&self, pos: FramePos, op: Bbt) -> FramePos {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();

        let mut pos_bbt =
            bbt_at_beat_locked(&metrics, beat_at_frame_locked(&metrics, frame_rate, pos));
        pos_bbt.ticks += op.ticks;
        if pos_bbt.ticks as f64 >= TICKS_PER_BEAT {
            pos_bbt.beats += 1;
            pos_bbt.ticks -= TICKS_PER_BEAT as u32;
        }
        pos_bbt.beats += op.beats;

        // the meter in effect will start on the bar
        let mut divisions_per_bar = meter_section_at_beat_locked(
            &metrics,
            beat_at_bbt_locked(&metrics, Bbt::new(pos_bbt.bars + op.bars, 1, 0)),
        )
        .divisions_per_bar();
        while pos_bbt.beats as f64 >= divisions_per_bar + 1.0 {
            pos_bbt.bars += 1;
            divisions_per_bar = meter_section_at_beat_locked(
                &metrics,
                beat_at_bbt_locked(&metrics, Bbt::new(pos_bbt.bars + op.bars, 1, 0)),
            )
            .divisions_per_bar();
            pos_bbt.beats -= divisions_per_bar as u32;
        }
        pos_bbt.bars += op.bars;

        frame_at_bbt_locked(&metrics, frame_rate, pos_bbt)
    }

    /// Count the beats equivalent to `distance` when walking forward from
    /// `pos`
    pub fn framewalk_to_beats(&self, pos: FramePos, distance: FramePos) -> f64 {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();
        beat_at_frame_locked(&metrics, frame_rate, pos + distance)
            - beat_at_frame_locked(&metrics, frame_rate, pos)
    }

    /// Frame duration of a BBT interval starting at `pos`
    pub fn bbt_duration_at(&self, pos: FramePos, bbt: Bbt) -> FramePos {
        let metrics = self.metrics.read();
        let frame_rate = self.frame_rate();

        let tick_at_time =
            beat_at_frame_locked(&metrics, frame_rate, pos).max(0.0) * TICKS_PER_BEAT;
        let bbt_ticks = bbt.ticks as f64 + bbt.beats as f64 * TICKS_PER_BEAT;
        let total_beats = (tick_at_time + bbt_ticks) / TICKS_PER_BEAT;

        frame_at_beat_locked(&metrics, frame_rate, total_beats) - pos
    }
}
