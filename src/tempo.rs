//! Tempo values and tempo sections
//!
//! A tempo supplies the musical pulse. `beats_per_minute` counts
//! note-type divisions per minute, so the whole-pulse rate is
//! `beats_per_minute / note_type`.
//!
//! ## Ramps
//!
//! A ramped section accelerates exponentially into the next section.
//! With a starting pulse rate T0 (pulses per minute) the rate at local
//! time t (minutes) is
//!
//! ```text
//! T(t) = T0 * e^(c*t)
//! ```
//!
//! Integrating gives the pulse elapsed at time t and its inverse:
//!
//! ```text
//! P(t) = T0 * (e^(c*t) - 1) / c
//! t(p) = log(1 + c*p / T0) / c
//! ```
//!
//! The constant `c` is fitted from the next section: knowing its rate Ta
//! and its distance in pulses b, `c = T0 * (e^(log(Ta/T0)) - 1) / b`;
//! knowing instead its distance in minutes a, `c = log(Ta/T0) / a`.
//! The math follows Schacher & Neukom, "Where's the Beat? Tools for
//! Dynamic Tempo Calculations" (ICMC 2007).

use serde::{Deserialize, Serialize};

use crate::section::{next_section_id, PositionLockStyle, SectionId};
use crate::{Bbt, FrameCnt, FramePos};

/// Minimum tempo accepted by rate edits
pub const MIN_TEMPO: f64 = 0.5;

/// Maximum tempo accepted by rate edits
pub const MAX_TEMPO: f64 = 1000.0;

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO VALUE
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable tempo: note-type divisions per minute, and which
/// power-of-two note one division is
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tempo {
    beats_per_minute: f64,
    note_type: f64,
}

impl Tempo {
    /// Session default (quarter = 120)
    pub const DEFAULT: Self = Self {
        beats_per_minute: 120.0,
        note_type: 4.0,
    };

    pub fn new(beats_per_minute: f64, note_type: f64) -> Self {
        Self {
            beats_per_minute,
            note_type,
        }
    }

    /// Note-type divisions per minute. Despite the name, this has nothing
    /// to do with meter beats.
    pub fn beats_per_minute(&self) -> f64 {
        self.beats_per_minute
    }

    /// Which note a division is (4 = quarter, 8 = eighth, ...)
    pub fn note_type(&self) -> f64 {
        self.note_type
    }

    /// Whole-note pulses per minute
    pub fn pulses_per_minute(&self) -> f64 {
        self.beats_per_minute / self.note_type
    }

    /// Frames of one division at this rate
    pub fn frames_per_beat(&self, frame_rate: FrameCnt) -> f64 {
        (60.0 * frame_rate as f64) / self.beats_per_minute
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// How a tempo section reaches the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempoType {
    /// Pulse advances linearly in time
    #[default]
    Constant,
    /// Pulse rate grows exponentially to the next section's rate
    Ramp,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO SECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A tempo anchored at a (pulse, frame) pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoSection {
    pub(crate) id: SectionId,
    pub(crate) tempo: Tempo,
    pub(crate) pulse: f64,
    pub(crate) frame: FramePos,
    pub(crate) ty: TempoType,
    pub(crate) lock_style: PositionLockStyle,
    pub(crate) movable: bool,
    pub(crate) active: bool,
    pub(crate) locked_to_meter: bool,
    /// Exponential constant used to reach the next section. Only valid
    /// while the metrics list is solved; the terminal section has 0.
    pub(crate) c: f64,
    /// Set while loading a legacy record whose position was a bare BBT
    pub(crate) legacy_bbt: Option<Bbt>,
}

impl TempoSection {
    pub fn new(
        pulse: f64,
        frame: FramePos,
        tempo: Tempo,
        ty: TempoType,
        lock_style: PositionLockStyle,
    ) -> Self {
        Self {
            id: next_section_id(),
            tempo,
            pulse,
            frame,
            ty,
            lock_style,
            movable: true,
            active: true,
            locked_to_meter: false,
            c: 0.0,
            legacy_bbt: None,
        }
    }

    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn tempo(&self) -> Tempo {
        self.tempo
    }

    pub fn beats_per_minute(&self) -> f64 {
        self.tempo.beats_per_minute()
    }

    pub fn note_type(&self) -> f64 {
        self.tempo.note_type()
    }

    pub fn pulses_per_minute(&self) -> f64 {
        self.tempo.pulses_per_minute()
    }

    pub fn pulse(&self) -> f64 {
        self.pulse
    }

    pub fn frame(&self) -> FramePos {
        self.frame
    }

    pub fn tempo_type(&self) -> TempoType {
        self.ty
    }

    pub fn position_lock_style(&self) -> PositionLockStyle {
        self.lock_style
    }

    pub fn movable(&self) -> bool {
        self.movable
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn locked_to_meter(&self) -> bool {
        self.locked_to_meter
    }

    pub fn c_func(&self) -> f64 {
        self.c
    }

    /// Frames of one whole pulse at this section's own rate
    pub fn frames_per_pulse(&self, frame_rate: FrameCnt) -> f64 {
        (frame_rate as f64 * 60.0) / self.pulses_per_minute()
    }

    /// Frames of one division at this section's own rate
    pub fn frames_per_beat(&self, frame_rate: FrameCnt) -> f64 {
        self.tempo.frames_per_beat(frame_rate)
    }

    fn is_linear(&self) -> bool {
        self.ty == TempoType::Constant || self.c == 0.0
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Session-relative conversions
    // ─────────────────────────────────────────────────────────────────────────────

    /// Pulse rate (whole pulses per minute) at a session-relative frame
    pub fn tempo_at_frame(&self, frame: FramePos, frame_rate: FrameCnt) -> f64 {
        if self.is_linear() {
            return self.pulses_per_minute();
        }
        self.ppm_at_time(Self::frame_to_minute(frame - self.frame, frame_rate))
    }

    /// Session-relative frame at which the given pulse rate occurs within
    /// this section. The pulse argument is only used for linear sections.
    pub fn frame_at_tempo(&self, ppm: f64, pulse: f64, frame_rate: FrameCnt) -> FramePos {
        if self.is_linear() {
            return ((pulse - self.pulse) * self.frames_per_pulse(frame_rate)) as FramePos
                + self.frame;
        }
        Self::minute_to_frame(self.time_at_ppm(ppm), frame_rate) + self.frame
    }

    /// Pulse rate at a session-relative pulse
    pub fn tempo_at_pulse(&self, pulse: f64) -> f64 {
        if self.is_linear() {
            return self.pulses_per_minute();
        }
        self.ppm_at_pulse(pulse - self.pulse)
    }

    /// Session-relative pulse at which the given pulse rate occurs. The
    /// frame argument is only used for linear sections.
    pub fn pulse_at_tempo(&self, ppm: f64, frame: FramePos, frame_rate: FrameCnt) -> f64 {
        if self.is_linear() {
            return ((frame - self.frame) as f64 / self.frames_per_pulse(frame_rate)) + self.pulse;
        }
        self.pulse_at_ppm(ppm) + self.pulse
    }

    /// Session-relative pulse at a session-relative frame
    pub fn pulse_at_frame(&self, frame: FramePos, frame_rate: FrameCnt) -> f64 {
        if self.is_linear() {
            return ((frame - self.frame) as f64 / self.frames_per_pulse(frame_rate)) + self.pulse;
        }
        self.pulse_at_time(Self::frame_to_minute(frame - self.frame, frame_rate)) + self.pulse
    }

    /// Session-relative frame at a session-relative pulse
    pub fn frame_at_pulse(&self, pulse: f64, frame_rate: FrameCnt) -> FramePos {
        if self.is_linear() {
            return ((pulse - self.pulse) * self.frames_per_pulse(frame_rate)).floor() as FramePos
                + self.frame;
        }
        Self::minute_to_frame(self.time_at_pulse(pulse - self.pulse), frame_rate) + self.frame
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Ramp constant fitting
    // ─────────────────────────────────────────────────────────────────────────────

    /// Fit the ramp constant from the next section's rate and its
    /// session-relative pulse
    pub fn compute_c_pulse(&self, end_ppm: f64, end_pulse: f64) -> f64 {
        let log_tempo_ratio = (end_ppm / self.pulses_per_minute()).ln();
        self.pulses_per_minute() * log_tempo_ratio.exp_m1() / (end_pulse - self.pulse)
    }

    /// Fit the ramp constant from the next section's rate and its
    /// session-relative frame
    pub fn compute_c_frame(&self, end_ppm: f64, end_frame: FramePos, frame_rate: FrameCnt) -> f64 {
        self.c_at_time(end_ppm, Self::frame_to_minute(end_frame - self.frame, frame_rate))
    }

    pub(crate) fn minute_to_frame(time: f64, frame_rate: FrameCnt) -> FramePos {
        ((time * 60.0 * frame_rate as f64) + 0.5).floor() as FramePos
    }

    pub(crate) fn frame_to_minute(frame: FramePos, frame_rate: FrameCnt) -> f64 {
        (frame as f64 / frame_rate as f64) / 60.0
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Local ramp formulas (time in minutes, pulse as offset into section)
    // ─────────────────────────────────────────────────────────────────────────────

    fn c_at_time(&self, end_ppm: f64, end_time: f64) -> f64 {
        (end_ppm / self.pulses_per_minute()).ln() / end_time
    }

    fn ppm_at_time(&self, time: f64) -> f64 {
        (self.c * time).exp() * self.pulses_per_minute()
    }

    fn time_at_ppm(&self, ppm: f64) -> f64 {
        (ppm / self.pulses_per_minute()).ln() / self.c
    }

    fn ppm_at_pulse(&self, pulse: f64) -> f64 {
        (pulse * self.c) + self.pulses_per_minute()
    }

    fn pulse_at_ppm(&self, ppm: f64) -> f64 {
        (ppm - self.pulses_per_minute()) / self.c
    }

    fn pulse_at_time(&self, time: f64) -> f64 {
        (self.c * time).exp_m1() * (self.pulses_per_minute() / self.c)
    }

    fn time_at_pulse(&self, pulse: f64) -> f64 {
        ((self.c * pulse) / self.pulses_per_minute()).ln_1p() / self.c
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const SR: FrameCnt = 48000;

    #[test]
    fn test_tempo_value() {
        let t = Tempo::new(120.0, 4.0);
        assert_eq!(t.pulses_per_minute(), 30.0);
        assert_eq!(t.frames_per_beat(SR), 24000.0);

        let eighths = Tempo::new(120.0, 8.0);
        assert_eq!(eighths.pulses_per_minute(), 15.0);
    }

    #[test]
    fn test_constant_section_linear_math() {
        let t = TempoSection::new(
            0.0,
            0,
            Tempo::new(120.0, 4.0),
            TempoType::Constant,
            PositionLockStyle::AudioTime,
        );
        assert_eq!(t.frames_per_pulse(SR), 96000.0);
        assert_eq!(t.pulse_at_frame(48000, SR), 0.5);
        assert_eq!(t.frame_at_pulse(0.5, SR), 48000);
        assert_eq!(t.tempo_at_frame(123456, SR), 30.0);
    }

    #[test]
    fn test_ramp_hits_next_section() {
        // 77 bpm ramping to 217 bpm one minute in
        let mut a = TempoSection::new(
            0.0,
            0,
            Tempo::new(77.0, 4.0),
            TempoType::Ramp,
            PositionLockStyle::AudioTime,
        );
        let b_ppm = 217.0 / 4.0;
        let b_frame = 60 * SR;
        a.c = a.compute_c_frame(b_ppm, b_frame, SR);

        assert_eq!(a.frame_at_tempo(b_ppm, 300.0, SR), b_frame);
        let b_pulse = a.pulse_at_frame(b_frame, SR);
        assert_eq!(a.frame_at_pulse(b_pulse, SR), b_frame);
    }

    #[test]
    fn test_ramp_tempo_pulse_inverses() {
        let mut a = TempoSection::new(
            0.0,
            0,
            Tempo::new(77.0, 4.0),
            TempoType::Ramp,
            PositionLockStyle::AudioTime,
        );
        a.c = a.compute_c_frame(217.0 / 4.0, 60 * SR, SR);

        let probe = 125.0 / 4.0;
        let roundtrip = a.tempo_at_pulse(a.pulse_at_tempo(probe, 0, SR));
        assert!((roundtrip - probe).abs() < 1e-12);

        // frame -> pulse -> frame is sample-exact 20 seconds in
        let target = 20 * SR;
        assert_eq!(a.frame_at_pulse(a.pulse_at_frame(target, SR), SR), target);
    }

    #[test]
    fn test_c_fit_from_pulse_matches_rate_step() {
        // 60 -> 120 whole pulses per minute over one pulse: c = T0 * expm1(ln 2)
        let a = TempoSection::new(
            0.0,
            0,
            Tempo::new(60.0, 1.0),
            TempoType::Ramp,
            PositionLockStyle::AudioTime,
        );
        let c = a.compute_c_pulse(120.0, 1.0);
        assert!((c - 60.0).abs() < 1e-9);
    }
}
