//! Tempo map scenario tests
//!
//! End-to-end checks over solved maps:
//! - Beat-walk arithmetic across tempo and meter changes
//! - Ramped sections hitting their successor sample-exactly
//! - Rejected edits leaving the map byte-identical
//! - Rounding and grid enumeration
//! - Global ordering invariants after mutation sequences

use tactus::{
    Bbt, FramePos, Meter, PositionLockStyle, RoundMode, SectionId, Tempo, TempoMap, TempoType,
};

const SAMPLE_RATE: i64 = 48000;

/// 120 bpm constant from bar 1, 4/4 from bar 1
fn single_tempo_map() -> TempoMap {
    let map = TempoMap::new(SAMPLE_RATE);
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
    map
}

/// As [`single_tempo_map`], plus 240 bpm constant at bar 4 (pulse 3)
fn double_tempo_map() -> TempoMap {
    let map = single_tempo_map();
    map.add_tempo(
        Tempo::new(240.0, 4.0),
        3.0,
        0,
        TempoType::Constant,
        PositionLockStyle::MusicTime,
    );
    map
}

/// As [`double_tempo_map`], plus a 3/4 meter at bar 4
fn double_tempo_with_meter_map() -> TempoMap {
    let map = double_tempo_map();
    map.add_meter(
        Meter::new(3.0, 4.0),
        12.0,
        Bbt::new(4, 1, 0),
        0,
        PositionLockStyle::MusicTime,
    );
    map
}

fn movable_tempo_id(map: &TempoMap) -> SectionId {
    map.sections()
        .iter()
        .filter_map(|s| s.as_tempo())
        .find(|t| t.movable())
        .map(|t| t.id())
        .expect("map has a movable tempo")
}

// ═══════════════════════════════════════════════════════════════════════════════
// BEAT-WALK ARITHMETIC
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_single_tempo_framepos_plus_beats() {
    let map = single_tempo_map();
    let frames_per_beat = 24_000;

    // add 1 beat to beat 3 of the first bar
    assert_eq!(
        map.framepos_plus_beats(2 * frames_per_beat, 1.0),
        3 * frames_per_beat
    );

    // add 4 beats to a negative frame one beat before zero
    assert_eq!(
        map.framepos_plus_beats(-frames_per_beat, 4.0),
        3 * frames_per_beat
    );
}

#[test]
fn test_double_tempo_framepos_plus_beats() {
    let map = double_tempo_map();

    // add 1 beat to 1|2
    assert_eq!(map.framepos_plus_beats(24_000, 1.0), 48_000);

    // add 2 beats to 3|4, over the tempo change
    assert_eq!(map.framepos_plus_beats(264_000, 2.0), 300_000);

    // add 2.5 beats to 3|3|960, over the tempo change
    assert_eq!(map.framepos_plus_beats(252_000, 2.5), 300_000);
}

#[test]
fn test_double_tempo_with_meter_framepos_plus_beats() {
    // a meter change at the tempo change must not affect beat arithmetic
    let map = double_tempo_with_meter_map();

    assert_eq!(map.framepos_plus_beats(24_000, 1.0), 48_000);
    assert_eq!(map.framepos_plus_beats(264_000, 2.0), 300_000);
    assert_eq!(map.framepos_plus_beats(252_000, 2.5), 300_000);
}

#[test]
fn test_framepos_minus_beats_inverts_plus() {
    let map = double_tempo_map();
    let moved = map.framepos_plus_beats(264_000, 2.0);
    assert_eq!(map.framepos_minus_beats(moved, 2.0), 264_000);
}

#[test]
fn test_framewalk_to_beats_across_tempo_change() {
    let map = double_tempo_map();
    // 264e3 -> 300e3 spans one 120 bpm beat and one 240 bpm beat
    let beats = map.framewalk_to_beats(264_000, 36_000);
    assert!((beats - 2.0).abs() < 1e-9);
}

#[test]
fn test_framepos_plus_bbt() {
    let map = single_tempo_map();
    // one bar from 1|1|0 is 2|1|0
    assert_eq!(map.framepos_plus_bbt(0, Bbt::new(1, 0, 0)), 96_000);
    // one beat and a half from 1|1|0
    assert_eq!(map.framepos_plus_bbt(0, Bbt::new(0, 1, 960)), 36_000);
}

// ═══════════════════════════════════════════════════════════════════════════════
// RAMPS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_ramp_60_to_120_closed_form() {
    // 60 ppm ramping to 120 ppm one pulse later: c fits to 60 and the
    // pulse boundary lands at log(2) * 60 * 48000 / c frames
    let map = TempoMap::new(SAMPLE_RATE);
    map.replace_tempo(
        map.first_tempo().id(),
        Tempo::new(60.0, 1.0),
        0.0,
        0,
        TempoType::Ramp,
        PositionLockStyle::AudioTime,
    );
    map.add_tempo(
        Tempo::new(120.0, 1.0),
        1.0,
        0,
        TempoType::Ramp,
        PositionLockStyle::MusicTime,
    );

    let expected = (std::f64::consts::LN_2 * 60.0 * SAMPLE_RATE as f64 / 60.0 + 0.5).floor()
        as FramePos;
    assert_eq!(expected, 33_271);
    assert_eq!(map.frame_at_pulse(1.0), expected);

    let first = map.first_tempo();
    assert!((first.c_func() - 60.0).abs() < 1e-9);
}

#[test]
fn test_ramp_hits_next_section_frame() {
    // 77 bpm ramping to 217 bpm one minute in, both audio-locked
    let map = TempoMap::new(SAMPLE_RATE);
    map.replace_tempo(
        map.first_tempo().id(),
        Tempo::new(77.0, 4.0),
        0.0,
        0,
        TempoType::Ramp,
        PositionLockStyle::AudioTime,
    );
    map.add_tempo(
        Tempo::new(217.0, 4.0),
        0.0,
        60 * SAMPLE_RATE,
        TempoType::Ramp,
        PositionLockStyle::AudioTime,
    );

    let tempos: Vec<_> = map
        .sections()
        .iter()
        .filter_map(|s| s.as_tempo().copied())
        .collect();
    assert_eq!(tempos.len(), 2);
    let (a, b) = (tempos[0], tempos[1]);

    assert_eq!(b.frame(), 60 * SAMPLE_RATE);
    assert_eq!(a.frame_at_tempo(b.pulses_per_minute(), 300.0, SAMPLE_RATE), b.frame());
    assert_eq!(a.frame_at_pulse(b.pulse(), SAMPLE_RATE), b.frame());

    // frame -> pulse -> frame is sample-exact mid-ramp
    let target = 20 * SAMPLE_RATE;
    assert_eq!(
        a.frame_at_pulse(a.pulse_at_frame(target, SAMPLE_RATE), SAMPLE_RATE),
        target
    );

    // the ramp is within one sample of the round-tripped integral
    // everywhere we probe it
    for pulse_offset in [0.25, 0.5, 1.0, 50.0, 123.456] {
        let p = a.pulse() + pulse_offset;
        let f = a.frame_at_pulse(p, SAMPLE_RATE);
        let back = a.frame_at_pulse(a.pulse_at_frame(f, SAMPLE_RATE), SAMPLE_RATE);
        assert!((back - f).abs() <= 1);
    }
}

#[test]
fn test_tempo_at_frame_evaluates_ramp() {
    let map = TempoMap::new(SAMPLE_RATE);
    map.replace_tempo(
        map.first_tempo().id(),
        Tempo::new(77.0, 4.0),
        0.0,
        0,
        TempoType::Ramp,
        PositionLockStyle::AudioTime,
    );
    map.add_tempo(
        Tempo::new(217.0, 4.0),
        0.0,
        60 * SAMPLE_RATE,
        TempoType::Ramp,
        PositionLockStyle::AudioTime,
    );

    assert!((map.tempo_at_frame(0).beats_per_minute() - 77.0).abs() < 1e-9);
    // past the last section the tempo is its nominal rate
    assert!((map.tempo_at_frame(61 * SAMPLE_RATE).beats_per_minute() - 217.0).abs() < 1e-9);
    // mid-ramp the rate is strictly between the endpoints
    let mid = map.tempo_at_frame(30 * SAMPLE_RATE).beats_per_minute();
    assert!(mid > 77.0 && mid < 217.0);

    // frame_at_tempo inverts the ramp for a bracketed rate
    let frame = map.frame_at_tempo(Tempo::new(125.0, 4.0));
    let there = map.tempo_at_frame(frame).beats_per_minute();
    assert!((there - 125.0).abs() < 0.01);
}

// ═══════════════════════════════════════════════════════════════════════════════
// REJECTED EDITS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_rejected_move_leaves_state_unchanged() {
    let map = double_tempo_map();
    let before = map.get_state();
    let id = movable_tempo_id(&map);

    // moving the second tempo to a frame earlier than the first is refused
    assert!(!map.gui_move_tempo(id, -24_000, 0));
    assert_eq!(map.get_state(), before);

    assert!(!map.gui_move_tempo(id, 0, 0));
    assert_eq!(map.get_state(), before);
}

#[test]
fn test_accepted_edits_keep_invariants() {
    let map = double_tempo_with_meter_map();
    let id = movable_tempo_id(&map);

    assert!(map.gui_move_tempo(id, 240_000, 0));
    assert!(map.gui_change_tempo(id, Tempo::new(200.0, 4.0)));
    map.change_initial_tempo(110.0, 4.0);

    assert_invariants(&map);
}

/// The global invariants that must hold after every successful mutation
fn assert_invariants(map: &TempoMap) {
    let sections = map.sections();

    // exactly one non-movable tempo and meter, both at (0, 0)
    let pinned_tempi: Vec<_> = sections
        .iter()
        .filter_map(|s| s.as_tempo())
        .filter(|t| !t.movable())
        .collect();
    let pinned_meters: Vec<_> = sections
        .iter()
        .filter_map(|s| s.as_meter())
        .filter(|m| !m.movable())
        .collect();
    assert_eq!(pinned_tempi.len(), 1);
    assert_eq!(pinned_meters.len(), 1);
    assert_eq!(pinned_tempi[0].frame(), 0);
    assert_eq!(pinned_tempi[0].pulse(), 0.0);
    assert_eq!(pinned_meters[0].frame(), 0);
    assert_eq!(pinned_meters[0].pulse(), 0.0);

    // active tempi strictly monotone in frame and pulse, |c| bounded
    let tempi: Vec<_> = sections
        .iter()
        .filter_map(|s| s.as_tempo())
        .filter(|t| t.active())
        .collect();
    for pair in tempi.windows(2) {
        assert!(pair[0].frame() < pair[1].frame());
        assert!(pair[0].pulse() < pair[1].pulse());
        assert!(pair[0].c_func().abs() <= 1000.0);
    }

    // meters strictly monotone, non-decreasing beats, on bar starts, and
    // bar-consistent with their predecessor
    let meters: Vec<_> = sections.iter().filter_map(|s| s.as_meter()).collect();
    for m in &meters {
        assert!(m.bbt().is_bar_start());
    }
    for pair in meters.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(a.frame() < b.frame());
        assert!(a.pulse() < b.pulse());
        assert!(a.beat() <= b.beat());
        let expected_pulse = a.pulse()
            + (b.bbt().bars as f64 - a.bbt().bars as f64) * a.divisions_per_bar()
                / a.note_divisor();
        assert!((b.pulse() - expected_pulse).abs() < 1e-9);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUNDING AND GRID
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_round_to_bar() {
    let map = double_tempo_with_meter_map();
    let at_2_2 = map.frame_at_bbt(Bbt::new(2, 2, 0));

    assert_eq!(
        map.round_to_bar(at_2_2, RoundMode::Nearest),
        map.frame_at_bbt(Bbt::new(2, 1, 0))
    );
    assert_eq!(
        map.round_to_bar(at_2_2, RoundMode::Up),
        map.frame_at_bbt(Bbt::new(3, 1, 0))
    );
}

#[test]
fn test_round_to_beat() {
    let map = single_tempo_map();
    assert_eq!(map.round_to_beat(25_000, RoundMode::Nearest), 24_000);
    assert_eq!(map.round_to_beat(25_000, RoundMode::Up), 48_000);
    assert_eq!(map.round_to_beat(25_000, RoundMode::Down), 24_000);
}

#[test]
fn test_round_to_beat_subdivision() {
    let map = single_tempo_map();
    // 1/4 of a beat is 6000 frames at 120 bpm
    assert_eq!(
        map.round_to_beat_subdivision(7_000, 4, RoundMode::Nearest),
        6_000
    );
    assert_eq!(
        map.round_to_beat_subdivision(7_000, 4, RoundMode::Up),
        12_000
    );
    assert_eq!(
        map.round_to_beat_subdivision(7_000, 4, RoundMode::Down),
        6_000
    );
    // on the boundary, Up forces the next subdivision and UpMaybe stays
    assert_eq!(
        map.round_to_beat_subdivision(6_000, 4, RoundMode::Up),
        12_000
    );
    assert_eq!(
        map.round_to_beat_subdivision(6_000, 4, RoundMode::UpMaybe),
        6_000
    );
    assert_eq!(
        map.round_to_beat_subdivision(6_000, 4, RoundMode::Down),
        0
    );
    assert_eq!(
        map.round_to_beat_subdivision(6_000, 4, RoundMode::DownMaybe),
        6_000
    );
}

#[test]
fn test_exact_beat_at_frame() {
    let map = single_tempo_map();
    // halfway into beat 1, snapping to halves picks 1.5
    let f = 36_000;
    assert_eq!(map.exact_beat_at_frame(f, 2), 1.5);
    assert_eq!(map.exact_beat_at_frame(f, 1), 2.0);
    // snapping to bar from 1|2|960 lands back on bar 1
    assert_eq!(map.exact_beat_at_frame(f, -1), 0.0);
    // past the bar midpoint the bar snap goes forward
    assert_eq!(map.exact_beat_at_frame(60_000, -1), 4.0);
}

#[test]
fn test_get_grid_enumerates_beats() {
    let map = double_tempo_with_meter_map();
    let points = map.get_grid(0, 192_000);

    assert_eq!(points.len(), 9);
    for (i, p) in points.iter().enumerate() {
        assert_eq!(p.frame, i as FramePos * 24_000);
        assert!((p.tempo.beats_per_minute() - 120.0).abs() < 1e-9);
        assert!((p.meter.divisions_per_bar() - 4.0).abs() < 1e-9);
    }
    assert_eq!(points[0].bbt, Bbt::new(1, 1, 0));
    assert_eq!(points[4].bbt, Bbt::new(2, 1, 0));
    assert_eq!(points[5].bbt, Bbt::new(2, 2, 0));
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUND TRIPS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_frame_beat_frame_is_exact() {
    let map = double_tempo_map();
    // frames chosen on binary-exact pulse fractions of 96000 frames per
    // pulse, plus the seeded scenario positions
    for f in [0, 375, 24_000, 48_000, 96_375, 252_000, 264_000, 288_000, 300_000] {
        assert_eq!(map.frame_at_beat(map.beat_at_frame(f)), f, "frame {f}");
    }
}

#[test]
fn test_beat_space_roundtrips() {
    let map = double_tempo_with_meter_map();
    for beat in [0.0, 1.0, 2.5, 11.0, 12.0, 13.25] {
        let bbt = map.bbt_at_beat(beat);
        assert!((map.beat_at_bbt(bbt) - beat).abs() < 1e-9, "beat {beat}");

        let pulse = map.pulse_at_beat(beat);
        assert!((map.beat_at_pulse(pulse) - beat).abs() < 1e-9, "beat {beat}");
    }
}

#[test]
fn test_quarter_note_is_pulse_times_four() {
    let map = double_tempo_map();
    for f in [0, 24_000, 264_000, 300_000] {
        assert_eq!(map.quarter_note_at_frame(f), map.pulse_at_frame(f) * 4.0);
    }
    assert_eq!(map.frame_at_quarter_note(12.0), map.frame_at_pulse(3.0));
}

#[test]
fn test_rt_queries_succeed_without_contention() {
    let map = double_tempo_map();
    assert_eq!(
        map.bbt_at_frame_rt(24_000).expect("uncontended read"),
        Bbt::new(1, 2, 0)
    );
    let qn = map.quarter_note_at_frame_rt(24_000).expect("uncontended read");
    assert_eq!(qn, 1.0);
    let pulse = map.pulse_at_bbt_rt(Bbt::new(4, 1, 0)).expect("uncontended read");
    assert_eq!(pulse, 3.0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// METER MOVES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_music_locked_meter_move() {
    let map = double_tempo_with_meter_map();
    let meter_id = map
        .sections()
        .iter()
        .filter_map(|s| s.as_meter())
        .find(|m| m.movable())
        .map(|m| m.id())
        .expect("map has a movable meter");

    // drag the bar-4 meter to around bar 3
    let target = map.frame_at_bbt(Bbt::new(3, 1, 0));
    assert!(map.gui_move_meter(meter_id, target));

    let meter = map
        .sections()
        .iter()
        .filter_map(|s| s.as_meter())
        .find(|m| m.id() == meter_id)
        .copied()
        .expect("meter still present");
    assert_eq!(meter.bbt(), Bbt::new(3, 1, 0));
    assert_invariants(&map);
}

#[test]
fn test_meter_cannot_land_on_an_occupied_bar() {
    let map = double_tempo_with_meter_map();
    let before = map.get_state();
    let meter_id = map
        .sections()
        .iter()
        .filter_map(|s| s.as_meter())
        .find(|m| m.movable())
        .map(|m| m.id())
        .expect("map has a movable meter");

    // bar 1 is the non-movable meter's bar
    assert!(!map.gui_move_meter(meter_id, 0));
    assert_eq!(map.get_state(), before);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DILATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_dilate_constant_tempo() {
    let map = single_tempo_map();
    let first_id = map.first_tempo().id();

    // drag the pulse under frame 96e3 out to frame 120e3: the initial
    // tempo slows by the frame ratio
    assert!(map.gui_dilate_tempo(first_id, 96_000, 120_000, 1.0));
    let bpm = map.first_tempo().beats_per_minute();
    assert!((bpm - 96.0).abs() < 1e-9, "bpm {bpm}");
}

#[test]
fn test_dilate_rejects_vanishing_rate() {
    let map = single_tempo_map();
    let before = map.get_state();
    let first_id = map.first_tempo().id();

    // stretching one pulse across ten minutes would need a rate below the
    // minimum; the drag is abandoned and the map untouched
    assert!(!map.gui_dilate_tempo(first_id, 96_000, 48_000_000, 1.0));
    assert_eq!(map.get_state(), before);
}
