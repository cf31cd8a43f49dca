//! tactus: a musical-time engine
//!
//! A tempo map that maps bidirectionally between three time domains:
//! - Audio time: integer sample frames at a fixed sample rate
//! - Musical pulse: whole-note pulses since the session origin
//! - BBT: Bar|Beat|Tick positions under a piecewise meter
//!
//! Tempo sections may be constant or ramp exponentially into their
//! successor, and every section is anchored either to a frame (audio
//! time) or to a musical position (music time). Edits are solved: a
//! mutation is proposed on a scratch copy of the map and applied only if
//! the result keeps every section consistently ordered in both frame and
//! pulse. Queries run under a read lease; a small realtime-safe subset
//! fails fast on lock contention instead of blocking.

mod bbt;
mod error;
mod map;
mod meter;
mod query;
mod section;
mod solver;
mod state;
mod tempo;

pub use bbt::*;
pub use error::*;
pub use map::{MapChanged, TempoMap};
pub use meter::*;
pub use query::{BbtPoint, BbtPointType, RoundMode};
pub use section::{Metrics, PositionLockStyle, Section, SectionId};
pub use state::*;
pub use tempo::*;

/// Sample position on the session timeline. Negative positions arise in
/// beat-walk arithmetic reaching before the session start.
pub type FramePos = i64;

/// Sample counts and the map's fixed sample rate
pub type FrameCnt = i64;
