//! Bar|Beat|Tick positions
//!
//! BBT positions are one-based in bars and beats, with ticks counted from
//! zero. The serialised text form is `bars|beats|ticks`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ticks per beat (fixed map-wide resolution)
pub const TICKS_PER_BEAT: f64 = 1920.0;

/// A musical position expressed against the meter in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bbt {
    /// Bar number (1-based)
    pub bars: u32,
    /// Beat within the bar (1-based)
    pub beats: u32,
    /// Tick within the beat, in [0, 1920)
    pub ticks: u32,
}

impl Bbt {
    pub fn new(bars: u32, beats: u32, ticks: u32) -> Self {
        Self { bars, beats, ticks }
    }

    /// Is this the first beat of a bar?
    pub fn is_bar_start(&self) -> bool {
        self.beats == 1 && self.ticks == 0
    }
}

impl Default for Bbt {
    fn default() -> Self {
        Self::new(1, 1, 0)
    }
}

impl fmt::Display for Bbt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.bars, self.beats, self.ticks)
    }
}

impl FromStr for Bbt {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let bars = parts
            .next()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .ok_or_else(|| format!("illegal BBT value {s:?}"))?;
        let beats = parts
            .next()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .ok_or_else(|| format!("illegal BBT value {s:?}"))?;
        let ticks = parts
            .next()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .ok_or_else(|| format!("illegal BBT value {s:?}"))?;
        if parts.next().is_some() {
            return Err(format!("illegal BBT value {s:?}"));
        }
        Ok(Self { bars, beats, ticks })
    }
}

impl TryFrom<String> for Bbt {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Bbt> for String {
    fn from(bbt: Bbt) -> Self {
        bbt.to_string()
    }
}
