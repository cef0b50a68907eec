//! Gain mapping between rtl_tcp gain arguments and native gain stages.
//!
//! rtl_tcp clients express gain in tenths of a dB (-10 is the bottom of the
//! range, 490 the top). Backends without an R820T style gain table map that
//! onto a 0-100 percentage and scale it into each stage independently.

/// An independently controllable amplifier with its own native range `0..=max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainStage {
    pub name: &'static str,
    pub max: u32,
}

/// HackRF RF amplifier (LNA), 0-40 dB
pub const HACKRF_LNA: GainStage = GainStage {
    name: "lna",
    max: 40,
};

/// HackRF baseband amplifier (VGA), 0-62 dB
pub const HACKRF_VGA: GainStage = GainStage {
    name: "vga",
    max: 62,
};

/// Fixed gains applied when a client asks for automatic gain on a
/// device that has no automatic mode
pub const DEFAULT_LNA_GAIN: u32 = 30;
pub const DEFAULT_VGA_GAIN: u32 = 32;

/// `(tenths + 10) / 5` with integer division truncating toward zero
pub fn rtl_gain_to_percentage(tenths_of_db: i32) -> i64 {
    (i64::from(tenths_of_db) + 10) / 5
}

impl GainStage {
    /// Scale a percentage into this stage, clamped to `0..=max`
    pub fn scale(&self, percentage: i64) -> u32 {
        let max = i64::from(self.max);
        (percentage * max / 100).clamp(0, max) as u32
    }

    pub fn from_rtl_gain(&self, tenths_of_db: i32) -> u32 {
        self.scale(rtl_gain_to_percentage(tenths_of_db))
    }
}

/// Index into a gain table for a 0-100 percentage, `None` when the table is empty
pub fn table_index_for_percentage(percentage: u32, count: usize) -> Option<usize> {
    if count == 0 {
        return None;
    }
    let index = u64::from(percentage) * count as u64 / 100;
    Some((index as usize).min(count - 1))
}
