//! Timing source selection for lap finalization (spec §4.2.3).

/// Session-time leakage threshold: a primary/fallback reading whose
/// magnitude exceeds this is treated as stale data from an unrelated lap.
pub const LEAKAGE_THRESHOLD_SECS: f64 = 300.0;

/// Calculated durations shorter than this are suspicious (likely a
/// buffering gap), which biases selection back towards the primary
/// reading when it's otherwise plausible.
pub const SHORT_CALCULATED_THRESHOLD_SECS: f64 = 5.0;

/// Discrepancy between primary and calculated duration worth logging.
pub const DISCREPANCY_LOG_THRESHOLD_SECS: f64 = 0.1;

/// Default wall-clock delay before the per-car timing field is trusted.
pub const DEFAULT_TIMING_DELAY_SECS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingSource {
    /// Primary (per-car) reading, positive and plausible.
    Primary,
    /// Primary reading was negative (out-lap marker); abs() used for display.
    PrimaryNegative,
    /// Primary unusable (zero, unpopulated, or leaked); calculated duration used.
    Calculated,
}

#[derive(Debug, Clone, Copy)]
pub struct TimingSelection {
    pub duration: f64,
    pub source: TimingSource,
}

/// Select the duration to persist for a lap given the raw signed primary
/// timing reading (per-car time, or the global fallback when substituted
/// wholesale during multi-increment recovery) and the calculated
/// (end_tick - start_tick) duration.
pub fn select_duration(primary_raw: f64, calculated: f64) -> TimingSelection {
    if primary_raw == 0.0 {
        return TimingSelection {
            duration: calculated,
            source: TimingSource::Calculated,
        };
    }
    if primary_raw.abs() > LEAKAGE_THRESHOLD_SECS {
        return TimingSelection {
            duration: calculated,
            source: TimingSource::Calculated,
        };
    }
    if primary_raw < 0.0 {
        return TimingSelection {
            duration: primary_raw.abs(),
            source: TimingSource::PrimaryNegative,
        };
    }
    // primary_raw > 0.0 and plausible: prefer it even when the calculated
    // duration is suspiciously short (SHORT_CALCULATED_THRESHOLD_SECS) —
    // a short calculated duration is itself evidence of a buffering gap,
    // not evidence that primary is wrong.
    TimingSelection {
        duration: primary_raw,
        source: TimingSource::Primary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_primary_uses_calculated() {
        let sel = select_duration(0.0, 82.3);
        assert_eq!(sel.source, TimingSource::Calculated);
        assert_eq!(sel.duration, 82.3);
    }

    #[test]
    fn leaked_primary_uses_calculated() {
        let sel = select_duration(4000.0, 82.3);
        assert_eq!(sel.source, TimingSource::Calculated);
        assert_eq!(sel.duration, 82.3);
    }

    #[test]
    fn negative_primary_uses_absolute_value() {
        let sel = select_duration(-45.0, 45.2);
        assert_eq!(sel.source, TimingSource::PrimaryNegative);
        assert_eq!(sel.duration, 45.0);
    }

    #[test]
    fn positive_primary_preferred_even_if_calculated_is_short() {
        let sel = select_duration(83.456, 1.0);
        assert_eq!(sel.source, TimingSource::Primary);
        assert_eq!(sel.duration, 83.456);
    }
}
