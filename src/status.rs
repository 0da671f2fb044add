/// Power at or above which a meter instance reports `Running`.
pub const RUNNING_THRESHOLD_W: f64 = 10.0;

/// Operating state published under `/StatusCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Running = 7,
    Standby = 8,
}

impl StatusCode {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// Maps an instantaneous power reading to a status code.
/// Absent, negative and sub-threshold readings all map to `Standby`.
pub fn derive_status(power: Option<f64>) -> StatusCode {
    match power {
        Some(p) if p >= RUNNING_THRESHOLD_W => StatusCode::Running,
        _ => StatusCode::Standby,
    }
}

/// Next value of an update index, wrapping from 255 back to 0.
pub fn next_update_index(current: u8) -> u8 {
    current.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_threshold() {
        assert_eq!(derive_status(Some(10.0)), StatusCode::Running);
        assert_eq!(derive_status(Some(294.0)), StatusCode::Running);
        assert_eq!(derive_status(Some(9.99)), StatusCode::Standby);
        assert_eq!(derive_status(Some(0.0)), StatusCode::Standby);
        assert_eq!(derive_status(Some(-150.0)), StatusCode::Standby);
    }

    #[test]
    fn test_absent_power_is_standby() {
        assert_eq!(derive_status(None), StatusCode::Standby);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Running.code(), 7);
        assert_eq!(StatusCode::Standby.code(), 8);
    }

    #[test]
    fn test_update_index_wraps() {
        assert_eq!(next_update_index(0), 1);
        assert_eq!(next_update_index(254), 255);
        assert_eq!(next_update_index(255), 0);
    }
}
