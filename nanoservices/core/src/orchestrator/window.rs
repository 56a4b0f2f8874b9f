use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

/// Half-open extraction window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ExtractionWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> DimloadResult<Self> {
        if start > end {
            return Err(Error::Configuration(format!(
                "window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

/// Inputs to the window decision of a new run.
#[derive(Debug, Clone, Copy)]
pub struct WindowInputs {
    pub start_override: Option<NaiveDate>,
    pub end_override: Option<NaiveDate>,
    pub watermark: NaiveDate,
    pub today: NaiveDate,
    pub max_window_days: Option<u32>,
}

/// `start` is the override or the watermark; `end` is the override or today,
/// capped at `start + max_window_days` when no end was given.
pub fn compute_window(inputs: WindowInputs) -> DimloadResult<ExtractionWindow> {
    let start = inputs.start_override.unwrap_or(inputs.watermark);
    let end = match inputs.end_override {
        Some(end) => end,
        None => {
            let capped = inputs
                .max_window_days
                .and_then(|days| start.checked_add_days(Days::new(u64::from(days))));
            match capped {
                Some(cap) if cap < inputs.today => cap,
                _ => inputs.today,
            }
        }
    };
    ExtractionWindow::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn inputs() -> WindowInputs {
        WindowInputs {
            start_override: None,
            end_override: None,
            watermark: d(2024, 1, 1),
            today: d(2024, 3, 1),
            max_window_days: None,
        }
    }

    #[test]
    fn defaults_to_watermark_and_today() {
        let window = compute_window(inputs()).unwrap();
        assert_eq!(window, ExtractionWindow { start: d(2024, 1, 1), end: d(2024, 3, 1) });
    }

    #[test]
    fn overrides_win() {
        let window = compute_window(WindowInputs {
            start_override: Some(d(2023, 6, 1)),
            end_override: Some(d(2023, 7, 1)),
            ..inputs()
        })
        .unwrap();
        assert_eq!(window.start, d(2023, 6, 1));
        assert_eq!(window.end, d(2023, 7, 1));
    }

    #[test]
    fn cap_only_applies_without_end_override() {
        let capped = compute_window(WindowInputs { max_window_days: Some(10), ..inputs() }).unwrap();
        assert_eq!(capped.end, d(2024, 1, 11));

        let wide = compute_window(WindowInputs { max_window_days: Some(365), ..inputs() }).unwrap();
        assert_eq!(wide.end, d(2024, 3, 1));

        let explicit = compute_window(WindowInputs {
            max_window_days: Some(10),
            end_override: Some(d(2024, 2, 1)),
            ..inputs()
        })
        .unwrap();
        assert_eq!(explicit.end, d(2024, 2, 1));
    }

    #[test]
    fn start_after_end_is_configuration_error() {
        let result = compute_window(WindowInputs { watermark: d(2024, 4, 1), ..inputs() });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn empty_window_is_allowed() {
        let window = compute_window(WindowInputs { watermark: d(2024, 3, 1), ..inputs() }).unwrap();
        assert!(!window.contains(d(2024, 3, 1)));
    }
}
