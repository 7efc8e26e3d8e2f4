//! Chart preparation for temperature logs.
//!
//! One output point per input point, sorted by time, converted to the display unit. Nothing is
//! interpolated or resampled: a missing target stays missing and the chart draws a gap.

use crate::models::fermentation::{ChartSeriesPoint, TemperatureLogPoint, UnitSystem};

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Convert a canonical Celsius value for display.
pub fn convert(celsius: f64, units: UnitSystem) -> f64 {
    match units {
        UnitSystem::Celsius => celsius,
        UnitSystem::Fahrenheit => celsius_to_fahrenheit(celsius),
    }
}

pub fn prepare_series(logs: &[TemperatureLogPoint], units: UnitSystem) -> Vec<ChartSeriesPoint> {
    let mut points: Vec<ChartSeriesPoint> = logs
        .iter()
        .map(|log| ChartSeriesPoint {
            timestamp: log.timestamp.timestamp_millis(),
            actual: convert(log.actual_temp, units),
            target: log.target_temp.map(|t| convert(t, units)),
        })
        .collect();
    // stable: duplicates keep their input order
    points.sort_by_key(|p| p.timestamp);
    points
}

pub fn format_temp(celsius: f64, units: UnitSystem) -> String {
    format!("{:.1}{}", convert(celsius, units), units.suffix())
}

pub fn format_duration(hours: f64) -> String {
    if !hours.is_finite() || hours < 0.0 {
        return "-".to_string();
    }
    let total_minutes = (hours * 60.0).round() as u64;
    let days = total_minutes / (24 * 60);
    let hrs = (total_minutes / 60) % 24;
    let mins = total_minutes % 60;
    if days > 0 {
        format!("{}d {}h", days, hrs)
    } else if hrs > 0 {
        format!("{}h {}m", hrs, mins)
    } else {
        format!("{}m", mins)
    }
}
