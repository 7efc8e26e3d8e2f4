//! Wire models for the fermentation controller's dashboard, log and push endpoints.
//!
//! Notes
//! - Temperatures are always Celsius on the wire and in memory. Conversion is a display concern.
//! - Live update messages are partial: every optional field is `Option<Option<T>>`, where the outer
//!   `None` means "absent, leave unchanged" and `Some(None)` means "explicitly null".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{deserialize_present, deserialize_utc_lenient, deserialize_utc_lenient_opt};

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FermenterId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub i64);

// =====================
// Enums
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Scheduled,
    Active,
    Complete,
    Cancelled,
}

/// Actuator activity reported by the control loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Heating,
    Cooling,
    Idle,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Celsius,
    Fahrenheit,
}

impl UnitSystem {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "c" | "celsius" => Some(UnitSystem::Celsius),
            "f" | "fahrenheit" => Some(UnitSystem::Fahrenheit),
            _ => None,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            UnitSystem::Celsius => "°C",
            UnitSystem::Fahrenheit => "°F",
        }
    }
}

// =====================
// Dashboard snapshot
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FermenterRef {
    pub id: FermenterId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_liters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub id: ProfileId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beer_type: Option<String>,
}

/// Identity and lifecycle of a batch as embedded in each dashboard snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    #[serde(default)]
    pub batch_number: Option<String>,
    pub name: String,
    pub status: BatchStatus,
    pub fermenter: FermenterRef,
    pub profile: ProfileRef,
    #[serde(default, deserialize_with = "deserialize_utc_lenient_opt")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_utc_lenient_opt")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureLogPoint {
    #[serde(deserialize_with = "deserialize_utc_lenient")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "actual_temp_celsius")]
    pub actual_temp: f64,
    #[serde(default, alias = "target_temp_celsius")]
    pub target_temp: Option<f64>,
    #[serde(default)]
    pub control_state: Option<ControlState>,
    #[serde(default)]
    pub power_consumed_wh: Option<f64>,
}

/// Full status record for one batch, as returned by the dashboard endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusSnapshot {
    pub batch: BatchRecord,
    #[serde(default)]
    pub current_temp: Option<f64>,
    #[serde(default)]
    pub target_temp: Option<f64>,
    #[serde(default)]
    pub control_state: Option<ControlState>,
    #[serde(default)]
    pub current_phase: Option<u32>,
    #[serde(default)]
    pub phase_progress: Option<f64>,
    #[serde(default)]
    pub elapsed_hours: Option<f64>,
    #[serde(default)]
    pub recent_logs: Vec<TemperatureLogPoint>,
}

impl BatchStatusSnapshot {
    pub fn id(&self) -> BatchId {
        self.batch.id
    }

    pub fn status(&self) -> BatchStatus {
        self.batch.status
    }
}

// =====================
// Push channel
// =====================

/// Envelope of every server frame on the dashboard push channel.
///
/// `data` is kept as raw JSON so one malformed element does not take its siblings down with it.
#[derive(Debug, Clone, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

pub const PUSH_FRAME_UPDATE: &str = "update";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LiveUpdateMessage {
    pub batch_id: BatchId,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub current_temp: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub target_temp: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub control_state: Option<Option<ControlState>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub current_phase: Option<Option<u32>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub phase_progress: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub elapsed_hours: Option<Option<f64>>,
}

// =====================
// Chart output
// =====================

/// Display-ready chart sample. `timestamp` is epoch milliseconds for axis math.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartSeriesPoint {
    pub timestamp: i64,
    pub actual: f64,
    pub target: Option<f64>,
}
