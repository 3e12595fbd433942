//! Device JSON envelope, typed command results and energy query windows.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::error::TapoError;

/// Outbound command envelope: `{"method": ..., "params"?: ...}`.
#[derive(Debug, Serialize)]
pub(crate) struct DeviceRequest<'a> {
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Inbound command envelope: either a result or a non-zero error code,
/// never a partially populated mix of the two.
#[derive(Debug, Deserialize)]
pub(crate) struct DeviceResponse {
    pub error_code: i32,
    #[serde(default)]
    pub result: Option<Value>,
}

impl DeviceResponse {
    /// Collapse the envelope into its success payload.
    pub fn into_result(self) -> Result<Value, TapoError> {
        if self.error_code != 0 {
            return Err(TapoError::DeviceError {
                code: self.error_code,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Static and live device state from `get_device_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(rename = "fw_ver")]
    pub firmware_version: String,
    #[serde(rename = "hw_ver")]
    pub hardware_version: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub model: String,
    pub mac: String,
    pub hw_id: String,
    pub fw_id: String,
    pub oem_id: String,
    pub ip: String,
    pub time_diff: i64,
    pub ssid: String,
    /// Received signal strength, dBm
    pub rssi: i32,
    pub signal_level: i32,
    pub latitude: i64,
    pub longitude: i64,
    pub lang: String,
    pub avatar: String,
    pub region: String,
    pub specs: String,
    pub nickname: String,
    pub has_set_location_info: bool,
    pub device_on: bool,
    /// Seconds since the relay last switched on
    pub on_time: i64,
    pub overheated: bool,
    pub power_protection_status: String,
    pub location: String,
}

/// One row of `get_device_usage` aggregates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageEntry {
    pub today: i64,
    pub past7: i64,
    pub past30: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceUsage {
    pub time_usage: UsageEntry,
    pub power_usage: UsageEntry,
    pub saved_power: UsageEntry,
}

/// Instantaneous load from `get_current_power`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentPower {
    /// Milliwatts
    pub current_power: i64,
}

/// Runtime and energy totals from `get_energy_usage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyUsage {
    /// Minutes the relay has been on today
    pub today_runtime: i64,
    /// Minutes this calendar month
    pub month_runtime: i64,
    /// Watt-hours today
    pub today_energy: i64,
    /// Watt-hours this calendar month
    pub month_energy: i64,
    pub local_time: String,
    pub electricity_charge: Vec<i64>,
    /// Milliwatts
    pub current_power: i64,
}

/// Bucketed energy history from `get_energy_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyData {
    pub local_time: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    /// Bucket width in minutes
    pub interval: i64,
    /// Watt-hours per bucket; legitimately empty when nothing was recorded
    pub data: Vec<i64>,
}

/// Bucket width for `get_energy_data` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum EnergyDataInterval {
    #[strum(serialize = "hourly")]
    Hourly,
    #[strum(serialize = "daily")]
    Daily,
    #[strum(serialize = "monthly")]
    Monthly,
}

impl EnergyDataInterval {
    /// Bucket width in minutes, as the device expects it.
    pub fn minutes(self) -> i64 {
        match self {
            EnergyDataInterval::Hourly => 60,
            EnergyDataInterval::Daily => 1440,
            EnergyDataInterval::Monthly => 43200,
        }
    }
}

/// Compute the `[start, end)` Unix-second window the device expects for an
/// energy-data query anchored at `reference`, in that time's own timezone.
///
/// - Hourly: the calendar day containing `reference`, 24 buckets.
/// - Daily: the calendar quarter containing `reference`.
/// - Monthly: the calendar year containing `reference`, 12 buckets.
pub fn energy_window<Tz: TimeZone>(
    interval: EnergyDataInterval,
    reference: &DateTime<Tz>,
) -> (i64, i64) {
    let tz = reference.timezone();
    let year = reference.year();
    match interval {
        EnergyDataInterval::Hourly => {
            let start = midnight_in(&tz, year, reference.month(), reference.day());
            let end = start.clone() + ChronoDuration::hours(24);
            (start.timestamp(), end.timestamp())
        }
        EnergyDataInterval::Daily => {
            let month = quarter_start_month(reference.month());
            let start = midnight_in(&tz, year, month, 1);
            let end = if month == 10 {
                midnight_in(&tz, year + 1, 1, 1)
            } else {
                midnight_in(&tz, year, month + 3, 1)
            };
            (start.timestamp(), end.timestamp())
        }
        EnergyDataInterval::Monthly => {
            let start = midnight_in(&tz, year, 1, 1);
            let end = midnight_in(&tz, year + 1, 1, 1);
            (start.timestamp(), end.timestamp())
        }
    }
}

/// First month of the calendar quarter containing `month`.
fn quarter_start_month(month: u32) -> u32 {
    3 * ((month - 1) / 3) + 1
}

fn midnight_in<Tz: TimeZone>(tz: &Tz, year: i32, month: u32, day: u32) -> DateTime<Tz> {
    tz.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .earliest()
        // midnight erased by a DST gap: the day starts when clocks resume
        .or_else(|| tz.with_ymd_and_hms(year, month, day, 1, 0, 0).earliest())
        .unwrap_or_else(|| {
            let date = NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN);
            tz.from_utc_datetime(&date.and_time(NaiveTime::MIN))
        })
}
