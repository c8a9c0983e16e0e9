//! Shared execution context consumed by all features

use crate::consent::TrackingConsent;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable snapshot of app, device, user and session state.
///
/// Snapshots are only produced by the context provider; `snapshot_version`
/// grows by one with every committed write.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatadogContext {
    pub snapshot_version: u64,

    pub site: String,
    pub client_token: String,
    pub service: String,
    pub env: String,
    pub app_version: String,
    pub source: String,
    pub sdk_version: String,

    /// Difference between server time and device time, in milliseconds.
    pub server_time_offset_ms: i64,
    pub sdk_init_date: DateTime<Utc>,

    pub device: DeviceInfo,
    pub network: NetworkConnectionInfo,
    pub carrier: Option<CarrierInfo>,
    pub battery: Option<BatteryStatus>,
    pub is_low_power_mode_enabled: bool,
    pub app_state_history: AppStateHistory,

    pub user: UserInfo,
    /// Attributes published by features, keyed by label.
    pub baggages: BTreeMap<String, FeatureBaggage>,
    pub tracking_consent: TrackingConsent,
}

impl DatadogContext {
    pub fn new(
        service: impl Into<String>,
        env: impl Into<String>,
        app_version: impl Into<String>,
        tracking_consent: TrackingConsent,
    ) -> Self {
        let now = Utc::now();
        Self {
            snapshot_version: 0,
            site: "datadoghq.com".to_string(),
            client_token: String::new(),
            service: service.into(),
            env: env.into(),
            app_version: app_version.into(),
            source: "rust".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            server_time_offset_ms: 0,
            sdk_init_date: now,
            device: DeviceInfo::default(),
            network: NetworkConnectionInfo::default(),
            carrier: None,
            battery: None,
            is_low_power_mode_enabled: false,
            app_state_history: AppStateHistory::new(AppState::Active, now),
            user: UserInfo::default(),
            baggages: BTreeMap::new(),
            tracking_consent,
        }
    }

    /// Device date corrected by the server time offset.
    pub fn server_date(&self, device_date: DateTime<Utc>) -> DateTime<Utc> {
        device_date + chrono::Duration::milliseconds(self.server_time_offset_ms)
    }

    pub fn baggage(&self, label: &str) -> Option<&FeatureBaggage> {
        self.baggages.get(label)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
}

impl DeviceInfo {
    /// Device info describing the host this process runs on.
    pub fn current() -> Self {
        Self {
            name: std::env::consts::OS.to_string(),
            model: String::new(),
            os_name: std::env::consts::OS.to_string(),
            os_version: String::new(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Yes,
    #[default]
    Maybe,
    No,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkInterface {
    Wifi,
    WiredEthernet,
    Cellular,
    Loopback,
    Other,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkConnectionInfo {
    pub reachability: Reachability,
    pub available_interfaces: Vec<NetworkInterface>,
    pub supports_ipv4: bool,
    pub supports_ipv6: bool,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarrierInfo {
    pub carrier_name: Option<String>,
    pub carrier_iso_country_code: Option<String>,
    pub radio_access_technology: String,
    pub carrier_allows_voip: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    Unknown,
    Unplugged,
    Charging,
    Full,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatteryStatus {
    pub state: BatteryState,
    /// Charge level in the `0.0..=1.0` range.
    pub level: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Active,
    Inactive,
    Background,
    Terminated,
}

impl AppState {
    pub fn is_running_in_foreground(&self) -> bool {
        matches!(self, AppState::Active | AppState::Inactive)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppStateSnapshot {
    pub state: AppState,
    pub date: DateTime<Utc>,
}

/// Ordered record of application state transitions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AppStateHistory {
    pub initial: AppStateSnapshot,
    pub changes: Vec<AppStateSnapshot>,
}

impl AppStateHistory {
    pub fn new(state: AppState, date: DateTime<Utc>) -> Self {
        Self {
            initial: AppStateSnapshot { state, date },
            changes: Vec::new(),
        }
    }

    pub fn current(&self) -> AppStateSnapshot {
        self.changes.last().copied().unwrap_or(self.initial)
    }

    /// Records a transition; repeated states are collapsed.
    pub fn append(&mut self, state: AppState, date: DateTime<Utc>) {
        if self.current().state != state {
            self.changes.push(AppStateSnapshot { state, date });
        }
    }

    /// State that was effective at the given date.
    pub fn state_at(&self, date: DateTime<Utc>) -> AppState {
        self.changes
            .iter()
            .rev()
            .find(|snapshot| snapshot.date <= date)
            .map(|snapshot| snapshot.state)
            .unwrap_or(self.initial.state)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub extra_info: BTreeMap<String, serde_json::Value>,
}

/// Feature-published attributes stored as an encoded JSON value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct FeatureBaggage(serde_json::Value);

impl FeatureBaggage {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }
}
