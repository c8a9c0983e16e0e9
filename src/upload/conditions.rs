//! Device conditions that gate an upload tick

use crate::context::{BatteryState, DatadogContext, Reachability};
use std::fmt;

const MIN_BATTERY_LEVEL: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UploadBlocker {
    NetworkUnreachable,
    LowBattery { level: f32 },
    LowPowerMode,
    AppInBackground,
    UploadDisabled,
}

impl fmt::Display for UploadBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadBlocker::NetworkUnreachable => write!(f, "network unreachable"),
            UploadBlocker::LowBattery { level } => {
                write!(f, "battery at {:.0}% and unplugged", level * 100.0)
            }
            UploadBlocker::LowPowerMode => write!(f, "low power mode"),
            UploadBlocker::AppInBackground => write!(f, "app in background"),
            UploadBlocker::UploadDisabled => write!(f, "upload disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConditions {
    pub background_uploads_enabled: bool,
}

impl UploadConditions {
    /// Returns every reason preventing an upload right now; empty means go.
    pub fn blockers(&self, context: &DatadogContext, upload_enabled: bool) -> Vec<UploadBlocker> {
        let mut blockers = Vec::new();

        if !upload_enabled {
            blockers.push(UploadBlocker::UploadDisabled);
        }

        if context.network.reachability == Reachability::No {
            blockers.push(UploadBlocker::NetworkUnreachable);
        }

        if let Some(battery) = context.battery {
            if battery.state == BatteryState::Unplugged && battery.level < MIN_BATTERY_LEVEL {
                blockers.push(UploadBlocker::LowBattery {
                    level: battery.level,
                });
            }
        }

        if context.is_low_power_mode_enabled {
            blockers.push(UploadBlocker::LowPowerMode);
        }

        let state = context.app_state_history.current().state;
        if !state.is_running_in_foreground() && !self.background_uploads_enabled {
            blockers.push(UploadBlocker::AppInBackground);
        }

        blockers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::TrackingConsent;
    use crate::context::{AppState, BatteryStatus};
    use chrono::Utc;

    fn context() -> DatadogContext {
        DatadogContext::new("app", "test", "1.0", TrackingConsent::Granted)
    }

    const FOREGROUND_ONLY: UploadConditions = UploadConditions {
        background_uploads_enabled: false,
    };

    #[test]
    fn test_default_context_allows_upload() {
        assert!(FOREGROUND_ONLY.blockers(&context(), true).is_empty());
    }

    #[test]
    fn test_unreachable_network_blocks() {
        let mut context = context();
        context.network.reachability = Reachability::No;
        assert_eq!(
            FOREGROUND_ONLY.blockers(&context, true),
            vec![UploadBlocker::NetworkUnreachable]
        );
    }

    #[test]
    fn test_low_battery_blocks_only_when_unplugged() {
        let mut context = context();
        context.battery = Some(BatteryStatus {
            state: BatteryState::Charging,
            level: 0.05,
        });
        assert!(FOREGROUND_ONLY.blockers(&context, true).is_empty());

        context.battery = Some(BatteryStatus {
            state: BatteryState::Unplugged,
            level: 0.05,
        });
        assert_eq!(
            FOREGROUND_ONLY.blockers(&context, true),
            vec![UploadBlocker::LowBattery { level: 0.05 }]
        );
    }

    #[test]
    fn test_background_policy() {
        let mut context = context();
        context.app_state_history.append(AppState::Background, Utc::now());

        assert_eq!(
            FOREGROUND_ONLY.blockers(&context, true),
            vec![UploadBlocker::AppInBackground]
        );

        let background = UploadConditions {
            background_uploads_enabled: true,
        };
        assert!(background.blockers(&context, true).is_empty());
    }

    #[test]
    fn test_disabled_and_low_power() {
        let mut context = context();
        context.is_low_power_mode_enabled = true;
        assert_eq!(
            FOREGROUND_ONLY.blockers(&context, false),
            vec![UploadBlocker::UploadDisabled, UploadBlocker::LowPowerMode]
        );
    }
}
