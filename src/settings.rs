//! Robot settings record
//!
//! The robot monitor daemon periodically reports its state as a
//! size-prefixed little-endian record. Strings are u16-length prefixed UTF-8,
//! and the configuration and calibration fields carry JSON objects keyed by
//! robot name.

use serde::Serialize;
use serde_json::Value;

use crate::codec::ByteReader;
use crate::error::DecodeError;

/// Number of joints reported in the temperature and status arrays
pub const JOINT_COUNT: usize = 25;

/// Role names indexed by the `role` field of a robot configuration
pub const ROBOT_ROLES: &[&str] = &[
    "NONE",
    "STRIKER",
    "DEFENDER",
    "GOALKEEPER",
    "SUPPORTER_DEFENSE",
    "SUPPORTER_OFFENSE",
    "SEARCHER",
    "DEMO",
    "PENALTYKICKER",
    "PENALTYGOALY",
    "OBSTACLE_AVOIDER",
    "PASSING_ROBOT_OWN_HALF",
    "PASSING_ROBOT_OPPONENT_HALF",
    "ONE_VS_ONE_DUELLIST",
    "CALIBRATION_EVALUATOR",
];

/// Resolve a role index to its name
pub fn role_name(index: i64) -> &'static str {
    usize::try_from(index)
        .ok()
        .and_then(|i| ROBOT_ROLES.get(i).copied())
        .unwrap_or("Unknown")
}

/// Game configuration entry of one robot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotConfiguration {
    /// 0 when unknown
    pub jersey_number: i64,
    /// 0 when unknown
    pub team_number: i64,
    pub role: String,
    pub raw: Value,
}

impl RobotConfiguration {
    fn from_value(raw: Value) -> Self {
        let jersey_number = int_field(&raw, "jerseyNumber").unwrap_or(0);
        let team_number = int_field(&raw, "teamNumber").unwrap_or(0);
        let role = int_field(&raw, "role")
            .map(role_name)
            .unwrap_or("Unknown")
            .to_string();
        Self { jersey_number, team_number, role, raw }
    }
}

fn int_field(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Latest state snapshot reported by a robot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotSettings {
    pub name: String,
    pub lan_address: String,
    pub lan_link: bool,
    pub wlan_address: String,
    pub wlan_essid: String,
    pub wlan_signal_strength: i32,
    pub frontend_running: bool,
    pub backend_running: bool,
    pub fail_state: i32,
    /// Charge in [0, 1], negative when never reported
    pub battery_charge: f32,
    pub battery_charging: bool,
    pub joint_temperatures: [f32; JOINT_COUNT],
    pub joint_status: [i32; JOINT_COUNT],
    pub build_info_frontend: String,
    pub build_info_backend: String,
    pub configuration: Option<RobotConfiguration>,
    pub calibration: Option<Value>,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            lan_address: String::new(),
            lan_link: false,
            wlan_address: String::new(),
            wlan_essid: String::new(),
            wlan_signal_strength: 0,
            frontend_running: false,
            backend_running: false,
            fail_state: 0,
            battery_charge: -1.0,
            battery_charging: false,
            joint_temperatures: [0.0; JOINT_COUNT],
            joint_status: [0; JOINT_COUNT],
            build_info_frontend: String::new(),
            build_info_backend: String::new(),
            configuration: None,
            calibration: None,
        }
    }
}

impl RobotSettings {
    /// Decode one size-prefixed settings record
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        const WHAT: &str = "settings record";

        let mut outer = ByteReader::new(data, WHAT);
        let size = outer.u32()? as usize;
        let body = outer.bytes(size)?;
        let mut r = ByteReader::new(body, WHAT);

        let name = r.string()?;
        if name.is_empty() {
            return Err(DecodeError::Invalid("settings record without robot name".to_string()));
        }

        let mut settings = Self {
            lan_address: r.string()?,
            lan_link: r.bool()?,
            wlan_address: r.string()?,
            wlan_essid: r.string()?,
            wlan_signal_strength: r.i32()?,
            frontend_running: r.bool()?,
            backend_running: r.bool()?,
            fail_state: r.i32()?,
            battery_charge: r.f32()?,
            battery_charging: r.bool()?,
            joint_temperatures: r.f32_array()?,
            joint_status: r.i32_array()?,
            build_info_frontend: r.string()?,
            build_info_backend: r.string()?,
            ..Self::default()
        };
        let configuration = r.string()?;
        let calibration = r.string()?;

        settings.configuration = keyed_blob(&name, &configuration)?.map(RobotConfiguration::from_value);
        settings.calibration = keyed_blob(&name, &calibration)?;
        settings.name = name;
        Ok(settings)
    }

    /// Keep configuration and calibration from an earlier snapshot when this
    /// one did not carry them.
    pub fn carry_over(&mut self, previous: &RobotSettings) {
        if self.configuration.is_none() {
            self.configuration = previous.configuration.clone();
        }
        if self.calibration.is_none() {
            self.calibration = previous.calibration.clone();
        }
    }

    /// Whether both JSON blobs are known
    pub fn is_complete(&self) -> bool {
        self.configuration.is_some() && self.calibration.is_some()
    }

    pub fn role(&self) -> &str {
        self.configuration.as_ref().map_or("Unknown", |c| c.role.as_str())
    }

    pub fn jersey_number(&self) -> i64 {
        self.configuration.as_ref().map_or(0, |c| c.jersey_number)
    }

    pub fn team_number(&self) -> i64 {
        self.configuration.as_ref().map_or(0, |c| c.team_number)
    }
}

/// Extract `root[name]` from a JSON object; empty text or an empty/missing
/// entry means the blob is absent.
fn keyed_blob(name: &str, text: &str) -> Result<Option<Value>, DecodeError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let root: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json {
        what: "settings record",
        message: e.to_string(),
    })?;
    Ok(match root.get(name) {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(entry) => Some(entry.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::SettingsRecord;

    #[test]
    fn test_decode_basic_fields() {
        let record = SettingsRecord {
            battery_charge: 0.75,
            wlan_signal_strength: -42,
            ..SettingsRecord::named("nao21")
        };
        let settings = RobotSettings::decode(&record.encode()).unwrap();

        assert_eq!(settings.name, "nao21");
        assert_eq!(settings.lan_address, "10.0.0.21");
        assert!(settings.frontend_running);
        assert_eq!(settings.wlan_signal_strength, -42);
        assert!((settings.battery_charge - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_zero_joint_temperatures() {
        let record = SettingsRecord::named("nao21");
        let settings = RobotSettings::decode(&record.encode()).unwrap();
        assert_eq!(settings.joint_temperatures, [0.0f32; JOINT_COUNT]);
        assert_eq!(settings.joint_status, [0i32; JOINT_COUNT]);
    }

    #[test]
    fn test_joint_arrays_keep_order() {
        let mut record = SettingsRecord::named("nao21");
        record.joint_temperatures[0] = 31.5;
        record.joint_temperatures[24] = 60.0;
        record.joint_status[3] = 2;
        let settings = RobotSettings::decode(&record.encode()).unwrap();
        assert_eq!(settings.joint_temperatures[0], 31.5);
        assert_eq!(settings.joint_temperatures[24], 60.0);
        assert_eq!(settings.joint_status[3], 2);
    }

    #[test]
    fn test_configuration_keyed_by_name() {
        let record = SettingsRecord {
            configuration: r#"{"nao21": {"jerseyNumber": 4, "role": 3, "teamNumber": 7}}"#.to_string(),
            calibration: r#"{"nao21": {"camera": {"roll": 0.01}}}"#.to_string(),
            ..SettingsRecord::named("nao21")
        };
        let settings = RobotSettings::decode(&record.encode()).unwrap();

        assert_eq!(settings.jersey_number(), 4);
        assert_eq!(settings.team_number(), 7);
        assert_eq!(settings.role(), "GOALKEEPER");
        assert!(settings.is_complete());
    }

    #[test]
    fn test_configuration_for_other_robot_is_absent() {
        let record = SettingsRecord {
            configuration: r#"{"nao22": {"jerseyNumber": 1}}"#.to_string(),
            ..SettingsRecord::named("nao21")
        };
        let settings = RobotSettings::decode(&record.encode()).unwrap();
        assert!(settings.configuration.is_none());
        assert_eq!(settings.role(), "Unknown");
    }

    #[test]
    fn test_out_of_range_role() {
        assert_eq!(role_name(99), "Unknown");
        assert_eq!(role_name(-1), "Unknown");
        assert_eq!(role_name(1), "STRIKER");
    }

    #[test]
    fn test_size_prefix_larger_than_body_is_rejected() {
        let mut bytes = SettingsRecord::named("nao21").encode();
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            RobotSettings::decode(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_malformed_configuration_json() {
        let record = SettingsRecord {
            configuration: "{not json".to_string(),
            ..SettingsRecord::named("nao21")
        };
        assert!(matches!(
            RobotSettings::decode(&record.encode()),
            Err(DecodeError::Json { .. })
        ));
    }

    #[test]
    fn test_carry_over_keeps_previous_blobs() {
        let full = SettingsRecord {
            configuration: r#"{"nao21": {"jerseyNumber": 2, "role": 1, "teamNumber": 3}}"#.to_string(),
            calibration: r#"{"nao21": {"imu": 1}}"#.to_string(),
            ..SettingsRecord::named("nao21")
        };
        let previous = RobotSettings::decode(&full.encode()).unwrap();
        let mut latest = RobotSettings::decode(&SettingsRecord::named("nao21").encode()).unwrap();
        assert!(!latest.is_complete());

        latest.carry_over(&previous);
        assert!(latest.is_complete());
        assert_eq!(latest.role(), "STRIKER");
    }
}
