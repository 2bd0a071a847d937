use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_DISPLAY_NAME: &str = "Garage";
pub const DEFAULT_MQTT_HOST: &str = "home";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_USER: &str = "homeassistant";
pub const DEFAULT_MQTT_PASSWORD: &str = "P@$$w0rd";
pub const HOST_NAME_PREFIX: &str = "garage-";

pub const OVERRIDE_DISPLAY_NAME: &str = "GARAGE_NAME";
pub const OVERRIDE_MQTT_HOST: &str = "MQTT_HOST";
pub const OVERRIDE_MQTT_PORT: &str = "MQTT_PORT";
pub const OVERRIDE_MQTT_USER: &str = "MQTT_USER";
pub const OVERRIDE_MQTT_PASS: &str = "MQTT_PASS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Device settings. Fields are private so every write goes through the
/// setters, which drop empty or out-of-range input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    host_name: String,
    display_name: String,
    safe_name: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_user: String,
    mqtt_password: String,
}

/// Persisted layout. Absent keys leave the current value untouched on load,
/// and so does a key holding the wrong type; only a document that is not a
/// JSON object fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(
        rename = "disp_name",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_host: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_port: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_user: Option<String>,
    #[serde(
        rename = "mqtt_pwrd",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_password: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(value) => Some(value),
        _ => None,
    })
}

/// Integers, floats (truncated) and numeric strings are all accepted.
fn lenient_port<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|port| port as i64)),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    })
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host_name: "garage".to_string(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            safe_name: safe_name(DEFAULT_DISPLAY_NAME),
            mqtt_host: DEFAULT_MQTT_HOST.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: DEFAULT_MQTT_USER.to_string(),
            mqtt_password: DEFAULT_MQTT_PASSWORD.to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn with_chip_id(chip_id: u32) -> Self {
        let mut config = Self::default();
        config.set_host_name(&host_name_for(chip_id));
        config
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_json(raw)?;
        Ok(config)
    }

    /// Leaves `self` untouched when the document does not parse.
    pub fn apply_json(&mut self, raw: &[u8]) -> Result<(), ConfigError> {
        self.apply(serde_json::from_slice(raw)?);
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec_pretty(&self.to_document())?)
    }

    /// Applies every present key through the matching setter.
    pub fn apply(&mut self, document: ConfigDocument) {
        if let Some(name) = document.display_name {
            self.set_display_name(&name);
        }
        if let Some(host) = document.mqtt_host {
            self.set_mqtt_host(&host);
        }
        if let Some(port) = document.mqtt_port {
            self.set_mqtt_port(port);
        }
        if let Some(user) = document.mqtt_user {
            self.set_mqtt_user(&user);
        }
        if let Some(password) = document.mqtt_password {
            self.set_mqtt_password(&password);
        }
    }

    /// Applies provisioning values (process or build environment) on top of
    /// the stored config. Unparsable ports are skipped.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup(OVERRIDE_DISPLAY_NAME) {
            self.set_display_name(&name);
        }
        if let Some(host) = lookup(OVERRIDE_MQTT_HOST) {
            self.set_mqtt_host(&host);
        }
        if let Some(port) = lookup(OVERRIDE_MQTT_PORT).and_then(|value| value.parse::<i64>().ok()) {
            self.set_mqtt_port(port);
        }
        if let Some(user) = lookup(OVERRIDE_MQTT_USER) {
            self.set_mqtt_user(&user);
        }
        if let Some(pass) = lookup(OVERRIDE_MQTT_PASS) {
            self.set_mqtt_password(&pass);
        }
    }

    pub fn to_document(&self) -> ConfigDocument {
        ConfigDocument {
            display_name: Some(self.display_name.clone()),
            mqtt_host: Some(self.mqtt_host.clone()),
            mqtt_port: Some(i64::from(self.mqtt_port)),
            mqtt_user: Some(self.mqtt_user.clone()),
            mqtt_password: Some(self.mqtt_password.clone()),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Not persisted; the device identifier comes from the hardware.
    pub fn set_host_name(&mut self, host_name: &str) {
        if !host_name.is_empty() {
            self.host_name = host_name.to_string();
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn safe_name(&self) -> &str {
        &self.safe_name
    }

    pub fn set_display_name(&mut self, name: &str) {
        if name.is_empty() {
            return;
        }
        if self.display_name != name {
            self.display_name = name.to_string();
        }
        self.safe_name = safe_name(name);
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn set_mqtt_host(&mut self, host: &str) {
        if !host.is_empty() {
            self.mqtt_host = host.to_string();
        }
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn set_mqtt_port(&mut self, port: i64) {
        if port <= 0 {
            return;
        }
        if let Ok(port) = u16::try_from(port) {
            self.mqtt_port = port;
        }
    }

    pub fn mqtt_user(&self) -> &str {
        &self.mqtt_user
    }

    pub fn set_mqtt_user(&mut self, user: &str) {
        if !user.is_empty() {
            self.mqtt_user = user.to_string();
        }
    }

    pub fn mqtt_password(&self) -> &str {
        &self.mqtt_password
    }

    /// Accepts the empty string, which disables broker credentials.
    pub fn set_mqtt_password(&mut self, password: &str) {
        self.mqtt_password = password.to_string();
    }
}

pub fn host_name_for(chip_id: u32) -> String {
    format!("{HOST_NAME_PREFIX}{chip_id:x}")
}

pub fn safe_name(display_name: &str) -> String {
    display_name.replace(' ', "_").to_lowercase()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_factory_values() {
        let config = DeviceConfig::default();
        assert_eq!(config.display_name(), "Garage");
        assert_eq!(config.safe_name(), "garage");
        assert_eq!(config.mqtt_host(), "home");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_user(), "homeassistant");
        assert_eq!(config.mqtt_password(), "P@$$w0rd");
    }

    #[test]
    fn display_name_derives_safe_name() {
        let mut config = DeviceConfig::default();
        config.set_display_name("North Bay Door");
        assert_eq!(config.display_name(), "North Bay Door");
        assert_eq!(config.safe_name(), "north_bay_door");
    }

    #[test]
    fn empty_strings_are_ignored() {
        let mut config = DeviceConfig::default();
        config.set_display_name("Shop");
        config.set_mqtt_host("10.0.0.2");
        config.set_mqtt_user("door");

        config.set_display_name("");
        config.set_mqtt_host("");
        config.set_mqtt_user("");

        assert_eq!(config.display_name(), "Shop");
        assert_eq!(config.safe_name(), "shop");
        assert_eq!(config.mqtt_host(), "10.0.0.2");
        assert_eq!(config.mqtt_user(), "door");
    }

    #[test]
    fn port_setter_rejects_non_positive_and_oversized() {
        let mut config = DeviceConfig::default();
        config.set_mqtt_port(8883);
        config.set_mqtt_port(0);
        config.set_mqtt_port(-1);
        config.set_mqtt_port(70_000);
        assert_eq!(config.mqtt_port(), 8883);
    }

    #[test]
    fn password_can_be_cleared() {
        let mut config = DeviceConfig::default();
        config.set_mqtt_password("");
        assert_eq!(config.mqtt_password(), "");
    }

    #[test]
    fn host_name_uses_hex_chip_id() {
        let config = DeviceConfig::with_chip_id(0x00ab_12cd);
        assert_eq!(config.host_name(), "garage-ab12cd");
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = DeviceConfig::from_json(br#"{"mqtt_host":"broker.lan","mqtt_port":1884}"#)
            .unwrap();
        assert_eq!(config.mqtt_host(), "broker.lan");
        assert_eq!(config.mqtt_port(), 1884);
        assert_eq!(config.display_name(), "Garage");
        assert_eq!(config.mqtt_user(), "homeassistant");
    }

    #[test]
    fn document_values_go_through_setters() {
        let config =
            DeviceConfig::from_json(br#"{"disp_name":"","mqtt_port":0,"mqtt_pwrd":""}"#).unwrap();
        assert_eq!(config.display_name(), "Garage");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_password(), "");
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(DeviceConfig::from_json(b"{not json").is_err());
        assert!(DeviceConfig::from_json(b"[1883]").is_err());
    }

    #[test]
    fn wrong_typed_keys_do_not_drop_the_rest() {
        let config = DeviceConfig::from_json(
            br#"{"disp_name":"Shop","mqtt_host":"10.0.0.9","mqtt_port":"abc","mqtt_user":7,"mqtt_pwrd":null}"#,
        )
        .unwrap();

        assert_eq!(config.display_name(), "Shop");
        assert_eq!(config.mqtt_host(), "10.0.0.9");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_user(), "homeassistant");
        assert_eq!(config.mqtt_password(), "P@$$w0rd");
    }

    #[test]
    fn numeric_string_port_is_accepted() {
        let config = DeviceConfig::from_json(br#"{"mqtt_port":"1884"}"#).unwrap();
        assert_eq!(config.mqtt_port(), 1884);

        let config = DeviceConfig::from_json(br#"{"mqtt_port":8883.0}"#).unwrap();
        assert_eq!(config.mqtt_port(), 8883);
    }

    #[test]
    fn document_uses_persisted_key_names() {
        let mut config = DeviceConfig::default();
        config.set_display_name("Side Door");
        let value: serde_json::Value = serde_json::from_slice(&config.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "disp_name": "Side Door",
                "mqtt_host": "home",
                "mqtt_port": 1883,
                "mqtt_user": "homeassistant",
                "mqtt_pwrd": "P@$$w0rd",
            })
        );
    }

    #[test]
    fn overrides_go_through_setters() {
        let env = std::collections::HashMap::from([
            ("GARAGE_NAME", "Side Door"),
            ("MQTT_HOST", ""),
            ("MQTT_PORT", "not-a-port"),
            ("MQTT_USER", "door"),
            ("MQTT_PASS", ""),
        ]);

        let mut config = DeviceConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.safe_name(), "side_door");
        assert_eq!(config.mqtt_host(), "home");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.mqtt_user(), "door");
        assert_eq!(config.mqtt_password(), "");
    }

    #[test]
    fn json_round_trips_every_field() {
        let mut config = DeviceConfig::default();
        config.set_display_name("Barn Door");
        config.set_mqtt_host("192.168.4.20");
        config.set_mqtt_port(1999);
        config.set_mqtt_user("barn");
        config.set_mqtt_password("hunter2");

        let restored = DeviceConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }
}
