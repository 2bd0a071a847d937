use std::{fmt, net::IpAddr, time::Duration};

use crate::config::DeviceConfig;

pub const KEEP_ALIVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAddress {
    Ip(IpAddr),
    Hostname(String),
}

impl BrokerAddress {
    /// IP literals are used as-is, anything else is left to the resolver.
    pub fn parse(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Hostname(host.to_string()),
        }
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Hostname(host) => f.write_str(host),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub address: BrokerAddress,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<Credentials>,
}

impl BrokerSettings {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let credentials = if config.mqtt_password().is_empty() {
            None
        } else {
            Some(Credentials {
                user: config.mqtt_user().to_string(),
                password: config.mqtt_password().to_string(),
            })
        };

        Self {
            address: BrokerAddress::parse(config.mqtt_host()),
            port: config.mqtt_port(),
            client_id: config.host_name().to_string(),
            keep_alive: KEEP_ALIVE,
            credentials,
        }
    }

    pub fn url(&self) -> String {
        match &self.address {
            BrokerAddress::Ip(IpAddr::V6(ip)) => format!("mqtt://[{ip}]:{}", self.port),
            address => format!("mqtt://{address}:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ip_literal_host_is_not_resolved() {
        let mut config = DeviceConfig::default();
        config.set_mqtt_host("192.168.1.10");

        let settings = BrokerSettings::from_config(&config);
        assert_eq!(
            settings.address,
            BrokerAddress::Ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)))
        );
        assert_eq!(settings.url(), "mqtt://192.168.1.10:1883");
    }

    #[test]
    fn default_host_is_a_hostname() {
        let settings = BrokerSettings::from_config(&DeviceConfig::with_chip_id(0x42));
        assert_eq!(settings.address, BrokerAddress::Hostname("home".to_string()));
        assert_eq!(settings.client_id, "garage-42");
        assert_eq!(settings.keep_alive, Duration::from_secs(5));
        assert_eq!(settings.url(), "mqtt://home:1883");
    }

    #[test]
    fn empty_password_means_no_credentials() {
        let mut config = DeviceConfig::default();
        config.set_mqtt_password("");
        assert_eq!(BrokerSettings::from_config(&config).credentials, None);

        config.set_mqtt_password("secret");
        assert_eq!(
            BrokerSettings::from_config(&config).credentials,
            Some(Credentials {
                user: "homeassistant".to_string(),
                password: "secret".to_string(),
            })
        );
    }

    #[test]
    fn ipv6_url_is_bracketed() {
        let mut config = DeviceConfig::default();
        config.set_mqtt_host("fd00::5");
        config.set_mqtt_port(1884);
        assert_eq!(BrokerSettings::from_config(&config).url(), "mqtt://[fd00::5]:1884");
    }
}
