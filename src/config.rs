use crate::meter_instance::Position;
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;

/// Serial meter settings, published as the first meter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialMeterConfig {
    pub serial_port: String,
    pub slave_id: u8,
    pub device_instance: u32,
    pub device_name: String,
    pub max_power: u32,
    /// kWh added to every successful import energy reading.
    pub energy_offset: f64,
}

/// Broker settings and identity of the message-fed meter instance.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub topic: String,
    pub client_id: String,
    pub device_instance: u32,
    pub device_name: String,
    pub max_power: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub meter: SerialMeterConfig,
    pub position: Position,
    /// `None` disables the message-fed instance.
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, environment or otherwise.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };

        let meter = SerialMeterConfig {
            serial_port: vars.required("SDM_SERIAL_PORT")?,
            slave_id: vars.parse_or("SDM_SLAVE_ID", 1)?,
            device_instance: vars.parse_required("SDM_DEVICE_INSTANCE")?,
            device_name: vars.or("SDM_DEVICE_NAME", "SDM120 PV"),
            max_power: vars.parse_required("SDM_MAX_POWER")?,
            energy_offset: vars.parse_or("SDM_ENERGY_OFFSET", 0.0)?,
        };
        let position = Position::try_from(vars.parse_required::<i64>("INVERTER_POSITION")?)?;

        let mqtt = match vars.get("MQTT_HOST") {
            Some(host) => {
                let tls = parse_bool_safe(vars.get("MQTT_TLS"));
                let default_port = if tls { 8883 } else { 1883 };
                Some(MqttConfig {
                    host,
                    port: vars.parse_or("MQTT_PORT", default_port)?,
                    username: vars.get("MQTT_USERNAME"),
                    password: vars.get("MQTT_PASSWORD"),
                    tls,
                    topic: vars.or("MQTT_TOPIC", "pv/meter"),
                    client_id: vars.or("MQTT_CLIENT_ID", "sdm120-bridge"),
                    device_instance: vars.parse_required("MQTT_DEVICE_INSTANCE")?,
                    device_name: vars.or("MQTT_DEVICE_NAME", "MQTT PV"),
                    max_power: vars.parse_required("MQTT_MAX_POWER")?,
                })
            }
            None => None,
        };

        if let Some(mqtt) = &mqtt {
            if mqtt.username.is_some() != mqtt.password.is_some() {
                bail!("MQTT_USERNAME and MQTT_PASSWORD must be set together");
            }
            if mqtt.device_instance == meter.device_instance {
                bail!(
                    "SDM_DEVICE_INSTANCE and MQTT_DEVICE_INSTANCE must differ (both {})",
                    meter.device_instance
                );
            }
        }

        Ok(Self {
            meter,
            position,
            mqtt,
        })
    }
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    /// Missing and blank values are treated the same.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("Required to set {} env var", key))
    }

    fn parse_required<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let raw = self.required(key)?;
        raw.trim()
            .parse()
            .with_context(|| format!("Invalid {} value '{}'", key, raw))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(_) => self.parse_required(key),
            None => Ok(default),
        }
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
