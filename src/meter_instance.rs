use crate::quantity::{QuantityName, QuantitySnapshot};
use crate::status::{derive_status, next_update_index, StatusCode};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Every attribute a published meter instance exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeterPath {
    ProcessName,
    ProcessVersion,
    Connection,
    DeviceInstance,
    ProductId,
    ProductName,
    CustomName,
    FirmwareVersion,
    Connected,
    Latency,
    ErrorCode,
    Position,
    StatusCode,
    UpdateIndex,
    MaxPower,
    AcPosition,
    AcStatusCode,
    AcPower,
    AcCurrent,
    AcVoltage,
    AcFrequency,
    AcPowerFactor,
    AcEnergyForward,
    AcEnergyReverse,
    L1Power,
    L1Current,
    L1Voltage,
    L1Frequency,
    L1PowerFactor,
    L1EnergyForward,
    L1EnergyReverse,
    L2Power,
    L2Current,
    L2Voltage,
    L2Frequency,
    L2EnergyForward,
    L3Power,
    L3Current,
    L3Voltage,
    L3Frequency,
    L3EnergyForward,
}

impl MeterPath {
    pub const ALL: [MeterPath; 41] = [
        MeterPath::ProcessName,
        MeterPath::ProcessVersion,
        MeterPath::Connection,
        MeterPath::DeviceInstance,
        MeterPath::ProductId,
        MeterPath::ProductName,
        MeterPath::CustomName,
        MeterPath::FirmwareVersion,
        MeterPath::Connected,
        MeterPath::Latency,
        MeterPath::ErrorCode,
        MeterPath::Position,
        MeterPath::StatusCode,
        MeterPath::UpdateIndex,
        MeterPath::MaxPower,
        MeterPath::AcPosition,
        MeterPath::AcStatusCode,
        MeterPath::AcPower,
        MeterPath::AcCurrent,
        MeterPath::AcVoltage,
        MeterPath::AcFrequency,
        MeterPath::AcPowerFactor,
        MeterPath::AcEnergyForward,
        MeterPath::AcEnergyReverse,
        MeterPath::L1Power,
        MeterPath::L1Current,
        MeterPath::L1Voltage,
        MeterPath::L1Frequency,
        MeterPath::L1PowerFactor,
        MeterPath::L1EnergyForward,
        MeterPath::L1EnergyReverse,
        MeterPath::L2Power,
        MeterPath::L2Current,
        MeterPath::L2Voltage,
        MeterPath::L2Frequency,
        MeterPath::L2EnergyForward,
        MeterPath::L3Power,
        MeterPath::L3Current,
        MeterPath::L3Voltage,
        MeterPath::L3Frequency,
        MeterPath::L3EnergyForward,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeterPath::ProcessName => "/Mgmt/ProcessName",
            MeterPath::ProcessVersion => "/Mgmt/ProcessVersion",
            MeterPath::Connection => "/Mgmt/Connection",
            MeterPath::DeviceInstance => "/DeviceInstance",
            MeterPath::ProductId => "/ProductId",
            MeterPath::ProductName => "/ProductName",
            MeterPath::CustomName => "/CustomName",
            MeterPath::FirmwareVersion => "/FirmwareVersion",
            MeterPath::Connected => "/Connected",
            MeterPath::Latency => "/Latency",
            MeterPath::ErrorCode => "/ErrorCode",
            MeterPath::Position => "/Position",
            MeterPath::StatusCode => "/StatusCode",
            MeterPath::UpdateIndex => "/UpdateIndex",
            MeterPath::MaxPower => "/Ac/MaxPower",
            MeterPath::AcPosition => "/Ac/Position",
            MeterPath::AcStatusCode => "/Ac/StatusCode",
            MeterPath::AcPower => "/Ac/Power",
            MeterPath::AcCurrent => "/Ac/Current",
            MeterPath::AcVoltage => "/Ac/Voltage",
            MeterPath::AcFrequency => "/Ac/Frequency",
            MeterPath::AcPowerFactor => "/Ac/PowerFactor",
            MeterPath::AcEnergyForward => "/Ac/Energy/Forward",
            MeterPath::AcEnergyReverse => "/Ac/Energy/Reverse",
            MeterPath::L1Power => "/Ac/L1/Power",
            MeterPath::L1Current => "/Ac/L1/Current",
            MeterPath::L1Voltage => "/Ac/L1/Voltage",
            MeterPath::L1Frequency => "/Ac/L1/Frequency",
            MeterPath::L1PowerFactor => "/Ac/L1/PowerFactor",
            MeterPath::L1EnergyForward => "/Ac/L1/Energy/Forward",
            MeterPath::L1EnergyReverse => "/Ac/L1/Energy/Reverse",
            MeterPath::L2Power => "/Ac/L2/Power",
            MeterPath::L2Current => "/Ac/L2/Current",
            MeterPath::L2Voltage => "/Ac/L2/Voltage",
            MeterPath::L2Frequency => "/Ac/L2/Frequency",
            MeterPath::L2EnergyForward => "/Ac/L2/Energy/Forward",
            MeterPath::L3Power => "/Ac/L3/Power",
            MeterPath::L3Current => "/Ac/L3/Current",
            MeterPath::L3Voltage => "/Ac/L3/Voltage",
            MeterPath::L3Frequency => "/Ac/L3/Frequency",
            MeterPath::L3EnergyForward => "/Ac/L3/Energy/Forward",
        }
    }

    /// Formatter used when an external reader asks for the text of this path.
    pub fn text_format(self) -> TextFormat {
        match self {
            MeterPath::ProcessName
            | MeterPath::ProcessVersion
            | MeterPath::Connection
            | MeterPath::ProductName
            | MeterPath::CustomName
            | MeterPath::FirmwareVersion => TextFormat::Text,
            MeterPath::DeviceInstance
            | MeterPath::ProductId
            | MeterPath::Connected
            | MeterPath::Latency
            | MeterPath::ErrorCode
            | MeterPath::Position
            | MeterPath::StatusCode
            | MeterPath::UpdateIndex
            | MeterPath::AcPosition
            | MeterPath::AcStatusCode => TextFormat::Integer,
            MeterPath::MaxPower
            | MeterPath::AcPower
            | MeterPath::L1Power
            | MeterPath::L2Power
            | MeterPath::L3Power => TextFormat::Watts,
            MeterPath::AcCurrent
            | MeterPath::L1Current
            | MeterPath::L2Current
            | MeterPath::L3Current => TextFormat::Amps,
            MeterPath::AcVoltage
            | MeterPath::L1Voltage
            | MeterPath::L2Voltage
            | MeterPath::L3Voltage => TextFormat::Volts,
            MeterPath::AcFrequency
            | MeterPath::L1Frequency
            | MeterPath::L2Frequency
            | MeterPath::L3Frequency => TextFormat::Hertz,
            MeterPath::AcPowerFactor | MeterPath::L1PowerFactor => TextFormat::PowerFactor,
            MeterPath::AcEnergyForward
            | MeterPath::AcEnergyReverse
            | MeterPath::L1EnergyForward
            | MeterPath::L1EnergyReverse
            | MeterPath::L2EnergyForward
            | MeterPath::L3EnergyForward => TextFormat::KiloWattHours,
        }
    }

    /// Aggregate and phase-1 paths a quantity is published under.
    pub fn for_quantity(quantity: QuantityName) -> &'static [MeterPath] {
        match quantity {
            QuantityName::Voltage => &[MeterPath::AcVoltage, MeterPath::L1Voltage],
            QuantityName::Current => &[MeterPath::AcCurrent, MeterPath::L1Current],
            QuantityName::ActivePower => &[MeterPath::AcPower, MeterPath::L1Power],
            QuantityName::PowerFactor => &[MeterPath::AcPowerFactor, MeterPath::L1PowerFactor],
            QuantityName::Frequency => &[MeterPath::AcFrequency, MeterPath::L1Frequency],
            QuantityName::ImportEnergy => {
                &[MeterPath::AcEnergyForward, MeterPath::L1EnergyForward]
            }
            QuantityName::ExportEnergy => {
                &[MeterPath::AcEnergyReverse, MeterPath::L1EnergyReverse]
            }
            QuantityName::TotalActiveEnergy => &[],
        }
    }
}

impl fmt::Display for MeterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown path '{0}'")]
pub struct UnknownPath(pub String);

impl FromStr for MeterPath {
    type Err = UnknownPath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeterPath::ALL
            .iter()
            .copied()
            .find(|path| path.as_str() == s)
            .ok_or_else(|| UnknownPath(s.to_string()))
    }
}

/// A published attribute value. `Empty` means "currently not available".
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Empty | Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Empty | Value::Text(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Value::Empty, Value::Float)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("None"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// Display formatting for the textual rendering of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Watts,
    Amps,
    Volts,
    Hertz,
    KiloWattHours,
    PowerFactor,
    Integer,
    Text,
}

impl TextFormat {
    pub fn render(self, value: &Value) -> String {
        if let Value::Text(text) = value {
            return text.clone();
        }
        let Some(v) = value.as_f64() else {
            return "---".to_string();
        };
        match self {
            TextFormat::Watts => format!("{v:.0}W"),
            TextFormat::Amps => format!("{v:.1}A"),
            TextFormat::Volts => format!("{v:.2}V"),
            TextFormat::Hertz => format!("{v:.4}Hz"),
            TextFormat::KiloWattHours => format!("{v:.2}kWh"),
            TextFormat::PowerFactor => format!("{v:.2}"),
            TextFormat::Integer | TextFormat::Text => match value {
                Value::Int(i) => i.to_string(),
                _ => format!("{v:.0}"),
            },
        }
    }
}

/// Mounting position of the inverter the meter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    AcInput1 = 0,
    AcOutput = 1,
    AcInput2 = 2,
}

impl TryFrom<i64> for Position {
    type Error = anyhow::Error;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Position::AcInput1),
            1 => Ok(Position::AcOutput),
            2 => Ok(Position::AcInput2),
            other => anyhow::bail!("invalid inverter position {other}, expected 0, 1 or 2"),
        }
    }
}

/// Fixed identity and configuration of a meter instance, set once at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterIdentity {
    pub product_name: String,
    pub custom_name: String,
    pub device_instance: u32,
    pub connection: String,
    pub max_power: u32,
    pub position: Position,
}

/// Who initiated a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub path: MeterPath,
    pub value: Value,
    pub origin: ChangeOrigin,
}

/// Result of one publish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub status: StatusCode,
    pub update_index: u8,
}

/// One published meter object tree.
///
/// Clones share the same attribute map. Each engine owns the only writing
/// handle of its instance; readers and the bus hold the other clones.
#[derive(Clone)]
pub struct MeterInstance {
    service_name: Arc<str>,
    attributes: Arc<Mutex<HashMap<MeterPath, Value>>>,
    changes: broadcast::Sender<AttributeChange>,
}

impl MeterInstance {
    pub fn new(service_name: impl Into<String>, identity: &MeterIdentity) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let instance = Self {
            service_name: Arc::from(service_name.into()),
            attributes: Arc::new(Mutex::new(HashMap::new())),
            changes,
        };

        let process_version = format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        instance.set_initial(MeterPath::ProcessName, env!("CARGO_PKG_NAME").into());
        instance.set_initial(MeterPath::ProcessVersion, Value::Text(process_version));
        instance.set_initial(MeterPath::Connection, identity.connection.as_str().into());
        instance.set_initial(
            MeterPath::DeviceInstance,
            Value::Int(identity.device_instance.into()),
        );
        instance.set_initial(MeterPath::ProductId, Value::Int(0xFFFF));
        instance.set_initial(MeterPath::ProductName, identity.product_name.as_str().into());
        instance.set_initial(MeterPath::CustomName, identity.custom_name.as_str().into());
        instance.set_initial(MeterPath::FirmwareVersion, "0.1".into());
        instance.set_initial(MeterPath::Connected, Value::Int(1));
        instance.set_initial(MeterPath::Latency, Value::Empty);
        instance.set_initial(MeterPath::ErrorCode, Value::Int(0));
        instance.set_initial(MeterPath::Position, Value::Int(identity.position as i64));
        instance.set_initial(MeterPath::StatusCode, Value::Int(0));
        instance.set_initial(MeterPath::UpdateIndex, Value::Int(0));
        instance.set_initial(MeterPath::MaxPower, Value::Int(identity.max_power.into()));
        // Legacy mirrors, set once and never driven by a cycle.
        instance.set_initial(MeterPath::AcPosition, Value::Int(identity.position as i64));
        instance.set_initial(MeterPath::AcStatusCode, Value::Int(0));
        instance.set_initial(MeterPath::AcPower, Value::Int(0));
        instance.set_initial(MeterPath::AcCurrent, Value::Int(0));
        instance.set_initial(MeterPath::AcVoltage, Value::Int(0));
        for path in MeterPath::ALL {
            instance.lock().entry(path).or_insert(Value::Empty);
        }
        instance
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Seeds a path without raising a change notification.
    pub fn set_initial(&self, path: MeterPath, value: Value) {
        self.lock().insert(path, value);
    }

    pub fn read(&self, path: MeterPath) -> Value {
        self.lock().get(&path).cloned().unwrap_or(Value::Empty)
    }

    /// Textual rendering of a path through its formatter.
    pub fn text(&self, path: MeterPath) -> String {
        path.text_format().render(&self.read(path))
    }

    /// Overwrites a path and notifies subscribers.
    pub fn write(&self, path: MeterPath, value: Value) {
        self.lock().insert(path, value.clone());
        self.notify(path, value, ChangeOrigin::Local);
    }

    /// Stores a value proposed by an external actor. Every change is accepted.
    pub fn accept_external_change(&self, path: MeterPath, value: Value) -> bool {
        debug!(
            service = %self.service_name,
            "someone else updated {} to {}", path, value
        );
        self.lock().insert(path, value.clone());
        self.notify(path, value, ChangeOrigin::External);
        true
    }

    /// Writes the given quantities of `snapshot` to their aggregate and phase-1
    /// paths, then derives `/StatusCode` and bumps `/UpdateIndex`.
    ///
    /// All writes happen under one lock so a reader that observes the new
    /// update index also observes the electrical values of the same cycle.
    pub fn publish_snapshot(
        &self,
        snapshot: &QuantitySnapshot,
        quantities: &[QuantityName],
    ) -> CycleOutcome {
        let mut written = Vec::new();
        let outcome = {
            let mut attributes = self.lock();
            for quantity in quantities {
                let value = Value::from(snapshot.get(*quantity));
                for path in MeterPath::for_quantity(*quantity) {
                    attributes.insert(*path, value.clone());
                    written.push((*path, value.clone()));
                }
            }

            let status = derive_status(snapshot.get(QuantityName::ActivePower));
            if attributes.get(&MeterPath::StatusCode) != Some(&Value::Int(status.code())) {
                attributes.insert(MeterPath::StatusCode, Value::Int(status.code()));
                written.push((MeterPath::StatusCode, Value::Int(status.code())));
            }

            let previous = attributes
                .get(&MeterPath::UpdateIndex)
                .and_then(Value::as_i64)
                .and_then(|i| u8::try_from(i).ok())
                .unwrap_or(0);
            let update_index = next_update_index(previous);
            attributes.insert(MeterPath::UpdateIndex, Value::Int(update_index.into()));
            written.push((MeterPath::UpdateIndex, Value::Int(update_index.into())));

            CycleOutcome {
                status,
                update_index,
            }
        };

        for (path, value) in written {
            self.notify(path, value, ChangeOrigin::Local);
        }
        outcome
    }

    /// Copy of every path and its current value.
    pub fn values(&self) -> HashMap<MeterPath, Value> {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttributeChange> {
        self.changes.subscribe()
    }

    pub fn read_by_path(&self, path: &str) -> Result<Value, UnknownPath> {
        Ok(self.read(path.parse()?))
    }

    pub fn text_by_path(&self, path: &str) -> Result<String, UnknownPath> {
        Ok(self.text(path.parse()?))
    }

    /// String-keyed entry point for external writers. Unknown paths are refused.
    pub fn set_value_by_path(&self, path: &str, value: Value) -> bool {
        match path.parse() {
            Ok(path) => self.accept_external_change(path, value),
            Err(e) => {
                debug!(service = %self.service_name, "refusing write: {}", e);
                false
            }
        }
    }

    fn notify(&self, path: MeterPath, value: Value, origin: ChangeOrigin) {
        // No subscribers is not an error.
        let _ = self.changes.send(AttributeChange {
            path,
            value,
            origin,
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MeterPath, Value>> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
