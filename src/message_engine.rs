use crate::meter_instance::{CycleOutcome, MeterInstance};
use crate::quantity::{QuantityName, QuantitySnapshot};
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quantities a message carries; the rest of the instance is left untouched.
pub const MESSAGE_QUANTITIES: [QuantityName; 3] = [
    QuantityName::ActivePower,
    QuantityName::Current,
    QuantityName::Voltage,
];

/// A raw payload as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Decoded message body. Unknown vendor fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MeterMessage {
    pub power: f64,
    pub current: f64,
    pub voltage: f64,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid meter message: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl MeterMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_snapshot(&self) -> QuantitySnapshot {
        QuantitySnapshot::new()
            .with(QuantityName::ActivePower, self.power)
            .with(QuantityName::Current, self.current)
            .with(QuantityName::Voltage, self.voltage)
    }
}

/// Publishes every decodable inbound message into its instance, in arrival order.
pub struct MessageEngine {
    instance: MeterInstance,
    messages: Receiver<InboundMessage>,
}

impl MessageEngine {
    pub fn new(instance: MeterInstance, messages: Receiver<InboundMessage>) -> Self {
        Self { instance, messages }
    }

    /// Spawns the message handler in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut engine = self;
            engine.run().await;
        })
    }

    /// Handles messages until every sender is gone.
    pub async fn run(&mut self) {
        info!(
            service = self.instance.service_name(),
            "Starting message handler"
        );
        while let Some(message) = self.messages.recv().await {
            self.handle(&message);
        }
        info!(
            service = self.instance.service_name(),
            "Message channel closed, message handler exiting"
        );
    }

    /// Decodes and publishes one message. Malformed messages change nothing.
    pub fn handle(&self, message: &InboundMessage) -> Option<CycleOutcome> {
        let decoded = match MeterMessage::decode(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Dropping message: {}",
                    e
                );
                return None;
            }
        };

        let snapshot = decoded.to_snapshot().rounded();
        let outcome = self
            .instance
            .publish_snapshot(&snapshot, &MESSAGE_QUANTITIES);
        debug!(
            service = self.instance.service_name(),
            topic = %message.topic,
            "Published {}W - {}V - {}A, status {:?}, update index {}",
            decoded.power,
            decoded.voltage,
            decoded.current,
            outcome.status,
            outcome.update_index
        );
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter_instance::{MeterIdentity, MeterPath, Position, Value};
    use crate::status::StatusCode;
    use tokio::sync::mpsc;

    fn instance() -> MeterInstance {
        MeterInstance::new(
            "com.victronenergy.pvinverter.mqtt_pv_41",
            &MeterIdentity {
                product_name: "MQTT PV".to_string(),
                custom_name: "Balcony".to_string(),
                device_instance: 41,
                connection: "MQTT PV service".to_string(),
                max_power: 600,
                position: Position::AcOutput,
            },
        )
    }

    fn message(payload: &str) -> InboundMessage {
        InboundMessage {
            topic: "pv/meter".to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let decoded = MeterMessage::decode(
            br#"{"power":294,"current":1.3,"voltage":231.6,"ENERGY":{"Total":12.5},"id":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            MeterMessage {
                power: 294.0,
                current: 1.3,
                voltage: 231.6
            }
        );
    }

    #[test]
    fn test_decode_rejects_missing_and_non_numeric_fields() {
        assert!(MeterMessage::decode(br#"{"current":1.3,"voltage":231.6}"#).is_err());
        assert!(MeterMessage::decode(br#"{"power":"high","current":1.3,"voltage":231.6}"#).is_err());
        assert!(MeterMessage::decode(br#"{"power":null,"current":1.3,"voltage":231.6}"#).is_err());
        assert!(MeterMessage::decode(b"not json").is_err());
        assert!(MeterMessage::decode(b"[294, 1.3, 231.6]").is_err());
    }

    #[test]
    fn test_message_publishes_both_views() {
        let meter = instance();
        let engine = MessageEngine::new(meter.clone(), mpsc::channel(1).1);

        let outcome = engine
            .handle(&message(r#"{"power":294,"current":1.3,"voltage":231.6}"#))
            .unwrap();

        for path in [MeterPath::AcPower, MeterPath::L1Power] {
            assert_eq!(meter.read(path), Value::Float(294.0));
        }
        for path in [MeterPath::AcCurrent, MeterPath::L1Current] {
            assert_eq!(meter.read(path), Value::Float(1.3));
        }
        for path in [MeterPath::AcVoltage, MeterPath::L1Voltage] {
            assert_eq!(meter.read(path), Value::Float(231.6));
        }
        assert_eq!(outcome.status, StatusCode::Running);
        assert_eq!(outcome.update_index, 1);
        assert_eq!(meter.read(MeterPath::StatusCode), Value::Int(7));
    }

    #[test]
    fn test_malformed_message_leaves_instance_unchanged() {
        let meter = instance();
        let engine = MessageEngine::new(meter.clone(), mpsc::channel(1).1);
        engine
            .handle(&message(r#"{"power":294,"current":1.3,"voltage":231.6}"#))
            .unwrap();
        let before = meter.values();

        let outcome = engine.handle(&message(r#"{"current":1.3,"voltage":231.6}"#));

        assert!(outcome.is_none());
        assert_eq!(meter.values(), before);
        assert_eq!(meter.read(MeterPath::UpdateIndex), Value::Int(1));
    }

    #[test]
    fn test_low_power_message_is_standby() {
        let meter = instance();
        let engine = MessageEngine::new(meter.clone(), mpsc::channel(1).1);

        let outcome = engine
            .handle(&message(r#"{"power":4.2,"current":0.02,"voltage":230.1}"#))
            .unwrap();

        assert_eq!(outcome.status, StatusCode::Standby);
        assert_eq!(meter.read(MeterPath::StatusCode), Value::Int(8));
    }

    #[tokio::test]
    async fn test_messages_processed_in_arrival_order() {
        let meter = instance();
        let (tx, rx) = mpsc::channel(8);
        let handle = MessageEngine::new(meter.clone(), rx).spawn();

        tx.send(message(r#"{"power":100,"current":0.5,"voltage":230}"#))
            .await
            .unwrap();
        tx.send(message(r#"{"current":1.0}"#)).await.unwrap();
        tx.send(message(r#"{"power":5,"current":0.1,"voltage":229}"#))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(meter.read(MeterPath::AcPower), Value::Float(5.0));
        assert_eq!(meter.read(MeterPath::AcVoltage), Value::Float(229.0));
        assert_eq!(meter.read(MeterPath::StatusCode), Value::Int(8));
        assert_eq!(meter.read(MeterPath::UpdateIndex), Value::Int(2));
    }
}
