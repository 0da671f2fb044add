//! SDM120 virtual meter bridge
//!
//! This library polls an SDM120 energy meter over Modbus RTU and receives
//! measurements from an MQTT feed, publishing each source as its own meter
//! instance on the service bus.

pub mod config;
pub mod message_engine;
pub mod meter_instance;
pub mod mqtt_subscriber;
pub mod poll_engine;
pub mod quantity;
pub mod register_decoder;
pub mod service_bus;
pub mod status;

// Re-export commonly used types for easier access
pub use config::Config;
pub use message_engine::{InboundMessage, MessageEngine};
pub use meter_instance::{MeterIdentity, MeterInstance, MeterPath, Value};
pub use poll_engine::PollEngine;
pub use quantity::{QuantityName, QuantitySnapshot};
pub use register_decoder::{ModbusRegisterReader, RegisterTransport};
pub use service_bus::ServiceBus;
