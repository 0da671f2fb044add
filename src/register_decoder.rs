use crate::quantity::{QuantityName, QuantitySnapshot};
use anyhow::Context as _;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::{debug, info, warn};

pub const BAUD_RATE: u32 = 9600;
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);
/// Every quantity is an IEEE-754 float spread over two registers.
pub const FLOAT_REGISTER_COUNT: u16 = 2;

/// Where a quantity lives in the meter's input register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub quantity: QuantityName,
    pub address: u16,
    pub register_count: u16,
}

const fn float_register(quantity: QuantityName, address: u16) -> RegisterSpec {
    RegisterSpec {
        quantity,
        address,
        register_count: FLOAT_REGISTER_COUNT,
    }
}

/// SDM120 input register map. Display precision lives on `QuantityName::precision`.
pub const REGISTER_MAP: [RegisterSpec; 8] = [
    float_register(QuantityName::Voltage, 0x0000),
    float_register(QuantityName::Current, 0x0006),
    float_register(QuantityName::ActivePower, 0x000C),
    float_register(QuantityName::PowerFactor, 0x001E),
    float_register(QuantityName::Frequency, 0x0046),
    float_register(QuantityName::ImportEnergy, 0x0048),
    float_register(QuantityName::ExportEnergy, 0x004A),
    float_register(QuantityName::TotalActiveEnergy, 0x0156),
];

/// Why a single register read did not produce a value.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("modbus exception {0:?}")]
    Exception(ExceptionCode),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("expected {expected} registers, got {actual}")]
    ShortResponse { expected: u16, actual: usize },
}

/// Capability to read one float from the meter.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_float(&mut self, address: u16, register_count: u16) -> Result<f32, ReadError>;
}

/// Converts two registers into a f32, high word first.
pub fn merge_u16_f32(high: u16, low: u16) -> f32 {
    let combined: u32 = ((high as u32) << 16) | (low as u32);
    f32::from_bits(combined)
}

/// Reads every quantity of the register map with one independent call each.
///
/// A failed read leaves only its own quantity absent.
pub async fn read_snapshot<T: RegisterTransport + ?Sized>(transport: &mut T) -> QuantitySnapshot {
    let mut snapshot = QuantitySnapshot::new();
    for register in REGISTER_MAP {
        match transport
            .read_float(register.address, register.register_count)
            .await
        {
            Ok(value) => snapshot.set(register.quantity, Some(value as f64)),
            Err(e) => {
                warn!(
                    quantity = %register.quantity,
                    address = register.address,
                    "register read failed: {}",
                    e
                );
                snapshot.set(register.quantity, None);
            }
        }
    }
    snapshot
}

/// Modbus client for an SDM120 meter reached through tokio-modbus.
pub struct ModbusRegisterReader {
    ctx: Context,
    response_timeout: Duration,
}

impl ModbusRegisterReader {
    /// Wraps an already attached Modbus context.
    pub fn from_context(ctx: Context, response_timeout: Duration) -> Self {
        Self {
            ctx,
            response_timeout,
        }
    }

    /// Opens the serial device with 9600 8N1 settings and attaches an RTU client.
    pub fn open_serial(path: &str, slave_id: u8) -> anyhow::Result<Self> {
        info!("Opening {} at {} baud for slave {}", path, BAUD_RATE, slave_id);
        let builder = tokio_serial::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(RESPONSE_TIMEOUT);
        let serial = SerialStream::open(&builder)
            .with_context(|| format!("Failed to open serial port {}", path))?;
        let ctx = rtu::attach_slave(serial, Slave(slave_id));
        Ok(Self::from_context(ctx, RESPONSE_TIMEOUT))
    }
}

#[async_trait]
impl RegisterTransport for ModbusRegisterReader {
    async fn read_float(&mut self, address: u16, register_count: u16) -> Result<f32, ReadError> {
        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        let response = timeout(
            self.response_timeout,
            self.ctx.read_input_registers(address, register_count),
        )
        .await
        .map_err(|_| ReadError::Timeout(self.response_timeout))?;

        match response {
            Ok(Ok(registers)) => {
                if registers.len() < 2 {
                    return Err(ReadError::ShortResponse {
                        expected: register_count,
                        actual: registers.len(),
                    });
                }
                let value = merge_u16_f32(registers[0], registers[1]);
                debug!("Read {:#06x} -> {:?} = {}", address, registers, value);
                Ok(value)
            }
            Ok(Err(exception)) => Err(ReadError::Exception(exception)),
            Err(e) => Err(ReadError::Transport(e.to_string())),
        }
    }
}
