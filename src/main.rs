use anyhow::{bail, Context, Result};
use sdm120_bridge::config::Config;
use sdm120_bridge::message_engine::MessageEngine;
use sdm120_bridge::meter_instance::{MeterIdentity, MeterInstance};
use sdm120_bridge::mqtt_subscriber::MqttSubscriber;
use sdm120_bridge::poll_engine::PollEngine;
use sdm120_bridge::register_decoder::ModbusRegisterReader;
use sdm120_bridge::service_bus::{mqtt_service_name, serial_service_name, ServiceBus};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MESSAGE_QUEUE_DEPTH: usize = 128;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting SDM120 bridge");
    let config = Config::from_env().context("Invalid configuration")?;

    let mut bus = ServiceBus::new();
    let serial_meter = bus.register(
        serial_service_name(config.meter.device_instance),
        &MeterIdentity {
            product_name: "SDM120 PV".to_string(),
            custom_name: config.meter.device_name.clone(),
            device_instance: config.meter.device_instance,
            connection: format!("SDM120 PV service on {}", config.meter.serial_port),
            max_power: config.meter.max_power,
            position: config.position,
        },
    )?;
    let mqtt_meter = match &config.mqtt {
        Some(mqtt) => Some(bus.register(
            mqtt_service_name(mqtt.device_instance),
            &MeterIdentity {
                product_name: "MQTT PV".to_string(),
                custom_name: mqtt.device_name.clone(),
                device_instance: mqtt.device_instance,
                connection: format!("MQTT PV service on {}", mqtt.topic),
                max_power: mqtt.max_power,
                position: config.position,
            },
        )?),
        None => {
            info!("MQTT_HOST not set, running without the message-fed meter");
            None
        }
    };

    for service in bus.services() {
        spawn_change_logger(service.clone());
    }

    let reader =
        ModbusRegisterReader::open_serial(&config.meter.serial_port, config.meter.slave_id)?;
    let poll_handle = PollEngine::new(reader, serial_meter, config.meter.energy_offset).spawn();

    let subscriber_handle = match (&config.mqtt, mqtt_meter) {
        (Some(mqtt), Some(instance)) => {
            let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
            MessageEngine::new(instance, rx).spawn();
            Some(MqttSubscriber::new(mqtt, tx).spawn())
        }
        _ => None,
    };

    info!("Bridge running with {} published meter(s)", bus.len());

    // Both pipelines run for the life of the process. Reconnecting is left to
    // the process supervisor, so any pipeline ending is fatal.
    tokio::select! {
        result = poll_handle => {
            result.context("Register poll task panicked")?;
            bail!("Register poll loop exited");
        }
        result = wait_for_subscriber(subscriber_handle) => {
            result?;
            bail!("MQTT subscription ended");
        }
    }
}

async fn wait_for_subscriber(handle: Option<JoinHandle<Result<()>>>) -> Result<()> {
    match handle {
        Some(handle) => handle.await.context("MQTT subscriber task panicked")?,
        None => std::future::pending().await,
    }
}

/// Logs every change published on a meter instance.
fn spawn_change_logger(instance: MeterInstance) {
    let mut changes = instance.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => debug!(
                    service = instance.service_name(),
                    origin = ?change.origin,
                    "{} = {}",
                    change.path,
                    change.path.text_format().render(&change.value)
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        service = instance.service_name(),
                        "Change logger skipped {} changes", skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
