use crate::config::MqttConfig;
use crate::message_engine::InboundMessage;
use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;

/// Subscribes to one topic and forwards every publish on it to the message engine.
///
/// There is no reconnect logic: the first connection error ends the task and
/// is returned to the caller.
pub struct MqttSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    output: Sender<InboundMessage>,
}

impl MqttSubscriber {
    pub fn new(config: &MqttConfig, output: Sender<InboundMessage>) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            topic: config.topic.clone(),
            output,
        }
    }

    /// Spawns the subscription in its own task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut subscriber = self;
            subscriber.run().await
        })
    }

    async fn run(&mut self) -> Result<()> {
        info!("Subscribing to MQTT topic {}", self.topic);
        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .with_context(|| format!("MQTT connection error on topic {}", self.topic))?;

            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    info!("Connected to MQTT broker, subscribing to {}", self.topic);
                    self.client
                        .subscribe(&self.topic, QoS::AtMostOnce)
                        .await
                        .context("Failed to queue MQTT subscribe")?;
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    self.output
                        .send(message)
                        .await
                        .map_err(|_| anyhow!("Message engine is gone"))?;
                }
                other => debug!("MQTT event: {:?}", other),
            }
        }
    }
}

/// Connection options for the broker. Credentials are only sent as a complete pair.
fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    match (&config.username, &config.password) {
        (Some(username), Some(password)) => {
            options.set_credentials(username, password);
        }
        (None, None) => {}
        _ => warn!("Incomplete MQTT credentials, connecting anonymously"),
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}
