use crate::meter_instance::{CycleOutcome, MeterInstance};
use crate::quantity::{QuantityName, QuantitySnapshot};
use crate::register_decoder::{read_snapshot, RegisterTransport};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub const POLL_PERIOD: Duration = Duration::from_millis(1000);

/// Polls the meter on a fixed cadence and publishes each cycle into its instance.
pub struct PollEngine<T> {
    transport: T,
    instance: MeterInstance,
    energy_offset: f64,
    period: Duration,
}

impl<T: RegisterTransport + 'static> PollEngine<T> {
    pub fn new(transport: T, instance: MeterInstance, energy_offset: f64) -> Self {
        Self {
            transport,
            instance,
            energy_offset,
            period: POLL_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Spawns the poll loop in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut engine = self;
            engine.run().await;
        })
    }

    /// Runs forever. Cycles never overlap: a cycle that outlasts the period
    /// pushes the next tick back instead of skipping or stacking it.
    pub async fn run(&mut self) {
        info!(
            service = self.instance.service_name(),
            "Starting register poll every {:?}", self.period
        );

        let mut poll_interval = interval(self.period);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            poll_interval.tick().await;
            self.poll_once().await;
        }
    }

    /// Reads all registers and publishes the result as one cycle.
    pub async fn poll_once(&mut self) -> CycleOutcome {
        let raw = read_snapshot(&mut self.transport).await;
        self.publish(raw)
    }

    fn publish(&self, raw: QuantitySnapshot) -> CycleOutcome {
        let snapshot = raw.apply_import_offset(self.energy_offset).rounded();
        let outcome = self
            .instance
            .publish_snapshot(&snapshot, &QuantityName::ALL);

        debug!(
            service = self.instance.service_name(),
            power = ?snapshot.get(QuantityName::ActivePower),
            voltage = ?snapshot.get(QuantityName::Voltage),
            current = ?snapshot.get(QuantityName::Current),
            total_energy = ?snapshot.get(QuantityName::TotalActiveEnergy),
            status = ?outcome.status,
            update_index = outcome.update_index,
            "Published {}/8 quantities",
            snapshot.present_count()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter_instance::{MeterIdentity, MeterPath, Position, Value};
    use crate::register_decoder::tests::FakeMeter;
    use crate::register_decoder::{ReadError, REGISTER_MAP};
    use crate::status::StatusCode;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Meter that takes `delay` per register and records when each cycle starts.
    struct SlowMeter {
        inner: FakeMeter,
        delay: Duration,
        epoch: Instant,
        cycle_starts: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait]
    impl RegisterTransport for SlowMeter {
        async fn read_float(&mut self, address: u16, register_count: u16) -> Result<f32, ReadError> {
            if address == REGISTER_MAP[0].address {
                self.cycle_starts.lock().unwrap().push(self.epoch.elapsed());
            }
            tokio::time::sleep(self.delay).await;
            self.inner.read_float(address, register_count).await
        }
    }

    fn instance() -> MeterInstance {
        MeterInstance::new(
            "com.victronenergy.pvinverter.sdm120_pv_40",
            &MeterIdentity {
                product_name: "SDM120 PV".to_string(),
                custom_name: "SDM120 PV".to_string(),
                device_instance: 40,
                connection: "SDM120 PV service".to_string(),
                max_power: 800,
                position: Position::AcOutput,
            },
        )
    }

    fn full_meter() -> FakeMeter {
        FakeMeter::default()
            .with(QuantityName::Voltage, 230.456)
            .with(QuantityName::Current, 1.254)
            .with(QuantityName::ActivePower, 288.7)
            .with(QuantityName::PowerFactor, 0.97)
            .with(QuantityName::Frequency, 50.0012)
            .with(QuantityName::ImportEnergy, 100.0)
            .with(QuantityName::ExportEnergy, 5.0)
            .with(QuantityName::TotalActiveEnergy, 105.0)
    }

    #[tokio::test]
    async fn test_full_cycle_publishes_rounded_values() {
        let meter = instance();
        let mut engine = PollEngine::new(full_meter(), meter.clone(), 0.5);

        let outcome = engine.poll_once().await;

        assert_eq!(meter.read(MeterPath::AcVoltage), Value::Float(230.46));
        assert_eq!(meter.read(MeterPath::L1Voltage), Value::Float(230.46));
        assert_eq!(meter.read(MeterPath::AcCurrent), Value::Float(1.3));
        assert_eq!(meter.read(MeterPath::AcPower), Value::Float(289.0));
        assert_eq!(meter.read(MeterPath::L1PowerFactor), Value::Float(0.97));
        assert_eq!(meter.read(MeterPath::L1Frequency), Value::Float(50.0012));
        assert_eq!(meter.read(MeterPath::AcEnergyForward), Value::Float(100.5));
        assert_eq!(meter.read(MeterPath::L1EnergyReverse), Value::Float(5.0));
        assert_eq!(meter.text(MeterPath::AcEnergyReverse), "5.00kWh");
        assert_eq!(outcome.status, StatusCode::Running);
        assert_eq!(outcome.update_index, 1);
        assert_eq!(meter.read(MeterPath::StatusCode), Value::Int(7));
    }

    #[tokio::test]
    async fn test_single_failed_read_only_blanks_that_quantity() {
        let meter = instance();
        let mut engine = PollEngine::new(full_meter(), meter.clone(), 0.0);
        engine.poll_once().await;
        assert_eq!(meter.read(MeterPath::AcVoltage), Value::Float(230.46));

        engine.transport = full_meter().failing(QuantityName::Voltage);
        let outcome = engine.poll_once().await;

        assert_eq!(meter.read(MeterPath::AcVoltage), Value::Empty);
        assert_eq!(meter.read(MeterPath::L1Voltage), Value::Empty);
        assert_eq!(meter.read(MeterPath::AcCurrent), Value::Float(1.3));
        assert_eq!(meter.read(MeterPath::AcPower), Value::Float(289.0));
        assert_eq!(outcome.update_index, 2);
    }

    #[tokio::test]
    async fn test_offset_not_applied_to_failed_import() {
        let meter = instance();
        let transport = full_meter().failing(QuantityName::ImportEnergy);
        let mut engine = PollEngine::new(transport, meter.clone(), 0.5);

        engine.poll_once().await;

        assert_eq!(meter.read(MeterPath::AcEnergyForward), Value::Empty);
        assert_eq!(meter.read(MeterPath::AcEnergyReverse), Value::Float(5.0));
    }

    #[tokio::test]
    async fn test_unreadable_meter_is_standby_and_still_counts() {
        let meter = instance();
        let mut engine = PollEngine::new(FakeMeter::default(), meter.clone(), 0.5);

        let outcome = engine.poll_once().await;

        assert_eq!(outcome.status, StatusCode::Standby);
        assert_eq!(outcome.update_index, 1);
        assert_eq!(meter.read(MeterPath::AcPower), Value::Empty);
        assert_eq!(meter.read(MeterPath::StatusCode), Value::Int(8));
    }

    #[tokio::test]
    async fn test_update_index_wraps() {
        let meter = instance();
        let mut engine = PollEngine::new(full_meter(), meter.clone(), 0.0);

        for expected in 1..=255u8 {
            assert_eq!(engine.poll_once().await.update_index, expected);
        }
        assert_eq!(engine.poll_once().await.update_index, 0);
        assert_eq!(engine.poll_once().await.update_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_engine_polls_on_period() {
        let meter = instance();
        let _handle = PollEngine::new(full_meter(), meter.clone(), 0.0).spawn();

        // First tick fires immediately, then once per period.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(meter.read(MeterPath::UpdateIndex), Value::Int(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_cycle_defers_next_tick() {
        let meter = instance();
        let cycle_starts = Arc::new(Mutex::new(Vec::new()));
        let transport = SlowMeter {
            inner: full_meter(),
            delay: Duration::from_millis(200),
            epoch: Instant::now(),
            cycle_starts: cycle_starts.clone(),
        };
        let _handle = PollEngine::new(transport, meter.clone(), 0.0).spawn();

        // 8 reads of 200 ms make every cycle 1600 ms against a 1000 ms period.
        tokio::time::sleep(Duration::from_millis(5000)).await;

        let starts: Vec<u128> = cycle_starts
            .lock()
            .unwrap()
            .iter()
            .map(Duration::as_millis)
            .collect();
        assert_eq!(starts, vec![0, 1600, 3200, 4800]);
        // Three cycles completed; the fourth is still reading.
        assert_eq!(meter.read(MeterPath::UpdateIndex), Value::Int(3));
    }
}
