//! The meter owner: explicit lifecycle around the acquisition, energy
//! write-back and hourly spool tasks, plus the public configuration and
//! snapshot API everything external goes through.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde_json::json;

use crate::acquisition::{Engine, FailureBudget};
use crate::archive::Consolidator;
use crate::channel::{ChannelConfig, CHANNEL_COUNT};
use crate::clock::Clock;
use crate::config::{self, Ade7953Config, DEFAULT_SAMPLE_TIME_MS, MAX_SAMPLE_TIME_MS,
    MIN_SAMPLE_TIME_MS};
use crate::energy::EnergyWriter;
use crate::gateway::Gateway;
use crate::meter::{ChannelTable, EnergyBuckets, MeterSnapshot, SnapshotTable};
use crate::store::{self, KvStore};
use crate::sys::Driver;
use crate::telemetry::MeterSink;
use crate::{Error, Result};

const NAMESPACE_ADE7953: &str = "ade7953";
const KEY_CONFIG: &str = "config";
const KEY_SAMPLE_TIME: &str = "sample_time";
const NAMESPACE_CHANNELS: &str = "channels";

fn channel_key(index: usize) -> String {
    format!("ch{}", index)
}

pub struct Meter<D: Driver> {
    gateway: Arc<Gateway<D>>,
    snapshots: Arc<SnapshotTable>,
    channels: Arc<ChannelTable>,
    config: Arc<Mutex<Ade7953Config>>,
    sample_time_ms: Arc<AtomicU32>,
    grid_frequency: Arc<Mutex<f32>>,
    failures: Arc<FailureBudget>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MeterSink>,
    energy: Arc<EnergyWriter>,
    data_dir: PathBuf,
    irq: Option<D::Irq>,
    tasks: Vec<(Sender<()>, JoinHandle<()>)>,
    interrupts: Arc<AtomicU64>,
    readings: Arc<AtomicU64>,
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
impl Meter<crate::sys::imp::Ade7953DriverImpl> {
    /// Open the meter on real hardware.
    pub fn open(
        spidev_path: &str,
        pins: crate::sys::imp::Pins,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MeterSink>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let driver = crate::sys::imp::Ade7953DriverImpl::new(spidev_path, pins)?;
        Meter::new(driver, store, clock, sink, data_dir)
    }
}

impl<D: Driver> Meter<D> {
    pub fn new(
        mut driver: D,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MeterSink>,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Meter<D>> {
        let irq = driver.irq_line()?;
        let failures = Arc::new(FailureBudget::new());
        let gateway = Arc::new(Gateway::new(driver, failures.clone()));
        let snapshots = Arc::new(SnapshotTable::new());
        let channels = Arc::new(ChannelTable::new());
        let data_dir = data_dir.into();
        let energy = Arc::new(EnergyWriter::new(
            store.clone(), snapshots.clone(), channels.clone(), clock.clone(), &data_dir));
        Ok(Meter {
            gateway,
            snapshots,
            channels,
            config: Arc::new(Mutex::new(Ade7953Config::default())),
            sample_time_ms: Arc::new(AtomicU32::new(DEFAULT_SAMPLE_TIME_MS)),
            grid_frequency: Arc::new(Mutex::new(50.0)),
            failures,
            store,
            clock,
            sink,
            energy,
            data_dir,
            irq: Some(irq),
            tasks: Vec::new(),
            interrupts: Arc::new(AtomicU64::new(0)),
            readings: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Bring the chip up and start the tasks: probe communication, restore
    /// configuration, channels and energy counters from the store, program
    /// the chip, then spawn acquisition, energy write-back and the hourly
    /// spool.
    pub fn begin(&mut self) -> Result<()> {
        let irq = self.irq.take()
            .ok_or_else(|| Error::Other("meter already started".into()))?;
        self.gateway.probe()?;
        log::debug!("communication with ADE7953 verified");

        self.load_sample_time()?;
        self.load_config()?;
        self.load_channels()?;
        config::initialize_device(
            &self.gateway, &self.config.lock(), self.sample_time_ms.load(Ordering::Relaxed))?;
        self.energy.load()?;
        log::debug!("configuration and energy counters restored");

        let engine = Engine::new(
            self.gateway.clone(),
            self.snapshots.clone(),
            self.channels.clone(),
            self.config.clone(),
            self.sample_time_ms.clone(),
            self.grid_frequency.clone(),
            self.sink.clone(),
            self.clock.clone(),
            self.interrupts.clone(),
            self.readings.clone(),
        );
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("emeter-acquisition".into())
            .spawn(move || engine.run(irq, stop_rx))?;
        self.tasks.push((stop_tx, handle));

        let energy = self.energy.clone();
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("emeter-energy".into())
            .spawn(move || energy.run_writer(&stop_rx))?;
        self.tasks.push((stop_tx, handle));

        let energy = self.energy.clone();
        let consolidator = Consolidator::new(&self.data_dir);
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("emeter-hourly".into())
            .spawn(move || energy.run_hourly(&consolidator, &stop_rx))?;
        self.tasks.push((stop_tx, handle));

        log::info!("meter started, {} active channels",
            self.channels.active_indices().len());
        Ok(())
    }

    /// Stop the tasks and flush: every task gets its stop signal, the
    /// energy counters get one final write-back and one final CSV row.
    pub fn stop(&mut self) {
        log::debug!("stopping meter");
        for (stop, _) in &self.tasks {
            let _ = stop.send(());
        }
        for (_, handle) in self.tasks.drain(..) {
            if handle.join().is_err() {
                log::error!("a meter task panicked during shutdown");
            }
        }
        self.energy.save();
        if let Err(error) = self.energy.spool_hourly() {
            log::warn!("final spool failed: {}", error);
        }
        log::info!("meter stopped");
    }

    fn load_sample_time(&self) -> Result<()> {
        let stored: Option<u32> =
            store::get_json(&*self.store, NAMESPACE_ADE7953, KEY_SAMPLE_TIME)?;
        let sample_time = match stored {
            Some(value) if (MIN_SAMPLE_TIME_MS..=MAX_SAMPLE_TIME_MS).contains(&value) => value,
            Some(value) => {
                log::warn!("stored sample time {} ms out of range, using default", value);
                DEFAULT_SAMPLE_TIME_MS
            }
            None => DEFAULT_SAMPLE_TIME_MS,
        };
        self.sample_time_ms.store(sample_time, Ordering::Relaxed);
        Ok(())
    }

    fn load_config(&self) -> Result<()> {
        let stored: Option<Ade7953Config> =
            store::get_json(&*self.store, NAMESPACE_ADE7953, KEY_CONFIG)?;
        *self.config.lock() = stored.unwrap_or_default();
        Ok(())
    }

    fn load_channels(&self) -> Result<()> {
        for index in 0..CHANNEL_COUNT {
            let stored: Option<ChannelConfig> =
                store::get_json(&*self.store, NAMESPACE_CHANNELS, &channel_key(index))?;
            if let Some(config) = stored {
                self.channels.set(index, config)?;
            }
        }
        Ok(())
    }

    // Snapshots and live values

    pub fn snapshot(&self, index: usize) -> Result<MeterSnapshot> {
        if index >= CHANNEL_COUNT {
            return Err(Error::InvalidChannel(index));
        }
        Ok(self.snapshots.get(index))
    }

    pub fn snapshots(&self) -> [MeterSnapshot; CHANNEL_COUNT] {
        self.snapshots.all()
    }

    pub fn grid_frequency(&self) -> f32 {
        *self.grid_frequency.lock()
    }

    pub fn reading_count(&self) -> u64 {
        self.readings.load(Ordering::Relaxed)
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }

    /// Whether the failure budget decided the hardware is wedged; the
    /// supervisor is expected to poll this and reboot.
    pub fn restart_requested(&self) -> bool {
        self.failures.restart_requested()
    }

    // Aggregates over the active channels

    pub fn aggregated_active_power(&self, include_reference: bool) -> f32 {
        self.aggregate(include_reference, |snapshot| snapshot.active_power)
    }

    pub fn aggregated_reactive_power(&self, include_reference: bool) -> f32 {
        self.aggregate(include_reference, |snapshot| snapshot.reactive_power)
    }

    pub fn aggregated_apparent_power(&self, include_reference: bool) -> f32 {
        self.aggregate(include_reference, |snapshot| snapshot.apparent_power)
    }

    pub fn aggregated_power_factor(&self, include_reference: bool) -> f32 {
        let apparent = self.aggregated_apparent_power(include_reference);
        if apparent > 0.0 {
            self.aggregated_active_power(include_reference) / apparent
        } else {
            0.0
        }
    }

    fn aggregate(&self, include_reference: bool, value: impl Fn(&MeterSnapshot) -> f32) -> f32 {
        let first = if include_reference { 0 } else { 1 };
        (first..CHANNEL_COUNT)
            .filter(|&index| self.channels.is_active(index))
            .map(|index| value(&self.snapshots.get(index)))
            .sum()
    }

    // Channel configuration

    pub fn channel(&self, index: usize) -> Result<ChannelConfig> {
        self.channels.get(index)
    }

    pub fn set_channel(&self, index: usize, config: ChannelConfig) -> Result<ChannelConfig> {
        let applied = self.channels.set(index, config)?;
        store::put_json(&*self.store, NAMESPACE_CHANNELS, &channel_key(index), &applied)?;
        Ok(applied)
    }

    /// JSON setter for one channel; `partial` merges onto the current
    /// configuration. The `index` field addresses the channel.
    pub fn set_channel_json(
        &self,
        request: &serde_json::Value,
        partial: bool,
    ) -> Result<ChannelConfig> {
        let index = request.get("index").and_then(|v| v.as_u64())
            .ok_or_else(|| Error::ConfigInvalid("missing channel index".into()))? as usize;
        if index >= CHANNEL_COUNT {
            return Err(Error::InvalidChannel(index));
        }
        let value = if partial {
            merge_objects(serde_json::to_value(self.channels.get(index)?)?, request)?
        } else {
            request.clone()
        };
        let config: ChannelConfig = serde_json::from_value(value)?;
        self.set_channel(index, config)
    }

    // Chip configuration

    pub fn config(&self) -> Ade7953Config {
        *self.config.lock()
    }

    /// Replace the calibration block: applied to the chip and persisted
    /// while holding the configuration lock, so readers never observe a
    /// half-applied state.
    pub fn set_config(&self, config: Ade7953Config) -> Result<()> {
        let mut guard = self.config.lock();
        config.apply(&self.gateway)?;
        store::put_json(&*self.store, NAMESPACE_ADE7953, KEY_CONFIG, &config)?;
        *guard = config;
        Ok(())
    }

    pub fn set_config_json(&self, request: &serde_json::Value, partial: bool) -> Result<()> {
        let value = if partial {
            merge_objects(serde_json::to_value(self.config())?, request)?
        } else {
            request.clone()
        };
        let config: Ade7953Config = serde_json::from_value(value)?;
        self.set_config(config)
    }

    // Sample time

    pub fn sample_time_ms(&self) -> u32 {
        self.sample_time_ms.load(Ordering::Relaxed)
    }

    /// Change the accumulation window. Bounded below by the RMS settling
    /// time of the chip.
    pub fn set_sample_time_ms(&self, sample_time_ms: u32) -> Result<()> {
        if !(MIN_SAMPLE_TIME_MS..=MAX_SAMPLE_TIME_MS).contains(&sample_time_ms) {
            return Err(Error::ConfigInvalid(format!(
                "sample time {} ms outside {}..={} ms",
                sample_time_ms, MIN_SAMPLE_TIME_MS, MAX_SAMPLE_TIME_MS)));
        }
        config::write_linecyc(&self.gateway, sample_time_ms)?;
        self.sample_time_ms.store(sample_time_ms, Ordering::Relaxed);
        store::put_json(&*self.store, NAMESPACE_ADE7953, KEY_SAMPLE_TIME, &sample_time_ms)?;
        Ok(())
    }

    // Energy counters

    pub fn reset_energies(&self) -> Result<()> {
        self.energy.reset()
    }

    pub fn set_energies(&self, index: usize, buckets: EnergyBuckets) -> Result<()> {
        self.energy.set_channel(index, buckets)
    }

    /// All active channels with valid measurements, as one JSON document
    /// for the HTTP API and the MQTT publisher.
    pub fn meter_values_json(&self) -> serde_json::Value {
        let mut values = Vec::new();
        for index in 0..CHANNEL_COUNT {
            if !self.channels.is_active(index) {
                continue;
            }
            let snapshot = self.snapshots.get(index);
            if !snapshot.is_valid() {
                continue;
            }
            let Ok(config) = self.channels.get(index) else { continue };
            values.push(json!({
                "index": index,
                "label": config.label,
                "phase": config.phase,
                "data": snapshot,
            }));
        }
        serde_json::Value::Array(values)
    }
}

fn merge_objects(
    base: serde_json::Value,
    patch: &serde_json::Value,
) -> Result<serde_json::Value> {
    let serde_json::Value::Object(mut base) = base else {
        return Err(Error::ConfigInvalid("expected a JSON object".into()));
    };
    let serde_json::Value::Object(patch) = patch else {
        return Err(Error::ConfigInvalid("expected a JSON object".into()));
    };
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
    Ok(serde_json::Value::Object(base))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::Phase;
    use crate::clock::ManualClock;
    use crate::regs::ade7953 as regs;
    use crate::store::MemKvStore;
    use crate::sys::sim;
    use crate::telemetry::QueueSink;
    use std::time::{Duration, Instant};

    // 2026-07-31 11:59:30 UTC
    const WALL: u64 = 1_785_499_170_000;

    struct Bench {
        meter: Meter<sim::SimDriver>,
        handle: sim::SimHandle,
        store: Arc<MemKvStore>,
        clock: Arc<ManualClock>,
        sink: Arc<QueueSink>,
        _dir: tempfile::TempDir,
    }

    fn bench() -> Bench {
        let dir = tempfile::tempdir().unwrap();
        let (driver, handle) = sim::new();
        let store = Arc::new(MemKvStore::new());
        let clock = Arc::new(ManualClock::new());
        clock.set_wall(WALL);
        clock.advance(10_000);
        let sink = Arc::new(QueueSink::new(64));
        let meter = Meter::new(
            driver, store.clone(), clock.clone(), sink.clone(), dir.path()).unwrap();
        Bench { meter, handle, store, clock, sink, _dir: dir }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_begin_programs_chip_and_acquires() {
        let mut bench = bench();
        // Unity calibration reads raw counts; use a scaled channel 0.
        let mut channel = ChannelConfig::default_for(0);
        channel.calibration.v_lsb = 100.0;
        channel.calibration.wh_lsb = 10_000.0;
        channel.calibration.varh_lsb = 10_000.0;
        channel.calibration.vah_lsb = 10_000.0;
        bench.meter.set_channel(0, channel).unwrap();

        bench.meter.begin().unwrap();
        assert_eq!(bench.handle.reg(regs::LINECYC), 20);
        assert!(bench.meter.begin().is_err()); // second begin refused

        // The probe reset the simulated chip, so load the measurement
        // registers only now.
        bench.handle.set_reg(regs::VRMS, 23_000);
        bench.handle.set_reg(regs::PERIOD, 4_475);
        bench.handle.set_reg_signed(regs::AENERGYA, 3_194);
        bench.handle.set_reg_signed(regs::APENERGYA, 3_200);
        bench.handle.raise_irq(regs::IrqStatus::CYCEND);
        assert!(wait_until(Duration::from_secs(5),
            || bench.meter.snapshot(0).unwrap().is_valid()));
        let snapshot = bench.meter.snapshot(0).unwrap();
        assert!((snapshot.voltage - 230.0).abs() < 0.01);
        assert!(snapshot.active_imported > 0.0);
        assert!((bench.meter.grid_frequency() - 50.0).abs() < 0.01);
        assert!(bench.meter.reading_count() >= 1);
        assert!(!bench.sink.is_empty());

        bench.meter.stop();
        // Shutdown flushed the counters and one CSV row.
        let saved: Option<f64> =
            store::get_json(&*bench.store, "energy", "ch0_active_imp").unwrap();
        assert!(saved.unwrap() > 0.0);
        assert!(bench.meter.energy.daily_dir().join("2026-07-31.csv").exists());
    }

    #[test]
    fn test_config_round_trip_and_persistence() {
        let bench = bench();
        let config = Ade7953Config { aw_gain: 0x500000, phcal_a: 42, ..Default::default() };
        bench.meter.set_config(config).unwrap();
        assert_eq!(bench.meter.config(), config);
        assert_eq!(bench.handle.reg(regs::AWGAIN), 0x500000);
        assert_eq!(bench.handle.reg(regs::PHCALA), 42);

        // A fresh meter over the same store comes back with the config.
        let (driver, _) = sim::new();
        let mut restarted = Meter::new(
            driver, bench.store.clone(), bench.clock.clone(),
            Arc::new(QueueSink::new(4)), bench._dir.path()).unwrap();
        restarted.begin().unwrap();
        assert_eq!(restarted.config(), config);
        restarted.stop();
    }

    #[test]
    fn test_channel_round_trip_and_persistence() {
        let bench = bench();
        let mut channel = ChannelConfig::default_for(7);
        channel.active = true;
        channel.label = "Dryer".into();
        channel.phase = Phase::P2;
        channel.reverse = true;
        bench.meter.set_channel(7, channel.clone()).unwrap();
        assert_eq!(bench.meter.channel(7).unwrap(), channel);

        let (driver, _) = sim::new();
        let mut restarted = Meter::new(
            driver, bench.store.clone(), bench.clock.clone(),
            Arc::new(QueueSink::new(4)), bench._dir.path()).unwrap();
        restarted.begin().unwrap();
        assert_eq!(restarted.channel(7).unwrap(), channel);
        restarted.stop();
    }

    #[test]
    fn test_json_setters_validate() {
        let bench = bench();
        // Partial config update touches one register value.
        bench.meter.set_config_json(&serde_json::json!({"awGain": 4300000}), true).unwrap();
        assert_eq!(bench.meter.config().aw_gain, 4_300_000);
        assert_eq!(bench.meter.config().av_gain, regs::DEFAULT_GAIN);

        // Unknown fields and bad types are refused without side effects.
        assert!(matches!(
            bench.meter.set_config_json(&serde_json::json!({"awGainTypo": 1}), true),
            Err(Error::ConfigInvalid(_))));
        assert!(matches!(
            bench.meter.set_config_json(&serde_json::json!({"awGain": "big"}), true),
            Err(Error::ConfigInvalid(_))));
        assert!(matches!(
            bench.meter.set_config_json(&serde_json::json!(17), false),
            Err(Error::ConfigInvalid(_))));
        assert_eq!(bench.meter.config().aw_gain, 4_300_000);

        // Channel patch by index.
        bench.meter.set_channel_json(
            &serde_json::json!({"index": 3, "active": true, "label": "Oven"}), true).unwrap();
        let channel = bench.meter.channel(3).unwrap();
        assert!(channel.active);
        assert_eq!(channel.label, "Oven");
        assert!(bench.meter.set_channel_json(
            &serde_json::json!({"active": true}), true).is_err());
    }

    #[test]
    fn test_sample_time_bounds_and_linecyc() {
        let bench = bench();
        bench.meter.set_sample_time_ms(1000).unwrap();
        assert_eq!(bench.meter.sample_time_ms(), 1000);
        assert_eq!(bench.handle.reg(regs::LINECYC), 100);
        assert!(bench.meter.set_sample_time_ms(100).is_err());
        assert!(bench.meter.set_sample_time_ms(10_000).is_err());
        assert_eq!(bench.meter.sample_time_ms(), 1000);
    }

    #[test]
    fn test_aggregates_sum_active_channels() {
        let bench = bench();
        let mut channel = ChannelConfig::default_for(2);
        channel.active = true;
        bench.meter.set_channel(2, channel).unwrap();
        bench.meter.snapshots.update(0, |snapshot| {
            snapshot.active_power = 1_000.0;
            snapshot.apparent_power = 1_100.0;
        });
        bench.meter.snapshots.update(2, |snapshot| {
            snapshot.active_power = 500.0;
            snapshot.apparent_power = 500.0;
        });
        // Inactive channels do not count.
        bench.meter.snapshots.update(3, |snapshot| snapshot.active_power = 9_999.0);

        assert_eq!(bench.meter.aggregated_active_power(true), 1_500.0);
        assert_eq!(bench.meter.aggregated_active_power(false), 500.0);
        assert_eq!(bench.meter.aggregated_apparent_power(true), 1_600.0);
        let pf = bench.meter.aggregated_power_factor(true);
        assert!((pf - 1_500.0 / 1_600.0).abs() < 1e-6);
    }

    #[test]
    fn test_energy_reset_and_set() {
        let bench = bench();
        bench.meter.snapshots.update(0, |snapshot| snapshot.active_imported = 5.0);
        bench.meter.energy.save();
        bench.meter.reset_energies().unwrap();
        assert_eq!(bench.meter.snapshot(0).unwrap().active_imported, 0.0);
        assert_eq!(bench.store.key_count("energy"), 0);

        let buckets = EnergyBuckets { active_imported: 7.5, ..Default::default() };
        bench.meter.set_energies(1, buckets).unwrap();
        assert_eq!(bench.meter.snapshot(1).unwrap().active_imported, 7.5);
    }

    #[test]
    fn test_meter_values_json_lists_valid_channels() {
        let bench = bench();
        bench.meter.snapshots.update(0, |snapshot| {
            snapshot.active_power = 100.0;
            snapshot.last_wall_ms = WALL;
        });
        // Channel 5 is active but has no valid measurement yet.
        let mut channel = ChannelConfig::default_for(5);
        channel.active = true;
        bench.meter.set_channel(5, channel).unwrap();

        let values = bench.meter.meter_values_json();
        let list = values.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["index"], 0);
        assert_eq!(list[0]["data"]["active_power"], 100.0);
    }
}
