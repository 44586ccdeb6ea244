//! The IRQ-driven acquisition engine: waits for CYCEND, rotates the
//! multiplexer over the active secondary channels, and drives the
//! measurement pipeline for the settled secondary plus the reference
//! channel. Channel switching happens right after the chip freezes its
//! accumulators, so the next full line cycle is settling time and the one
//! after carries valid data for the newly selected input.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::CHANNEL_COUNT;
use crate::clock::Clock;
use crate::config::{self, Ade7953Config};
use crate::gateway::{Gateway, Width};
use crate::measure;
use crate::meter::{ChannelTable, SnapshotTable};
use crate::mux::Multiplexer;
use crate::regs::ade7953 as regs;
use crate::sys::{Driver, IrqLine};
use crate::telemetry::{MeterSink, PayloadMeter};
use crate::Result;

/// Extra slack on top of the sample time when waiting for the interrupt.
const IRQ_TIMEOUT_SLACK: Duration = Duration::from_millis(1000);

const MAX_FAILURES_BEFORE_RESTART: u32 = 100;
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window failure counter shared by the gateway and the
/// measurement pipeline. A burst of failures means wedged hardware and
/// asks the supervisor for a restart; sparse failures age out.
#[derive(Debug)]
pub struct FailureBudget {
    state: Mutex<FailureState>,
    restart: AtomicBool,
}

#[derive(Debug, Default)]
struct FailureState {
    count: u32,
    first: Option<Instant>,
}

impl FailureBudget {
    pub fn new() -> FailureBudget {
        FailureBudget { state: Mutex::new(FailureState::default()), restart: AtomicBool::new(false) }
    }

    pub fn record(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let first = *state.first.get_or_insert(now);
        state.count += 1;
        if now.duration_since(first) > FAILURE_WINDOW {
            log::debug!("failure window elapsed, resetting count (was {})", state.count);
            *state = FailureState::default();
        } else if state.count >= MAX_FAILURES_BEFORE_RESTART {
            log::error!("{} failures within {:?}, requesting restart",
                state.count, FAILURE_WINDOW);
            self.restart.store(true, Ordering::SeqCst);
            *state = FailureState::default();
        }
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the chip raised its interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrqEvent {
    CycEnd,
    Reset,
    CrcChange,
    Other,
}

fn classify(status: regs::IrqStatus) -> IrqEvent {
    if status.contains(regs::IrqStatus::RESET) {
        IrqEvent::Reset
    } else if status.contains(regs::IrqStatus::CRC) {
        IrqEvent::CrcChange
    } else if status.contains(regs::IrqStatus::CYCEND) {
        IrqEvent::CycEnd
    } else {
        IrqEvent::Other
    }
}

pub struct Engine<D: Driver> {
    gateway: Arc<Gateway<D>>,
    mux: Multiplexer<D>,
    snapshots: Arc<SnapshotTable>,
    channels: Arc<ChannelTable>,
    config: Arc<Mutex<Ade7953Config>>,
    sample_time_ms: Arc<AtomicU32>,
    grid_frequency: Arc<Mutex<f32>>,
    sink: Arc<dyn MeterSink>,
    clock: Arc<dyn Clock>,
    /// Secondary channel currently selected on the multiplexer;
    /// 0 means none active.
    current_secondary: usize,
    interrupts: Arc<AtomicU64>,
    readings: Arc<AtomicU64>,
}

impl<D: Driver> Engine<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<Gateway<D>>,
        snapshots: Arc<SnapshotTable>,
        channels: Arc<ChannelTable>,
        config: Arc<Mutex<Ade7953Config>>,
        sample_time_ms: Arc<AtomicU32>,
        grid_frequency: Arc<Mutex<f32>>,
        sink: Arc<dyn MeterSink>,
        clock: Arc<dyn Clock>,
        interrupts: Arc<AtomicU64>,
        readings: Arc<AtomicU64>,
    ) -> Engine<D> {
        Engine {
            mux: Multiplexer::new(gateway.clone()),
            gateway,
            snapshots,
            channels,
            config,
            sample_time_ms,
            grid_frequency,
            sink,
            clock,
            current_secondary: 0,
            interrupts,
            readings,
        }
    }

    /// Task body. Returns when the stop channel fires or closes.
    pub fn run(mut self, mut irq: D::Irq, stop: Receiver<()>) {
        log::debug!("acquisition task started");
        loop {
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            let sample_time = self.sample_time_ms.load(Ordering::Relaxed) as u64;
            let timeout = Duration::from_millis(sample_time) + IRQ_TIMEOUT_SLACK;
            match irq.wait(timeout) {
                Ok(true) => self.service(),
                // A missed window on its own is not a failure; the failure
                // budget catches a genuinely wedged chip via the reads.
                Ok(false) => log::debug!("no CYCEND within {:?}", timeout),
                Err(error) => log::error!("IRQ wait failed: {}", error),
            }
        }
        log::debug!("acquisition task stopping");
    }

    /// Handle one interrupt: capture the timestamp first (it names the
    /// instant the accumulators were frozen), then read and clear the
    /// status register and dispatch on the cause.
    pub(crate) fn service(&mut self) {
        let wall_ms = self.clock.wall_ms();
        let monotonic_ms = self.clock.monotonic_ms();
        self.interrupts.fetch_add(1, Ordering::Relaxed);

        let status = match self.gateway.read(regs::RSTIRQSTATA, Width::W32, false) {
            Ok(raw) => regs::IrqStatus::from_bits_truncate(raw as u32),
            Err(error) => {
                log::warn!("failed to read interrupt status: {}", error);
                return;
            }
        };
        match classify(status) {
            IrqEvent::CycEnd => self.handle_cycend(wall_ms, monotonic_ms),
            IrqEvent::Reset => {
                log::warn!("chip reset detected, restoring configuration");
                self.reinitialize();
            }
            IrqEvent::CrcChange => {
                log::warn!("register checksum changed, restoring configuration");
                self.reinitialize();
            }
            IrqEvent::Other => log::warn!("unhandled interrupt status {:#010x}",
                status.bits()),
        }
    }

    fn handle_cycend(&mut self, wall_ms: Option<u64>, monotonic_ms: u64) {
        // Rotate now: the accumulators stay frozen until the next CYCEND,
        // which leaves the whole next line cycle for mux settling.
        self.current_secondary = self.channels
            .next_active_secondary(self.current_secondary)
            .unwrap_or(0);
        let input = self.current_secondary.saturating_sub(1) as u8;
        if let Err(error) = self.mux.select(input) {
            log::warn!("multiplexer select failed: {}", error);
        }

        if self.current_secondary != 0 {
            self.process_channel(self.current_secondary, wall_ms, monotonic_ms);
        }
        // The reference channel has its own ADE7953 input and is always
        // sampled.
        self.process_channel(0, wall_ms, monotonic_ms);
    }

    fn process_channel(&self, channel: usize, wall_ms: Option<u64>, monotonic_ms: u64) {
        match self.try_process(channel, wall_ms, monotonic_ms) {
            Ok(true) => {}
            Ok(false) => log::debug!("channel {} reading discarded", channel),
            Err(error) => log::warn!("channel {} reading failed: {}", channel, error),
        }
    }

    fn try_process(
        &self,
        channel: usize,
        wall_ms: Option<u64>,
        monotonic_ms: u64,
    ) -> Result<bool> {
        debug_assert!(channel < CHANNEL_COUNT);
        let config = self.channels.get(channel)?;
        let sample_time = self.sample_time_ms.load(Ordering::Relaxed);

        let previous = self.snapshots.get(channel);
        let delta_ms = if previous.last_monotonic_ms == 0 {
            // First valid sample: integrate over one nominal window.
            sample_time as u64
        } else {
            monotonic_ms - previous.last_monotonic_ms
        };
        if previous.last_monotonic_ms != 0 && delta_ms == 0 {
            log::warn!("channel {}: zero time delta, discarding reading", channel);
            return Ok(false);
        }

        let reference = self.channels.get(0)?;
        let reference_voltage = self.snapshots.get(0).voltage;
        let (mut sample, frequency) = measure::read_sample(
            &self.gateway, &config, reference.phase, reference_voltage, sample_time)?;
        measure::condition(&mut sample);
        if let Err(error) = measure::validate(&sample) {
            self.gateway.failures().record();
            return Err(error);
        }
        if let Some(frequency) = frequency {
            *self.grid_frequency.lock() = frequency;
        }

        self.snapshots.update(channel, |snapshot| {
            measure::integrate(snapshot, &sample, delta_ms);
            snapshot.last_monotonic_ms = monotonic_ms;
            if let Some(wall_ms) = wall_ms {
                snapshot.last_wall_ms = wall_ms;
            }
        });
        self.readings.fetch_add(1, Ordering::Relaxed);

        // Telemetry wants the gated values, so read the snapshot back.
        if let Some(wall_ms) = wall_ms {
            let snapshot = self.snapshots.get(channel);
            self.sink.push(PayloadMeter {
                channel,
                wall_ms,
                active_power: snapshot.active_power,
                power_factor: snapshot.power_factor,
            });
        }
        Ok(true)
    }

    fn reinitialize(&self) {
        let config = *self.config.lock();
        let sample_time = self.sample_time_ms.load(Ordering::Relaxed);
        if let Err(error) = config::initialize_device(&self.gateway, &config, sample_time) {
            log::error!("failed to restore configuration: {}", error);
        }
    }
}
