//! Conversion of raw ADE7953 readings into physical quantities, the
//! three-phase approximation for CTs on a different phase than the
//! reference channel, plausibility validation, and energy integration.
//!
//! Powers are derived from the line cycle energy accumulators rather than
//! the instantaneous power registers: the accumulation window is defined
//! by LINECYC, which makes the average immune to task scheduling jitter.

use std::f32::consts::PI;

use crate::channel::{ChannelConfig, Phase, PhaseRelation};
use crate::gateway::{Gateway, Width};
use crate::meter::MeterSnapshot;
use crate::regs::ade7953 as regs;
use crate::sys::Driver;
use crate::{Error, Result};

// Plausibility bounds; anything outside discards the whole sample.
const VOLTAGE_MIN: f32 = 50.0;
const VOLTAGE_MAX: f32 = 300.0;
const CURRENT_MIN: f32 = -300.0;
const CURRENT_MAX: f32 = 300.0;
const POWER_MIN: f32 = -100_000.0;
const POWER_MAX: f32 = 100_000.0;
const POWER_FACTOR_MIN: f32 = -1.0;
const POWER_FACTOR_MAX: f32 = 1.0;
const FREQUENCY_MIN: f32 = 45.0;
const FREQUENCY_MAX: f32 = 65.0;

/// Below this magnitude the power factor is considered measurement noise
/// and the whole electrical sample is forced to zero.
const MIN_POWER_FACTOR: f32 = 0.05;
/// Rounding can push a real power factor slightly past one; up to here it
/// is clamped instead of discarded.
const MAX_POWER_FACTOR_CLAMP: f32 = 1.05;
/// No-load floor for the three-phase approximation, which cannot use the
/// chip's no-load detection (that covers only channels A and B natively).
const MIN_CURRENT_THREE_PHASE: f32 = 0.01;

/// Which ADE7953 current channel a meter channel maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdeChannel {
    A,
    B,
}

impl AdeChannel {
    pub fn for_channel(channel: usize) -> AdeChannel {
        if channel == 0 { AdeChannel::A } else { AdeChannel::B }
    }
}

/// One converted line-cycle observation of a channel, before validation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ElectricalSample {
    pub voltage: f32,
    pub current: f32,
    pub active_power: f32,
    pub reactive_power: f32,
    pub apparent_power: f32,
    pub power_factor: f32,
    /// Line cycle energies in Wh / varh / VAh, calibrated and
    /// reverse-corrected. Zero means the chip flagged no-load.
    pub active_energy: f32,
    pub reactive_energy: f32,
    pub apparent_energy: f32,
    /// Set when the values came through the three-phase approximation,
    /// whose no-load gating runs on current instead of the accumulators.
    pub three_phase: bool,
}

fn read_energy<D: Driver>(
    gateway: &Gateway<D>,
    ade: AdeChannel,
    regs_ab: (u16, u16),
    lsb: f32,
    sign: f32,
) -> Result<f32> {
    let addr = if ade == AdeChannel::A { regs_ab.0 } else { regs_ab.1 };
    let raw = gateway.read(addr, Width::W32, true)?;
    Ok(if lsb != 0.0 { raw as f32 / lsb * sign } else { 0.0 })
}

/// Read and convert one channel. `reference_voltage` is the last reading
/// of channel 0, reused for every channel that is not the reference (there
/// is only one voltage input). Returns the sample and, for the reference
/// channel, the measured grid frequency when plausible.
pub fn read_sample<D: Driver>(
    gateway: &Gateway<D>,
    config: &ChannelConfig,
    reference_phase: Phase,
    reference_voltage: f32,
    sample_time_ms: u32,
) -> Result<(ElectricalSample, Option<f32>)> {
    let ade = AdeChannel::for_channel(config.index);
    match config.phase.relation_to(reference_phase) {
        PhaseRelation::Same =>
            read_reference_phase(gateway, config, ade, reference_voltage, sample_time_ms),
        relation =>
            read_shifted_phase(gateway, config, ade, reference_voltage, relation)
                .map(|sample| (sample, None)),
    }
}

fn read_reference_phase<D: Driver>(
    gateway: &Gateway<D>,
    config: &ChannelConfig,
    ade: AdeChannel,
    reference_voltage: f32,
    sample_time_ms: u32,
) -> Result<(ElectricalSample, Option<f32>)> {
    let cal = &config.calibration;
    let sign = if config.reverse { -1.0 } else { 1.0 };

    let active_energy = read_energy(gateway, ade,
        (regs::AENERGYA, regs::AENERGYB), cal.wh_lsb, sign)?;
    let reactive_energy = read_energy(gateway, ade,
        (regs::RENERGYA, regs::RENERGYB), cal.varh_lsb, sign)?;
    let apparent_energy = read_energy(gateway, ade,
        (regs::APENERGYA, regs::APENERGYB), cal.vah_lsb, 1.0)?;

    let mut frequency = None;
    let voltage = if config.index == 0 {
        let raw = gateway.read(regs::VRMS, Width::W32, false)?;
        let period = gateway.read(regs::PERIOD, Width::W16, false)?;
        if period > 0 {
            let measured = regs::PERIOD_CLOCK_HZ / period as f32;
            if validate_frequency(measured).is_ok() {
                frequency = Some(measured);
            }
        }
        if cal.v_lsb != 0.0 { raw as f32 / cal.v_lsb } else { 0.0 }
    } else {
        reference_voltage
    };

    // Average power over the accumulation window.
    let window_hours = sample_time_ms as f32 / 3_600_000.0;
    let (active_power, reactive_power, apparent_power) = if window_hours > 0.0 {
        (active_energy / window_hours,
         reactive_energy / window_hours,
         apparent_energy / window_hours)
    } else {
        (0.0, 0.0, 0.0)
    };

    // Deriving PF and current beats reading them back: one less transfer,
    // and always consistent with the energies. The sign convention follows
    // the datasheet: PF carries the sign of the reactive power.
    let power_factor = if apparent_power == 0.0 {
        0.0
    } else {
        active_power / apparent_power * if reactive_power >= 0.0 { 1.0 } else { -1.0 }
    };
    let current = if voltage > 0.0 { apparent_power.abs() / voltage } else { 0.0 };

    Ok((ElectricalSample {
        voltage,
        current,
        active_power,
        reactive_power,
        apparent_power,
        power_factor,
        active_energy,
        reactive_energy,
        apparent_energy,
        three_phase: false,
    }, frequency))
}

/// A CT on a different phase sees the shared voltage 120 degrees out of
/// place, so the chip's power factor is off by exactly that angle. Undo
/// it, then rebuild the powers from I, V and the corrected PF. The true
/// flow direction is unrecoverable on this path; magnitudes only.
fn read_shifted_phase<D: Driver>(
    gateway: &Gateway<D>,
    config: &ChannelConfig,
    ade: AdeChannel,
    reference_voltage: f32,
    relation: PhaseRelation,
) -> Result<ElectricalSample> {
    let cal = &config.calibration;

    let pf_addr = if ade == AdeChannel::A { regs::PFA } else { regs::PFB };
    let pf_raw = gateway.read(pf_addr, Width::W16, true)? as f32 * regs::PF_PER_LSB;
    let theta = pf_raw.clamp(-1.0, 1.0).acos();
    let power_factor = match relation {
        PhaseRelation::Lagging => (theta - 2.0 * PI / 3.0).cos(),
        PhaseRelation::Leading => -(theta + 2.0 * PI / 3.0).cos(),
        PhaseRelation::Same => unreachable!("dispatched in read_sample"),
    };

    let irms_addr = if ade == AdeChannel::A { regs::IRMSA } else { regs::IRMSB };
    let irms_raw = gateway.read(irms_addr, Width::W32, false)?;
    let current = if cal.a_lsb != 0.0 { irms_raw as f32 / cal.a_lsb } else { 0.0 };

    let voltage = reference_voltage;
    let apparent_power = current * voltage;
    let active_power = apparent_power * power_factor.abs();
    let reactive_power = (apparent_power.powi(2) - active_power.powi(2)).max(0.0).sqrt();

    Ok(ElectricalSample {
        voltage,
        current,
        active_power,
        reactive_power,
        apparent_power,
        power_factor,
        active_energy: 0.0,
        reactive_energy: 0.0,
        apparent_energy: 0.0,
        three_phase: true,
    })
}

/// Noise floor and clamp handling, applied before validation.
pub fn condition(sample: &mut ElectricalSample) {
    sample.apparent_power = sample.apparent_power.abs();

    if sample.power_factor.abs() < MIN_POWER_FACTOR {
        sample.current = 0.0;
        sample.active_power = 0.0;
        sample.reactive_power = 0.0;
        sample.apparent_power = 0.0;
        sample.power_factor = 0.0;
        sample.active_energy = 0.0;
        sample.reactive_energy = 0.0;
        sample.apparent_energy = 0.0;
    }

    let magnitude = sample.power_factor.abs();
    if magnitude > POWER_FACTOR_MAX && magnitude < MAX_POWER_FACTOR_CLAMP {
        log::debug!("clamping power factor {:.3}", sample.power_factor);
        sample.power_factor = POWER_FACTOR_MAX.copysign(sample.power_factor);
        // The distortion power that would reconcile P and S is dropped.
        sample.active_power = sample.apparent_power;
        sample.reactive_power = 0.0;
    }
}

fn validate_range(quantity: &'static str, value: f32, min: f32, max: f32) -> Result<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(Error::SampleOutOfRange { quantity, value })
    }
}

pub fn validate_frequency(value: f32) -> Result<()> {
    validate_range("grid frequency", value, FREQUENCY_MIN, FREQUENCY_MAX)
}

/// Plausibility checks; any failure discards the whole sample.
pub fn validate(sample: &ElectricalSample) -> Result<()> {
    validate_range("voltage", sample.voltage, VOLTAGE_MIN, VOLTAGE_MAX)?;
    validate_range("current", sample.current, CURRENT_MIN, CURRENT_MAX)?;
    validate_range("active power", sample.active_power, POWER_MIN, POWER_MAX)?;
    validate_range("reactive power", sample.reactive_power, POWER_MIN, POWER_MAX)?;
    validate_range("apparent power", sample.apparent_power, POWER_MIN, POWER_MAX)?;
    validate_range("power factor", sample.power_factor,
        POWER_FACTOR_MIN, POWER_FACTOR_MAX)?;
    Ok(())
}

/// The energy accumulators after no-load gating: on the reference-phase
/// path the chip's own no-load detection zeroes them; the three-phase
/// approximation substitutes a current threshold.
fn gating_energies(sample: &ElectricalSample) -> (f32, f32, f32) {
    if !sample.three_phase {
        (sample.active_energy, sample.reactive_energy, sample.apparent_energy)
    } else if sample.current > MIN_CURRENT_THREE_PHASE {
        (1.0, 1.0, 1.0)
    } else {
        (0.0, 0.0, 0.0)
    }
}

/// Fold an accepted sample into a snapshot, integrating energy over
/// `delta_ms`. Quantities whose accumulator sat in the no-load region are
/// zeroed instead of integrated.
pub fn integrate(snapshot: &mut MeterSnapshot, sample: &ElectricalSample, delta_ms: u64) {
    let hours = delta_ms as f64 / 3_600_000.0;

    snapshot.voltage = sample.voltage;
    snapshot.current = sample.current;
    snapshot.active_power = sample.active_power;
    snapshot.reactive_power = sample.reactive_power;
    snapshot.apparent_power = sample.apparent_power;
    snapshot.power_factor = sample.power_factor;

    let (active, reactive, apparent) = gating_energies(sample);

    if active > 0.0 {
        snapshot.active_imported += sample.active_power.abs() as f64 * hours;
    } else if active < 0.0 {
        snapshot.active_exported += sample.active_power.abs() as f64 * hours;
    } else {
        snapshot.active_power = 0.0;
        snapshot.power_factor = 0.0;
    }

    if reactive > 0.0 {
        snapshot.reactive_imported += sample.reactive_power.abs() as f64 * hours;
    } else if reactive < 0.0 {
        snapshot.reactive_exported += sample.reactive_power.abs() as f64 * hours;
    } else {
        snapshot.reactive_power = 0.0;
    }

    if apparent != 0.0 {
        snapshot.apparent_energy += sample.apparent_power as f64 * hours;
    } else {
        snapshot.current = 0.0;
        snapshot.apparent_power = 0.0;
    }
}
