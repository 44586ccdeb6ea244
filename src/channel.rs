//! Per-channel configuration: the physical phase the CT sits on, the CT
//! nameplate data and the LSB-per-unit calibration scalars derived from it.

use serde::{Deserialize, Serialize};

/// Channel 0 (the reference channel) plus 16 multiplexed CT inputs.
pub const CHANNEL_COUNT: usize = 17;

/// Mains phase a CT is clamped around. Channel 0 defines the reference
/// phase; the rotation order is P1 -> P2 -> P3 -> P1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    P1,
    P2,
    P3,
}

/// How a channel's phase stands relative to the reference phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRelation {
    Same,
    /// One phase behind the reference (120 degrees later).
    Lagging,
    /// One phase ahead of the reference (120 degrees earlier).
    Leading,
}

impl Phase {
    pub fn lagging(self) -> Phase {
        match self {
            Phase::P1 => Phase::P2,
            Phase::P2 => Phase::P3,
            Phase::P3 => Phase::P1,
        }
    }

    pub fn leading(self) -> Phase {
        match self {
            Phase::P1 => Phase::P3,
            Phase::P2 => Phase::P1,
            Phase::P3 => Phase::P2,
        }
    }

    /// Relation of `self` to the reference phase `reference`.
    pub fn relation_to(self, reference: Phase) -> PhaseRelation {
        if self == reference {
            PhaseRelation::Same
        } else if self == reference.lagging() {
            PhaseRelation::Lagging
        } else {
            PhaseRelation::Leading
        }
    }

    /// Numeric form used in CSV rows.
    pub fn number(self) -> u8 {
        match self {
            Phase::P1 => 1,
            Phase::P2 => 2,
            Phase::P3 => 3,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Current transformer nameplate values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CtSpecification {
    /// Rated primary current in amperes.
    pub rated_current: f32,
    /// Secondary output voltage (RMS) at rated current.
    pub output_voltage: f32,
    /// User trim factor applied on top of the nameplate values.
    pub scaling: f32,
}

impl Default for CtSpecification {
    fn default() -> Self {
        CtSpecification { rated_current: 30.0, output_voltage: 0.333, scaling: 1.0 }
    }
}

// ADE7953 scale constants: a full-scale sinusoidal input (500 mV peak)
// reads 9032007/sqrt(2) in the RMS registers and 4862401 in the power
// registers, and the energy accumulators sum power samples at 6.99 kHz.
const FULL_SCALE_RMS_CODE: f32 = 6_386_997.0;
const FULL_SCALE_POWER_CODE: f32 = 4_862_401.0;
const FULL_SCALE_INPUT_VRMS: f32 = 0.3536;
const ENERGY_ACCUMULATION_RATE_HZ: f32 = 6_990.0;

/// LSB-per-physical-unit scalars. Raw register values divide by these to
/// become volts, amperes, watts and watt hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Calibration {
    pub v_lsb: f32,
    pub a_lsb: f32,
    pub w_lsb: f32,
    pub var_lsb: f32,
    pub va_lsb: f32,
    pub wh_lsb: f32,
    pub varh_lsb: f32,
    pub vah_lsb: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            v_lsb: 1.0,
            a_lsb: 1.0,
            w_lsb: 1.0,
            var_lsb: 1.0,
            va_lsb: 1.0,
            wh_lsb: 1.0,
            varh_lsb: 1.0,
            vah_lsb: 1.0,
        }
    }
}

impl Calibration {
    /// First-order derivation of the current, power and energy scalars from
    /// a CT nameplate. The voltage scalar is a board property and is kept.
    pub fn derive_from_ct(&self, ct: &CtSpecification) -> Calibration {
        if ct.rated_current <= 0.0 || ct.output_voltage <= 0.0 || ct.scaling <= 0.0 {
            return *self;
        }
        let volts_per_amp = ct.output_voltage / ct.rated_current;
        let a_lsb = FULL_SCALE_RMS_CODE / FULL_SCALE_INPUT_VRMS * volts_per_amp / ct.scaling;
        let full_scale_watts =
            (FULL_SCALE_RMS_CODE / self.v_lsb) * (FULL_SCALE_RMS_CODE / a_lsb);
        let w_lsb = FULL_SCALE_POWER_CODE / full_scale_watts;
        let wh_lsb = w_lsb * ENERGY_ACCUMULATION_RATE_HZ * 3600.0;
        Calibration {
            v_lsb: self.v_lsb,
            a_lsb,
            w_lsb,
            var_lsb: w_lsb,
            va_lsb: w_lsb,
            wh_lsb,
            varh_lsb: wh_lsb,
            vah_lsb: wh_lsb,
        }
    }
}

/// Static configuration of one metering channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub index: usize,
    pub active: bool,
    /// Inverts the sign of active and reactive power and energy, for CTs
    /// installed backwards.
    pub reverse: bool,
    pub label: String,
    pub phase: Phase,
    /// CT nameplate; when present, setting the channel re-derives the
    /// current/power/energy calibration scalars from it.
    #[serde(default)]
    pub ct: Option<CtSpecification>,
    #[serde(default)]
    pub calibration: Calibration,
}

impl ChannelConfig {
    pub fn default_for(index: usize) -> ChannelConfig {
        ChannelConfig {
            index,
            // The reference channel is hard-wired and always sampled.
            active: index == 0,
            reverse: false,
            label: format!("Channel {}", index),
            phase: Phase::P1,
            ct: None,
            calibration: Calibration::default(),
        }
    }
}
