//! The ADE7953 calibration register block. Treated as a value object:
//! never mutated in place, replaced as a whole and re-applied to the chip.

use serde::{Deserialize, Serialize};

use crate::gateway::{Gateway, Width};
use crate::regs::ade7953 as regs;
use crate::sys::Driver;
use crate::Result;

/// Grid cycles per second assumed when converting the sample time into
/// half line cycles.
pub const CYCLES_PER_SECOND: u32 = 50;

pub const MIN_SAMPLE_TIME_MS: u32 = 200;
pub const MAX_SAMPLE_TIME_MS: u32 = 5000;
pub const DEFAULT_SAMPLE_TIME_MS: u32 = 200;

/// The 19 gain, offset and phase calibration registers, in engineering
/// order: voltage gain, current gains, RMS offsets, then per-quantity
/// power gains and offsets for channels A and B, then phase calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default, rename_all = "camelCase")]
pub struct Ade7953Config {
    pub av_gain: i32,
    pub ai_gain: i32,
    pub bi_gain: i32,
    pub ai_rms_os: i32,
    pub bi_rms_os: i32,
    pub aw_gain: i32,
    pub bw_gain: i32,
    pub awatt_os: i32,
    pub bwatt_os: i32,
    pub avar_gain: i32,
    pub bvar_gain: i32,
    pub avar_os: i32,
    pub bvar_os: i32,
    pub ava_gain: i32,
    pub bva_gain: i32,
    pub ava_os: i32,
    pub bva_os: i32,
    pub phcal_a: i32,
    pub phcal_b: i32,
}

impl Default for Ade7953Config {
    fn default() -> Self {
        Ade7953Config {
            av_gain: regs::DEFAULT_GAIN,
            ai_gain: regs::DEFAULT_GAIN,
            bi_gain: regs::DEFAULT_GAIN,
            ai_rms_os: regs::DEFAULT_OFFSET,
            bi_rms_os: regs::DEFAULT_OFFSET,
            aw_gain: regs::DEFAULT_GAIN,
            bw_gain: regs::DEFAULT_GAIN,
            awatt_os: regs::DEFAULT_OFFSET,
            bwatt_os: regs::DEFAULT_OFFSET,
            avar_gain: regs::DEFAULT_GAIN,
            bvar_gain: regs::DEFAULT_GAIN,
            avar_os: regs::DEFAULT_OFFSET,
            bvar_os: regs::DEFAULT_OFFSET,
            ava_gain: regs::DEFAULT_GAIN,
            bva_gain: regs::DEFAULT_GAIN,
            ava_os: regs::DEFAULT_OFFSET,
            bva_os: regs::DEFAULT_OFFSET,
            phcal_a: regs::DEFAULT_PHCAL,
            phcal_b: regs::DEFAULT_PHCAL,
        }
    }
}

impl Ade7953Config {
    /// Write every calibration register. Idempotent; used at boot, on
    /// configuration changes, and after a RESET or CRC interrupt.
    pub fn apply<D: Driver>(&self, gateway: &Gateway<D>) -> Result<()> {
        // Channel B has no voltage gain register by design.
        gateway.write(regs::AVGAIN, Width::W32, self.av_gain as i64)?;
        gateway.write(regs::AIGAIN, Width::W32, self.ai_gain as i64)?;
        gateway.write(regs::BIGAIN, Width::W32, self.bi_gain as i64)?;
        gateway.write(regs::AIRMSOS, Width::W32, self.ai_rms_os as i64)?;
        gateway.write(regs::BIRMSOS, Width::W32, self.bi_rms_os as i64)?;
        gateway.write(regs::AWGAIN, Width::W32, self.aw_gain as i64)?;
        gateway.write(regs::BWGAIN, Width::W32, self.bw_gain as i64)?;
        gateway.write(regs::AWATTOS, Width::W32, self.awatt_os as i64)?;
        gateway.write(regs::BWATTOS, Width::W32, self.bwatt_os as i64)?;
        gateway.write(regs::AVARGAIN, Width::W32, self.avar_gain as i64)?;
        gateway.write(regs::BVARGAIN, Width::W32, self.bvar_gain as i64)?;
        gateway.write(regs::AVAROS, Width::W32, self.avar_os as i64)?;
        gateway.write(regs::BVAROS, Width::W32, self.bvar_os as i64)?;
        gateway.write(regs::AVAGAIN, Width::W32, self.ava_gain as i64)?;
        gateway.write(regs::BVAGAIN, Width::W32, self.bva_gain as i64)?;
        gateway.write(regs::AVAOS, Width::W32, self.ava_os as i64)?;
        gateway.write(regs::BVAOS, Width::W32, self.bva_os as i64)?;
        gateway.write(regs::PHCALA, Width::W16, self.phcal_a as i64)?;
        gateway.write(regs::PHCALB, Width::W16, self.phcal_b as i64)?;
        Ok(())
    }
}

pub fn linecyc_for_sample_time(sample_time_ms: u32) -> u32 {
    let linecyc = sample_time_ms * CYCLES_PER_SECOND * 2 / 1000;
    linecyc.clamp(regs::MIN_LINECYC, regs::MAX_LINECYC)
}

pub fn write_linecyc<D: Driver>(gateway: &Gateway<D>, sample_time_ms: u32) -> Result<()> {
    let linecyc = linecyc_for_sample_time(sample_time_ms);
    gateway.write(regs::LINECYC, Width::W16, linecyc as i64)?;
    log::debug!("LINECYC set to {} half cycles", linecyc);
    Ok(())
}

/// Full device bring-up: unlock and set the reserved performance register,
/// program the no-load thresholds and accumulation mode, apply the
/// calibration block, the accumulation window and the interrupt mask.
/// Also run after RESET and CRC interrupts, when the chip may have fallen
/// back to power-on defaults.
pub fn initialize_device<D: Driver>(
    gateway: &Gateway<D>,
    config: &Ade7953Config,
    sample_time_ms: u32,
) -> Result<()> {
    gateway.write(regs::UNLOCK, Width::W8, regs::UNLOCK_VALUE as i64)?;
    gateway.write(regs::SETUP_RESERVED, Width::W16, regs::SETUP_RESERVED_VALUE as i64)?;

    gateway.write(regs::PGA_V, Width::W8, regs::DEFAULT_PGA as i64)?;
    gateway.write(regs::PGA_IA, Width::W8, regs::DEFAULT_PGA as i64)?;
    gateway.write(regs::PGA_IB, Width::W8, regs::DEFAULT_PGA as i64)?;

    gateway.write(regs::DISNOLOAD, Width::W8, regs::DEFAULT_DISNOLOAD as i64)?;
    gateway.write(regs::AP_NOLOAD, Width::W32, regs::DEFAULT_NOLOAD_LEVEL as i64)?;
    gateway.write(regs::VAR_NOLOAD, Width::W32, regs::DEFAULT_NOLOAD_LEVEL as i64)?;
    gateway.write(regs::VA_NOLOAD, Width::W32, regs::DEFAULT_NOLOAD_LEVEL as i64)?;

    gateway.write(regs::LCYCMODE, Width::W8, regs::DEFAULT_LCYCMODE as i64)?;
    gateway.write(regs::CONFIG, Width::W16, regs::DEFAULT_CONFIG as i64)?;

    config.apply(gateway)?;
    write_linecyc(gateway, sample_time_ms)?;

    gateway.write(regs::IRQENA, Width::W32, regs::DEFAULT_IRQENA as i64)?;
    // Discard any latched interrupt cause.
    gateway.read(regs::RSTIRQSTATA, Width::W32, false)?;
    gateway.read(regs::RSTIRQSTATB, Width::W32, false)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acquisition::FailureBudget;
    use crate::sys::sim;
    use std::sync::Arc;

    #[test]
    fn test_linecyc_arithmetic() {
        assert_eq!(linecyc_for_sample_time(200), 20);
        assert_eq!(linecyc_for_sample_time(1000), 100);
        assert_eq!(linecyc_for_sample_time(5000), 500);
        // The clamp still bounds out-of-range requests.
        assert_eq!(linecyc_for_sample_time(50), regs::MIN_LINECYC);
        assert_eq!(linecyc_for_sample_time(60_000), regs::MAX_LINECYC);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = Ade7953Config { aw_gain: 0x412345, phcal_b: -3, ..Default::default() };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"awGain\""));
        let back: Ade7953Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_initialize_programs_the_chip() {
        let (driver, handle) = sim::new();
        let gateway = Gateway::new(driver, Arc::new(FailureBudget::new()));
        let config = Ade7953Config { bvar_os: -7, ..Default::default() };
        initialize_device(&gateway, &config, 1000).unwrap();
        assert_eq!(handle.reg(regs::LINECYC), 100);
        assert_eq!(handle.reg(regs::LCYCMODE), regs::DEFAULT_LCYCMODE as u32);
        assert_eq!(handle.reg(regs::CONFIG), regs::DEFAULT_CONFIG as u32);
        assert_eq!(handle.reg(regs::IRQENA), regs::DEFAULT_IRQENA);
        assert_eq!(handle.reg(regs::AWGAIN), regs::DEFAULT_GAIN as u32);
        // Negative offsets are stored two's complement truncated to width.
        assert_eq!(handle.reg(regs::BVAROS), (-7i32) as u32);
        assert_eq!(handle.reg(regs::SETUP_RESERVED), regs::SETUP_RESERVED_VALUE as u32);
    }
}
