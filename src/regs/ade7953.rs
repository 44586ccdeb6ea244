#![allow(dead_code)]

use bitflags::bitflags;

// Register addresses follow the ADE7953 datasheet convention: the address
// range encodes the register width (0x0xx = 8 bit, 0x1xx = 16 bit,
// 0x2xx = 24 bit, 0x3xx = 32 bit).

// 8-bit configuration registers.

/// No-load detection disable.
pub const DISNOLOAD: u16 = 0x001;
/// Line cycle accumulation mode configuration.
pub const LCYCMODE: u16 = 0x004;
/// Voltage channel gain configuration.
pub const PGA_V: u16 = 0x007;
/// Current channel A gain configuration.
pub const PGA_IA: u16 = 0x008;
/// Current channel B gain configuration.
pub const PGA_IB: u16 = 0x009;
/// Type of the last successful communication (0x35 read, 0xCA write).
pub const LAST_OP: u16 = 0x0FD;
/// Data from the last successful 8-bit communication.
pub const LAST_RWDATA_8: u16 = 0x0FF;
/// Write 0xAD here to unlock the reserved setup register.
pub const UNLOCK: u16 = 0x0FE;

// 16-bit registers.

/// Number of half line cycles per accumulation period.
pub const LINECYC: u16 = 0x101;
/// Configuration register.
pub const CONFIG: u16 = 0x102;
/// Phase calibration, current channel A (sign-magnitude).
pub const PHCALA: u16 = 0x108;
/// Phase calibration, current channel B (sign-magnitude).
pub const PHCALB: u16 = 0x109;
/// Power factor, current channel A.
pub const PFA: u16 = 0x10A;
/// Power factor, current channel B.
pub const PFB: u16 = 0x10B;
/// Voltage period measurement.
pub const PERIOD: u16 = 0x10E;
/// Reserved setup register; must hold 0x0030 for datasheet performance.
pub const SETUP_RESERVED: u16 = 0x120;
/// Address of the last successful communication.
pub const LAST_ADD: u16 = 0x1FE;
/// Data from the last successful 16-bit communication.
pub const LAST_RWDATA_16: u16 = 0x1FF;

// 24-bit registers.

/// Data from the last successful 24-bit communication.
pub const LAST_RWDATA_24: u16 = 0x2FF;

// 32-bit registers.

/// Active power no-load level.
pub const AP_NOLOAD: u16 = 0x303;
/// Reactive power no-load level.
pub const VAR_NOLOAD: u16 = 0x304;
/// Apparent power no-load level.
pub const VA_NOLOAD: u16 = 0x305;
/// Instantaneous active power, channel A / B.
pub const AWATT: u16 = 0x312;
pub const BWATT: u16 = 0x313;
/// Instantaneous reactive power, channel A / B.
pub const AVAR: u16 = 0x314;
pub const BVAR: u16 = 0x315;
/// Instantaneous apparent power, channel A / B.
pub const AVA: u16 = 0x310;
pub const BVA: u16 = 0x311;
/// Current RMS, channel A / B.
pub const IRMSA: u16 = 0x31A;
pub const IRMSB: u16 = 0x31B;
/// Voltage RMS.
pub const VRMS: u16 = 0x31C;
/// Line cycle active energy, channel A / B.
pub const AENERGYA: u16 = 0x31E;
pub const AENERGYB: u16 = 0x31F;
/// Line cycle reactive energy, channel A / B.
pub const RENERGYA: u16 = 0x320;
pub const RENERGYB: u16 = 0x321;
/// Line cycle apparent energy, channel A / B.
pub const APENERGYA: u16 = 0x322;
pub const APENERGYB: u16 = 0x323;
/// Interrupt enable, channel A.
pub const IRQENA: u16 = 0x32C;
/// Reset-on-read interrupt status, channel A / B.
pub const RSTIRQSTATA: u16 = 0x32E;
pub const RSTIRQSTATB: u16 = 0x331;
/// Gain calibration registers.
pub const AIGAIN: u16 = 0x380;
pub const AVGAIN: u16 = 0x381;
pub const AWGAIN: u16 = 0x382;
pub const AVARGAIN: u16 = 0x383;
pub const AVAGAIN: u16 = 0x384;
pub const BIGAIN: u16 = 0x38C;
pub const BWGAIN: u16 = 0x38E;
pub const BVARGAIN: u16 = 0x38F;
pub const BVAGAIN: u16 = 0x390;
/// Offset calibration registers.
pub const AIRMSOS: u16 = 0x386;
pub const VRMSOS: u16 = 0x388;
pub const AWATTOS: u16 = 0x389;
pub const AVAROS: u16 = 0x38A;
pub const AVAOS: u16 = 0x38B;
pub const BIRMSOS: u16 = 0x392;
pub const BWATTOS: u16 = 0x395;
pub const BVAROS: u16 = 0x396;
pub const BVAOS: u16 = 0x397;
/// Data from the last successful 32-bit communication.
pub const LAST_RWDATA_32: u16 = 0x3FF;

// Wire protocol tags.

/// Third header byte selecting a register read.
pub const READ_TAG: u8 = 0x80;
/// Third header byte selecting a register write.
pub const WRITE_TAG: u8 = 0x00;
/// LAST_OP value after a successful read.
pub const LAST_OP_READ: u8 = 0x35;
/// LAST_OP value after a successful write.
pub const LAST_OP_WRITE: u8 = 0xCA;

bitflags! {
    /// IRQSTATA / RSTIRQSTATA bits (datasheet table 23). Only the bits
    /// the acquisition engine dispatches on are named here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqStatus: u32 {
        /// End of a line cycle accumulation period.
        const CYCEND = 1 << 18;
        /// End of a software or hardware reset. Not maskable.
        const RESET  = 1 << 20;
        /// The configuration checksum has changed.
        const CRC    = 1 << 21;
    }
}

// Boot-time register values.

/// Value the unlock register must be written with before touching
/// `SETUP_RESERVED`.
pub const UNLOCK_VALUE: u8 = 0xAD;
/// Mandatory value of the reserved setup register.
pub const SETUP_RESERVED_VALUE: u16 = 0x0030;
/// Default gain calibration (unity).
pub const DEFAULT_GAIN: i32 = 0x400000;
/// Default offset calibration.
pub const DEFAULT_OFFSET: i32 = 0;
/// Default phase calibration: 0.02 deg/LSB, 0.2 deg minimum for CTs.
pub const DEFAULT_PHCAL: i32 = 10;
/// No-load threshold for all three accumulators: 0.01% of full scale.
pub const DEFAULT_NOLOAD_LEVEL: u32 = 0x00E419;
/// Power-on value of AP_NOLOAD, used as the communication probe.
pub const EXPECTED_AP_NOLOAD: u32 = 0x00E419;
/// Enable all no-load detection.
pub const DEFAULT_DISNOLOAD: u8 = 0x00;
/// Line cycle accumulation on every channel, read-with-reset off.
pub const DEFAULT_LCYCMODE: u8 = 0b0111_1111;
/// PGA gain 1 on all inputs.
pub const DEFAULT_PGA: u8 = 0;
/// Line accumulation for PF averaging, CRC enabled, HPF enabled.
pub const DEFAULT_CONFIG: u16 = 0b1000_0001_0000_1100;
/// CYCEND (18), RESET (20, not maskable) and CRC (21) enabled.
pub const DEFAULT_IRQENA: u32 = IrqStatus::CYCEND.bits()
    | IrqStatus::RESET.bits()
    | IrqStatus::CRC.bits();

/// LINECYC clamp range (half line cycles).
pub const MIN_LINECYC: u32 = 10;
pub const MAX_LINECYC: u32 = 1000;

/// Clock of the period measurement in Hz; grid frequency is this value
/// divided by the PERIOD register reading.
pub const PERIOD_CLOCK_HZ: f32 = 223_750.0;
/// Power factor registers count 1/32768 per LSB.
pub const PF_PER_LSB: f32 = 1.0 / 32768.0;
