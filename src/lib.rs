mod sys;
mod regs;
mod gateway;
mod mux;
mod clock;
mod telemetry;
mod store;
mod channel;
mod config;
mod meter;
mod measure;
mod acquisition;
mod energy;
mod archive;
mod device;

#[derive(Debug)]
pub enum Error {
    /// The ADE7953 did not answer the communication probe.
    NotFound,
    /// The SPI bus or operation mutex could not be acquired within the bound.
    MutexTimeout,
    /// The post-transfer verification readback did not match the transfer.
    VerifyMismatch { addr: u16 },
    /// A converted measurement fell outside its plausible physical range.
    SampleOutOfRange { quantity: &'static str, value: f32 },
    /// The wall clock has not been synchronized yet.
    TimeNotSynced,
    /// Channel index outside 0..17.
    InvalidChannel(usize),
    /// A JSON-typed setter received a malformed or out-of-range request.
    ConfigInvalid(String),
    /// The key-value store or filesystem refused an operation.
    Io(std::io::Error),
    Other(Box<dyn std::error::Error + Sync + Send + 'static>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotFound =>
                write!(f, "ADE7953 not responding"),
            Self::MutexTimeout =>
                write!(f, "SPI mutex not acquired in time"),
            Self::VerifyMismatch { addr } =>
                write!(f, "verification failed for register {:#06x}", addr),
            Self::SampleOutOfRange { quantity, value } =>
                write!(f, "{} reading {} out of range", quantity, value),
            Self::TimeNotSynced =>
                write!(f, "wall clock not synchronized"),
            Self::InvalidChannel(index) =>
                write!(f, "channel index {} out of bounds", index),
            Self::ConfigInvalid(reason) =>
                write!(f, "invalid configuration: {}", reason),
            Self::Io(io_error) =>
                write!(f, "I/O error: {}", io_error),
            Self::Other(error) =>
                write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            &Self::Io(ref io_error) => Some(io_error),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::ConfigInvalid(error.to_string())
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use sys::{Driver, IrqLine};

/// Simulated ADE7953 backend, for development and integration tests
/// without the hardware attached.
pub use sys::sim;

pub use channel::{
    CHANNEL_COUNT,
    Phase,
    CtSpecification,
    Calibration,
    ChannelConfig,
};

pub use config::Ade7953Config;

pub use meter::{MeterSnapshot, EnergyBuckets};

pub use gateway::{Gateway, Width};

pub use acquisition::FailureBudget;

pub use store::{KvStore, FsKvStore, MemKvStore};

pub use clock::{Clock, SystemClock, ManualClock};

pub use telemetry::{PayloadMeter, MeterSink, QueueSink};

pub use archive::Consolidator;

pub use device::Meter;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub use sys::imp::Pins;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub type HardwareMeter =
    device::Meter<crate::sys::imp::Ade7953DriverImpl>;
