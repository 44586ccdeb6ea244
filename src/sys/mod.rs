use std::time::Duration;

use crate::Error;

/// Low-level access to the metering front-end: one full-duplex SPI
/// transaction (chip select framed), the four multiplexer select lines,
/// and the active-low IRQ pin.
pub trait Driver: Send + 'static {
    type Irq: IrqLine;

    /// Clock `tx` out while capturing the same number of bytes into `rx`.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), Error>;

    /// Drive the 4-bit multiplexer select code onto the select lines.
    fn set_mux(&mut self, code: u8) -> Result<(), Error>;

    /// Pulse the hardware reset line.
    fn reset(&mut self) -> Result<(), Error>;

    /// Obtain a waitable handle on the IRQ line. Called once, before the
    /// acquisition task starts.
    fn irq_line(&mut self) -> Result<Self::Irq, Error>;
}

/// Blocking wait for a falling edge on the IRQ pin. The edge detection
/// itself happens out of band (kernel or simulator), so no register access
/// and no allocation can occur in interrupt context.
pub trait IrqLine: Send + 'static {
    /// Returns `Ok(true)` if an edge arrived before the timeout.
    fn wait(&mut self, timeout: Duration) -> Result<bool, Error>;
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
#[path = "linux.rs"]
pub mod imp;

pub mod sim;
