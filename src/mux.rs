//! 16:1 analog selector feeding the 16 external CT inputs onto ADE7953
//! current channel B.

use std::sync::Arc;

use crate::gateway::Gateway;
use crate::sys::Driver;
use crate::Result;

pub const INPUT_COUNT: u8 = 16;

#[derive(Debug)]
pub struct Multiplexer<D: Driver> {
    gateway: Arc<Gateway<D>>,
}

impl<D: Driver> Multiplexer<D> {
    pub fn new(gateway: Arc<Gateway<D>>) -> Multiplexer<D> {
        Multiplexer { gateway }
    }

    /// Drive the select lines to `input`. Does not wait for settling; the
    /// acquisition engine leaves a full line cycle for that.
    pub fn select(&self, input: u8) -> Result<()> {
        debug_assert!(input < INPUT_COUNT);
        log::trace!("multiplexer input {}", input);
        self.gateway.select_mux(input & (INPUT_COUNT - 1))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acquisition::FailureBudget;
    use crate::sys::sim;

    #[test]
    fn test_select_drives_code_lines() {
        let (driver, handle) = sim::new();
        let gateway = Arc::new(Gateway::new(driver, Arc::new(FailureBudget::new())));
        let mux = Multiplexer::new(gateway);
        for input in 0..INPUT_COUNT {
            mux.select(input).unwrap();
            assert_eq!(handle.mux_code(), input);
        }
    }
}
