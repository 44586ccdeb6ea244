//! Serialised, verified access to the ADE7953 register space.
//!
//! Every transfer takes the bus mutex; a verified operation additionally
//! holds the operation mutex across the primary transfer and the three
//! readback transfers (LAST_ADD, LAST_OP, LAST_RWDATA), so concurrent
//! callers cannot interleave between them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::acquisition::FailureBudget;
use crate::regs::ade7953 as regs;
use crate::sys::Driver;
use crate::{Error, Result};

/// Bound on bus and operation mutex acquisition.
const MUTEX_TIMEOUT: Duration = Duration::from_millis(100);

const PROBE_ATTEMPTS: u32 = 5;
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// ADE7953 register data widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W24,
    W32,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W24 => 24,
            Self::W32 => 32,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    fn mask(self) -> u32 {
        (u64::MAX >> (64 - self.bits())) as u32
    }

    /// The LAST_RWDATA register matching this width.
    fn readback_reg(self) -> u16 {
        match self {
            Self::W8 => regs::LAST_RWDATA_8,
            Self::W16 => regs::LAST_RWDATA_16,
            Self::W24 => regs::LAST_RWDATA_24,
            Self::W32 => regs::LAST_RWDATA_32,
        }
    }
}

fn sign_extend(raw: u32, width: Width) -> i64 {
    let shift = 64 - width.bits();
    ((raw as u64) << shift) as i64 >> shift
}

#[derive(Debug)]
pub struct Gateway<D: Driver> {
    bus: Mutex<D>,
    op: Mutex<()>,
    failures: Arc<FailureBudget>,
}

impl<D: Driver> Gateway<D> {
    pub fn new(driver: D, failures: Arc<FailureBudget>) -> Gateway<D> {
        Gateway { bus: Mutex::new(driver), op: Mutex::new(()), failures }
    }

    pub fn failures(&self) -> &Arc<FailureBudget> {
        &self.failures
    }

    /// Verified register read.
    pub fn read(&self, addr: u16, width: Width, signed: bool) -> Result<i64> {
        self.read_with(addr, width, signed, true)
    }

    /// Unverified register read; used inside the verification sequence and
    /// for registers whose readback would be self-defeating.
    pub fn read_unverified(&self, addr: u16, width: Width, signed: bool) -> Result<i64> {
        self.read_with(addr, width, signed, false)
    }

    /// Verified register write.
    pub fn write(&self, addr: u16, width: Width, value: i64) -> Result<()> {
        self.write_with(addr, width, value, true)
    }

    pub fn write_unverified(&self, addr: u16, width: Width, value: i64) -> Result<()> {
        self.write_with(addr, width, value, false)
    }

    fn read_with(&self, addr: u16, width: Width, signed: bool, verify: bool) -> Result<i64> {
        let _op = if verify { Some(self.lock_op()?) } else { None };
        let raw = self.transfer(addr, width, None)?;
        log::trace!("read({:#06x}) = {:#x}", addr, raw);
        if verify {
            self.verify(addr, width, raw, false)?;
        }
        Ok(if signed { sign_extend(raw, width) } else { raw as i64 })
    }

    fn write_with(&self, addr: u16, width: Width, value: i64, verify: bool) -> Result<()> {
        log::trace!("write({:#06x}, {:#x})", addr, value);
        let raw = value as u32 & width.mask();
        let _op = if verify { Some(self.lock_op()?) } else { None };
        self.transfer(addr, width, Some(raw))?;
        if verify {
            self.verify(addr, width, raw, true)?;
        }
        Ok(())
    }

    fn lock_op(&self) -> Result<parking_lot::MutexGuard<'_, ()>> {
        self.op.try_lock_for(MUTEX_TIMEOUT).ok_or_else(|| {
            log::error!("operation mutex not acquired within {:?}", MUTEX_TIMEOUT);
            self.failures.record();
            Error::MutexTimeout
        })
    }

    /// One framed SPI transaction: three header bytes then the data,
    /// MSB first. `data` is `Some` for a write, `None` for a read.
    fn transfer(&self, addr: u16, width: Width, data: Option<u32>) -> Result<u32> {
        let mut tx = [0u8; 7];
        let mut rx = [0u8; 7];
        let len = 3 + width.bytes();
        tx[0] = (addr >> 8) as u8;
        tx[1] = addr as u8;
        tx[2] = if data.is_some() { regs::WRITE_TAG } else { regs::READ_TAG };
        if let Some(value) = data {
            for i in 0..width.bytes() {
                tx[3 + i] = (value >> ((width.bytes() - 1 - i) * 8)) as u8;
            }
        }
        {
            let mut bus = self.bus.try_lock_for(MUTEX_TIMEOUT).ok_or_else(|| {
                log::error!("bus mutex not acquired within {:?}", MUTEX_TIMEOUT);
                self.failures.record();
                Error::MutexTimeout
            })?;
            bus.transfer(&tx[..len], &mut rx[..len])?;
        }
        let mut raw: u32 = 0;
        for &byte in &rx[3..len] {
            raw = raw << 8 | byte as u32;
        }
        Ok(raw)
    }

    /// Compare the chip's record of the last communication against what we
    /// just did. Runs with the operation mutex held; uses unverified reads
    /// to avoid recursing.
    fn verify(&self, addr: u16, width: Width, expected: u32, was_write: bool) -> Result<()> {
        let mismatch = || {
            log::warn!("readback mismatch for register {:#06x}", addr);
            self.failures.record();
            Error::VerifyMismatch { addr }
        };
        let last_add = self.read_with(regs::LAST_ADD, Width::W16, false, false)?;
        if last_add != addr as i64 {
            return Err(mismatch());
        }
        let last_op = self.read_with(regs::LAST_OP, Width::W8, false, false)?;
        let expected_op = if was_write { regs::LAST_OP_WRITE } else { regs::LAST_OP_READ };
        if last_op != expected_op as i64 {
            return Err(mismatch());
        }
        let last_data = self.read_with(width.readback_reg(), width, false, false)?;
        if last_data != expected as i64 {
            return Err(mismatch());
        }
        Ok(())
    }

    /// Drive the multiplexer select lines. Shares the bus mutex because the
    /// select lines live on the same driver handle.
    pub fn select_mux(&self, code: u8) -> Result<()> {
        let mut bus = self.bus.try_lock_for(MUTEX_TIMEOUT).ok_or(Error::MutexTimeout)?;
        bus.set_mux(code)
    }

    /// Pulse the hardware reset line.
    pub fn reset_device(&self) -> Result<()> {
        let mut bus = self.bus.try_lock_for(MUTEX_TIMEOUT).ok_or(Error::MutexTimeout)?;
        bus.reset()
    }

    /// Establish communication: reset the chip and check that AP_NOLOAD
    /// reads back at its power-on value.
    pub fn probe(&self) -> Result<()> {
        for attempt in 1..=PROBE_ATTEMPTS {
            log::debug!("communication attempt {}/{}", attempt, PROBE_ATTEMPTS);
            self.reset_device()?;
            match self.read(regs::AP_NOLOAD, Width::W32, false) {
                Ok(value) if value as u32 == regs::EXPECTED_AP_NOLOAD => return Ok(()),
                Ok(value) => log::warn!("unexpected AP_NOLOAD value {:#x}", value),
                Err(error) => log::warn!("communication attempt failed: {}", error),
            }
            if attempt != PROBE_ATTEMPTS {
                std::thread::sleep(PROBE_INTERVAL);
            }
        }
        Err(Error::NotFound)
    }
}
