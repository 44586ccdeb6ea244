//! In-process simulation of the ADE7953 register file, faithful enough to
//! exercise the wire framing, the readback verification protocol and the
//! acquisition pipeline without hardware.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::regs::ade7953 as regs;
use crate::Result;

#[derive(Debug, Default)]
struct SimState {
    regs: HashMap<u16, u32>,
    last_add: u16,
    last_op: u8,
    last_rwdata: u32,
    irq_status: u32,
    irq_pending: bool,
    mux_code: u8,
    resets: u32,
    // Test hook: corrupt the next LAST_RWDATA readback.
    clobber_verify: bool,
}

impl SimState {
    fn power_on(&mut self) {
        self.regs.clear();
        self.regs.insert(regs::AP_NOLOAD, regs::EXPECTED_AP_NOLOAD);
        self.last_add = 0;
        self.last_op = 0;
        self.last_rwdata = 0;
        self.irq_status = 0;
    }

    fn read(&mut self, addr: u16) -> u32 {
        match addr {
            regs::LAST_ADD => self.last_add as u32,
            regs::LAST_OP => self.last_op as u32,
            regs::LAST_RWDATA_8 | regs::LAST_RWDATA_16
            | regs::LAST_RWDATA_24 | regs::LAST_RWDATA_32 => {
                if self.clobber_verify {
                    self.clobber_verify = false;
                    !self.last_rwdata
                } else {
                    self.last_rwdata
                }
            }
            regs::RSTIRQSTATA | regs::RSTIRQSTATB => {
                let status = self.irq_status;
                self.irq_status = 0;
                status
            }
            _ => self.regs.get(&addr).copied().unwrap_or(0),
        }
    }

    fn is_readback(addr: u16) -> bool {
        matches!(addr,
            regs::LAST_ADD | regs::LAST_OP | regs::LAST_RWDATA_8
            | regs::LAST_RWDATA_16 | regs::LAST_RWDATA_24 | regs::LAST_RWDATA_32)
    }
}

// The address range encodes the register width.
fn width_mask(addr: u16) -> u32 {
    match addr >> 8 {
        0 => 0xFF,
        1 => 0xFFFF,
        2 => 0xFF_FFFF,
        _ => 0xFFFF_FFFF,
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SimState>,
    irq: Condvar,
}

/// Driver half of the simulator; plug into `Gateway`/`Meter` like the
/// hardware backend.
#[derive(Debug)]
pub struct SimDriver {
    shared: Arc<Shared>,
}

/// Test-side control handle over the same simulated chip.
#[derive(Debug, Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
}

pub fn new() -> (SimDriver, SimHandle) {
    let mut state = SimState::default();
    state.power_on();
    let shared = Arc::new(Shared { state: Mutex::new(state), irq: Condvar::new() });
    (SimDriver { shared: shared.clone() }, SimHandle { shared })
}

impl super::Driver for SimDriver {
    type Irq = SimIrqLine;

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        assert!(tx.len() == rx.len() && tx.len() >= 3);
        let addr = (tx[0] as u16) << 8 | tx[1] as u16;
        let data_bytes = tx.len() - 3;
        let mut state = self.shared.state.lock();
        if tx[2] == regs::READ_TAG {
            let value = state.read(addr) & width_mask(addr);
            for (i, byte) in rx[3..].iter_mut().enumerate() {
                *byte = (value >> ((data_bytes - 1 - i) * 8)) as u8;
            }
            if !SimState::is_readback(addr) {
                state.last_add = addr;
                state.last_op = regs::LAST_OP_READ;
                state.last_rwdata = value;
            }
        } else {
            let mut value: u32 = 0;
            for &byte in &tx[3..] {
                value = value << 8 | byte as u32;
            }
            let value = value & width_mask(addr);
            state.regs.insert(addr, value);
            state.last_add = addr;
            state.last_op = regs::LAST_OP_WRITE;
            state.last_rwdata = value;
        }
        Ok(())
    }

    fn set_mux(&mut self, code: u8) -> Result<()> {
        self.shared.state.lock().mux_code = code & 0x0F;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.power_on();
        state.resets += 1;
        Ok(())
    }

    fn irq_line(&mut self) -> Result<SimIrqLine> {
        Ok(SimIrqLine { shared: self.shared.clone() })
    }
}

#[derive(Debug)]
pub struct SimIrqLine {
    shared: Arc<Shared>,
}

impl super::IrqLine for SimIrqLine {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let mut state = self.shared.state.lock();
        if !state.irq_pending {
            if self.shared.irq.wait_for(&mut state, timeout).timed_out() {
                return Ok(false);
            }
        }
        let pending = state.irq_pending;
        state.irq_pending = false;
        Ok(pending)
    }
}

impl SimHandle {
    /// Set a measurement register to a raw (width-truncated) value.
    pub fn set_reg(&self, addr: u16, value: u32) {
        self.shared.state.lock().regs.insert(addr, value & width_mask(addr));
    }

    /// Set a signed measurement register from an engineering-side value.
    pub fn set_reg_signed(&self, addr: u16, value: i32) {
        self.set_reg(addr, value as u32);
    }

    pub fn reg(&self, addr: u16) -> u32 {
        self.shared.state.lock().regs.get(&addr).copied().unwrap_or(0)
    }

    pub fn mux_code(&self) -> u8 {
        self.shared.state.lock().mux_code
    }

    pub fn resets(&self) -> u32 {
        self.shared.state.lock().resets
    }

    /// Latch interrupt status bits and pulse the IRQ line.
    pub fn raise_irq(&self, status: regs::IrqStatus) {
        let mut state = self.shared.state.lock();
        state.irq_status |= status.bits();
        state.irq_pending = true;
        self.shared.irq.notify_all();
    }

    /// Make the next LAST_RWDATA readback disagree with the transfer.
    pub fn clobber_next_verify(&self) {
        self.shared.state.lock().clobber_verify = true;
    }
}
