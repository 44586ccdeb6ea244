use std::ffi::CString;
use std::io;
use std::time::Duration;

use libc::{c_int, c_ulong, c_void};

use crate::{Error, Result};

#[derive(Debug)]
struct Fd(c_int);

impl Fd {
    fn open(path: &str, flags: c_int) -> io::Result<Fd> {
        let path = CString::new(path).unwrap();
        unsafe {
            let fd = libc::open(path.as_ptr(), flags);
            if fd == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(Fd(fd))
            }
        }
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        unsafe {
            let written = libc::write(self.0, data.as_ptr() as *const c_void, data.len());
            if written != data.len() as isize {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            if libc::close(self.0) == -1 {
                panic!("error closing fd: {}", io::Error::last_os_error())
            }
        }
    }
}

// <linux/spi/spidev.h>
const SPI_IOC_WR_MODE: c_ulong = 0x4001_6b01;
const SPI_IOC_WR_MAX_SPEED_HZ: c_ulong = 0x4004_6b04;
const SPI_IOC_MESSAGE_1: c_ulong = 0x4020_6b00;

/// The ADE7953 tops out at 2 MHz SPI clock.
const SPI_SPEED_HZ: u32 = 2_000_000;

#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

#[derive(Debug)]
struct OutputPin {
    value: Fd,
}

impl OutputPin {
    fn new(number: u32) -> io::Result<OutputPin> {
        export(number)?;
        write_attribute(number, "direction", "out")?;
        let value = Fd::open(&format!("/sys/class/gpio/gpio{}/value", number), libc::O_WRONLY)?;
        Ok(OutputPin { value })
    }

    fn set(&self, high: bool) -> io::Result<()> {
        self.value.write_all(if high { b"1" } else { b"0" })
    }
}

fn export(number: u32) -> io::Result<()> {
    // Exporting an already exported pin fails with EBUSY; that is fine.
    match Fd::open("/sys/class/gpio/export", libc::O_WRONLY) {
        Ok(fd) => match fd.write_all(format!("{}", number).as_bytes()) {
            Err(error) if error.raw_os_error() == Some(libc::EBUSY) => Ok(()),
            other => other,
        },
        Err(error) => Err(error),
    }
}

fn write_attribute(number: u32, attribute: &str, value: &str) -> io::Result<()> {
    let fd = Fd::open(&format!("/sys/class/gpio/gpio{}/{}", number, attribute),
        libc::O_WRONLY)?;
    fd.write_all(value.as_bytes())
}

/// GPIO assignments of the meter board.
#[derive(Debug, Clone, Copy)]
pub struct Pins {
    /// Multiplexer select lines S0..S3, least significant bit first.
    pub mux: [u32; 4],
    pub reset: u32,
    pub irq: u32,
}

#[derive(Debug)]
pub struct Ade7953DriverImpl {
    spi_fd: Fd,
    mux_pins: [OutputPin; 4],
    reset_pin: OutputPin,
    irq_number: u32,
}

impl Ade7953DriverImpl {
    pub fn new(spidev_path: &str, pins: Pins) -> Result<Ade7953DriverImpl> {
        let spi_fd = Fd::open(spidev_path, libc::O_RDWR)
            .map_err(|_| Error::NotFound)?;
        unsafe {
            let mode: u8 = 0; // CPOL=0, CPHA=0 per the ADE7953 datasheet
            if libc::ioctl(spi_fd.0, SPI_IOC_WR_MODE, &mode) == -1 {
                return Err(io::Error::last_os_error().into());
            }
            let speed: u32 = SPI_SPEED_HZ;
            if libc::ioctl(spi_fd.0, SPI_IOC_WR_MAX_SPEED_HZ, &speed) == -1 {
                return Err(io::Error::last_os_error().into());
            }
        }
        let mux_pins = [
            OutputPin::new(pins.mux[0])?,
            OutputPin::new(pins.mux[1])?,
            OutputPin::new(pins.mux[2])?,
            OutputPin::new(pins.mux[3])?,
        ];
        let reset_pin = OutputPin::new(pins.reset)?;
        reset_pin.set(true)?;
        export(pins.irq)?;
        write_attribute(pins.irq, "direction", "in")?;
        write_attribute(pins.irq, "edge", "falling")?;
        Ok(Ade7953DriverImpl { spi_fd, mux_pins, reset_pin, irq_number: pins.irq })
    }
}

impl super::Driver for Ade7953DriverImpl {
    type Irq = GpioIrqLine;

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<()> {
        assert!(tx.len() == rx.len());
        let mut message = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: SPI_SPEED_HZ,
            ..SpiIocTransfer::default()
        };
        unsafe {
            if libc::ioctl(self.spi_fd.0, SPI_IOC_MESSAGE_1, &mut message) == -1 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    fn set_mux(&mut self, code: u8) -> Result<()> {
        for (bit, pin) in self.mux_pins.iter().enumerate() {
            pin.set(code & (1 << bit) != 0)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_pin.set(false)?;
        std::thread::sleep(Duration::from_millis(200));
        self.reset_pin.set(true)?;
        std::thread::sleep(Duration::from_millis(200));
        Ok(())
    }

    fn irq_line(&mut self) -> Result<GpioIrqLine> {
        let value = Fd::open(&format!("/sys/class/gpio/gpio{}/value", self.irq_number),
            libc::O_RDONLY)?;
        Ok(GpioIrqLine { value })
    }
}

#[derive(Debug)]
pub struct GpioIrqLine {
    value: Fd,
}

impl super::IrqLine for GpioIrqLine {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.value.0,
            events: libc::POLLPRI | libc::POLLERR,
            revents: 0,
        };
        unsafe {
            let ready = libc::poll(&mut pollfd, 1, timeout.as_millis() as c_int);
            if ready == -1 {
                return Err(io::Error::last_os_error().into());
            }
            if ready == 0 {
                return Ok(false);
            }
            // Consume the edge so the next poll blocks again.
            let mut scratch = [0u8; 2];
            libc::lseek(self.value.0, 0, libc::SEEK_SET);
            libc::read(self.value.0, scratch.as_mut_ptr() as *mut c_void, scratch.len());
        }
        Ok(true)
    }
}
