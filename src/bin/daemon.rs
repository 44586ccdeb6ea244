use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emeter::{FsKvStore, Pins, QueueSink, SystemClock};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_pin(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn main() -> emeter::Result<()> {
    env_logger::init();

    let data_dir = env_or("EMETER_DATA_DIR", "/var/lib/emeter");
    let spidev = env_or("EMETER_SPIDEV", "/dev/spidev0.0");
    let pins = Pins {
        mux: [
            env_pin("EMETER_PIN_MUX_S0", 5),
            env_pin("EMETER_PIN_MUX_S1", 6),
            env_pin("EMETER_PIN_MUX_S2", 13),
            env_pin("EMETER_PIN_MUX_S3", 19),
        ],
        reset: env_pin("EMETER_PIN_RESET", 21),
        irq: env_pin("EMETER_PIN_IRQ", 26),
    };

    let store = Arc::new(FsKvStore::new(format!("{}/kv", data_dir)));
    let clock = Arc::new(SystemClock::new());
    let sink = Arc::new(QueueSink::new(1024));

    let mut meter = emeter::HardwareMeter::open(
        &spidev, pins, store, clock, sink.clone(), &data_dir)?;
    meter.begin()?;
    log::info!("metering on {}, data under {}", spidev, data_dir);

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }

    let mut last_report = std::time::Instant::now();
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if meter.restart_requested() {
            log::error!("restart requested by failure budget, shutting down");
            break;
        }
        // The MQTT/InfluxDB publisher would drain the sink here; without
        // one attached, keep it from sitting full forever.
        let _ = sink.drain();
        if last_report.elapsed() >= Duration::from_secs(60) {
            last_report = std::time::Instant::now();
            log::info!("{} readings, {:.1} Hz grid, {:.1} W total",
                meter.reading_count(),
                meter.grid_frequency(),
                meter.aggregated_active_power(true));
        }
    }

    meter.stop();
    Ok(())
}
