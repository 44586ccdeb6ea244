//! In-memory meter state: one snapshot per channel, written only by the
//! acquisition task and copied out whole by everybody else.

use parking_lot::Mutex;
use serde::Serialize;

use crate::channel::{ChannelConfig, CHANNEL_COUNT};
use crate::{Error, Result};

/// Latest readings and lifetime energy counters of one channel.
///
/// Energies only grow; sign information lost by the integration is kept in
/// the split between the imported and exported buckets. A snapshot is
/// valid once `last_wall_ms` is nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeterSnapshot {
    pub voltage: f32,
    pub current: f32,
    pub active_power: f32,
    pub reactive_power: f32,
    pub apparent_power: f32,
    pub power_factor: f32,
    pub active_imported: f64,
    pub active_exported: f64,
    pub reactive_imported: f64,
    pub reactive_exported: f64,
    pub apparent_energy: f64,
    pub last_wall_ms: u64,
    pub last_monotonic_ms: u64,
}

impl Default for MeterSnapshot {
    fn default() -> Self {
        MeterSnapshot {
            // Nominal mains voltage until the first reference reading, so
            // the three-phase approximation has something to work with.
            voltage: 230.0,
            current: 0.0,
            active_power: 0.0,
            reactive_power: 0.0,
            apparent_power: 0.0,
            power_factor: 0.0,
            active_imported: 0.0,
            active_exported: 0.0,
            reactive_imported: 0.0,
            reactive_exported: 0.0,
            apparent_energy: 0.0,
            last_wall_ms: 0,
            last_monotonic_ms: 0,
        }
    }
}

impl MeterSnapshot {
    pub fn is_valid(&self) -> bool {
        self.last_wall_ms != 0
    }

    pub fn energies(&self) -> EnergyBuckets {
        EnergyBuckets {
            active_imported: self.active_imported,
            active_exported: self.active_exported,
            reactive_imported: self.reactive_imported,
            reactive_exported: self.reactive_exported,
            apparent: self.apparent_energy,
        }
    }

    pub fn set_energies(&mut self, energies: &EnergyBuckets) {
        self.active_imported = energies.active_imported;
        self.active_exported = energies.active_exported;
        self.reactive_imported = energies.reactive_imported;
        self.reactive_exported = energies.reactive_exported;
        self.apparent_energy = energies.apparent;
    }
}

/// The five lifetime energy counters, in watt hours and friends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnergyBuckets {
    pub active_imported: f64,
    pub active_exported: f64,
    pub reactive_imported: f64,
    pub reactive_exported: f64,
    pub apparent: f64,
}

impl EnergyBuckets {
    pub fn is_non_negative(&self) -> bool {
        self.active_imported >= 0.0
            && self.active_exported >= 0.0
            && self.reactive_imported >= 0.0
            && self.reactive_exported >= 0.0
            && self.apparent >= 0.0
    }
}

/// All 17 snapshots behind one brief mutex; readers get tear-free copies.
#[derive(Debug, Default)]
pub struct SnapshotTable {
    inner: Mutex<[MeterSnapshot; CHANNEL_COUNT]>,
}

impl SnapshotTable {
    pub fn new() -> SnapshotTable {
        SnapshotTable::default()
    }

    pub fn get(&self, index: usize) -> MeterSnapshot {
        self.inner.lock()[index]
    }

    pub fn all(&self) -> [MeterSnapshot; CHANNEL_COUNT] {
        *self.inner.lock()
    }

    /// Apply a mutation to one snapshot under the lock. Only the
    /// acquisition task and the energy reset/set paths call this.
    pub fn update<R>(&self, index: usize, f: impl FnOnce(&mut MeterSnapshot) -> R) -> R {
        f(&mut self.inner.lock()[index])
    }

    pub fn zero_energies(&self) {
        let mut table = self.inner.lock();
        for snapshot in table.iter_mut() {
            snapshot.set_energies(&EnergyBuckets::default());
        }
    }
}

/// The 17 channel configurations behind one mutex.
#[derive(Debug)]
pub struct ChannelTable {
    inner: Mutex<[ChannelConfig; CHANNEL_COUNT]>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        ChannelTable {
            inner: Mutex::new(std::array::from_fn(ChannelConfig::default_for)),
        }
    }
}

impl ChannelTable {
    pub fn new() -> ChannelTable {
        ChannelTable::default()
    }

    pub fn get(&self, index: usize) -> Result<ChannelConfig> {
        if index >= CHANNEL_COUNT {
            return Err(Error::InvalidChannel(index));
        }
        Ok(self.inner.lock()[index].clone())
    }

    /// Install a channel configuration. Channel 0 cannot be deactivated;
    /// a CT nameplate, when present, re-derives the calibration scalars.
    pub fn set(&self, index: usize, mut config: ChannelConfig) -> Result<ChannelConfig> {
        if index >= CHANNEL_COUNT {
            return Err(Error::InvalidChannel(index));
        }
        config.index = index;
        if index == 0 && !config.active {
            log::warn!("channel 0 must remain active; ignoring deactivation");
            config.active = true;
        }
        if let Some(ct) = &config.ct {
            config.calibration = config.calibration.derive_from_ct(ct);
        }
        self.inner.lock()[index] = config.clone();
        Ok(config)
    }

    pub fn is_active(&self, index: usize) -> bool {
        index < CHANNEL_COUNT && self.inner.lock()[index].active
    }

    /// Indices of all active channels, reference channel first.
    pub fn active_indices(&self) -> Vec<usize> {
        let table = self.inner.lock();
        (0..CHANNEL_COUNT).filter(|&i| table[i].active).collect()
    }

    /// The next active secondary channel after `current`, scanning 1..16
    /// with wrap-around. `None` when no secondary is active.
    pub fn next_active_secondary(&self, current: usize) -> Option<usize> {
        let table = self.inner.lock();
        for offset in 1..CHANNEL_COUNT {
            let index = (current + offset - 1) % (CHANNEL_COUNT - 1) + 1;
            if table[index].active {
                return Some(index);
            }
        }
        None
    }
}
