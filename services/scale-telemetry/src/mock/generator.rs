use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::rest::{ConnectionStatus, Device};
use crate::wire::{DeviceStatus, TelemetrySnapshot};

/// Spacing of generated history entries
const HISTORY_STEP_SECS: i64 = 5;

/// Simulated weighing-indicator readings with smooth transitions
///
/// Only devices that are both `active` and `connected` in the fleet produce
/// new values. Every other device keeps repeating its last active snapshot
/// with a fresh timestamp.
pub struct MetricsGenerator {
    online: HashMap<String, bool>,
    current: HashMap<String, TelemetrySnapshot>,
    last_active: HashMap<String, TelemetrySnapshot>,
    rng: StdRng,
}

impl MetricsGenerator {
    pub fn new(devices: &[Device]) -> Self {
        Self::with_rng(devices, StdRng::from_rng(&mut rand::rng()))
    }

    /// Deterministic generator for tests
    pub fn seeded(devices: &[Device], seed: u64) -> Self {
        Self::with_rng(devices, StdRng::seed_from_u64(seed))
    }

    fn with_rng(devices: &[Device], rng: StdRng) -> Self {
        let online = devices
            .iter()
            .map(|device| {
                let online = device.status == DeviceStatus::Active
                    && device.connection_status == ConnectionStatus::Connected;
                (device.id.clone(), online)
            })
            .collect();

        Self {
            online,
            current: HashMap::new(),
            last_active: HashMap::new(),
            rng,
        }
    }

    fn is_online(&self, device_id: &str) -> bool {
        // unknown ids are treated as active
        self.online.get(device_id).copied().unwrap_or(true)
    }

    /// Next reading for `device_id`
    pub fn generate(&mut self, device_id: &str) -> TelemetrySnapshot {
        let previous = match self.current.get(device_id) {
            Some(previous) => previous.clone(),
            None => self.initial(device_id),
        };

        if !self.is_online(device_id) {
            if let Some(frozen) = self.last_active.get(device_id) {
                let mut frozen = frozen.clone();
                frozen.timestamp = Utc::now();
                return frozen;
            }
            self.last_active
                .insert(device_id.to_string(), previous.clone());
            return previous;
        }

        let n = device_number(device_id);
        let net_weight = self.next_net_weight(previous.net_weight, n);
        let tare_weight = self.next_tare_weight(previous.tare_weight);
        let is_stable = (net_weight - previous.net_weight).abs() < 0.5;
        let status = self.next_status(previous.status, is_stable);
        let temperature = previous.temperature.map(|t| self.next_temperature(t));

        let snapshot = TelemetrySnapshot {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            gross_weight: round_to(net_weight + tare_weight, 2),
            tare_weight,
            net_weight,
            status,
            is_stable,
            load_cell_count: previous.load_cell_count,
            measuring_speed: 1600,
            temperature,
            weight: Some(net_weight),
            battery_level: previous.battery_level,
            humidity: previous.humidity,
        };

        self.current
            .insert(device_id.to_string(), snapshot.clone());
        self.last_active
            .insert(device_id.to_string(), snapshot.clone());
        snapshot
    }

    /// `count` readings 5 s apart, oldest first, the last one stamped now
    pub fn historical(&mut self, device_id: &str, count: usize) -> Vec<TelemetrySnapshot> {
        let now = Utc::now();
        (0..count)
            .rev()
            .map(|steps_back| {
                let mut snapshot = self.generate(device_id);
                snapshot.timestamp =
                    now - ChronoDuration::seconds(HISTORY_STEP_SECS * steps_back as i64);
                snapshot
            })
            .collect()
    }

    /// Forget all per-device state
    pub fn reset(&mut self) {
        self.current.clear();
        self.last_active.clear();
    }

    fn initial(&mut self, device_id: &str) -> TelemetrySnapshot {
        let n = device_number(device_id);
        let tare_weight = 20.0 + n as f64 * 5.0;
        let net_weight = base_net_weight(n) + self.rng.random_range(-10.0..10.0);
        let base_temperature = 20.0 + (n % 5) as f64 * 0.5;

        TelemetrySnapshot {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            gross_weight: net_weight + tare_weight,
            tare_weight,
            net_weight,
            status: DeviceStatus::Active,
            is_stable: true,
            load_cell_count: (n % 4 + 1).min(8) as u32,
            measuring_speed: 1600,
            temperature: Some(base_temperature + self.rng.random_range(-1.0..1.0)),
            weight: Some(net_weight),
            battery_level: Some(80.0 + self.rng.random_range(0.0..20.0)),
            humidity: Some(45.0 + self.rng.random_range(0.0..10.0)),
        }
    }

    fn next_net_weight(&mut self, previous: f64, n: u64) -> f64 {
        // mostly noise, sometimes items added or removed, rarely a full load
        let spread = match self.rng.random::<f64>() {
            r if r < 0.60 => 1.0,
            r if r < 0.85 => 10.0,
            r if r < 0.95 => 30.0,
            _ => 100.0,
        };
        let change = self.rng.random_range(-spread..spread);
        round_to(previous + change, 2).clamp(0.0, base_net_weight(n) + 300.0)
    }

    fn next_tare_weight(&mut self, previous: f64) -> f64 {
        if self.rng.random_bool(0.99) {
            return previous;
        }
        round_to(previous + self.rng.random_range(-0.5..0.5), 2).clamp(10.0, 100.0)
    }

    fn next_temperature(&mut self, previous: f64) -> f64 {
        round_to(previous + self.rng.random_range(-0.1..0.1), 1).clamp(18.0, 26.0)
    }

    fn next_status(&mut self, current: DeviceStatus, is_stable: bool) -> DeviceStatus {
        if !is_stable {
            return if self.rng.random_bool(0.9) {
                DeviceStatus::Active
            } else {
                current
            };
        }
        if !self.rng.random_bool(0.01) {
            return current;
        }
        match self.rng.random::<f64>() {
            r if r < 0.70 => DeviceStatus::Active,
            r if r < 0.85 => DeviceStatus::Idle,
            r if r < 0.95 => DeviceStatus::Error,
            _ => DeviceStatus::Maintenance,
        }
    }
}

/// Trailing number of an id such as `PENKO-1020-007`; 1 when absent
fn device_number(device_id: &str) -> u64 {
    device_id
        .rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(1)
}

fn base_net_weight(n: u64) -> f64 {
    100.0 + n as f64 * 50.0
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fleet;

    #[test]
    fn device_number_parses_suffix() {
        assert_eq!(device_number("PENKO-1020-007"), 7);
        assert_eq!(device_number("PENKO-1020-010"), 10);
        assert_eq!(device_number("scale"), 1);
    }

    #[test]
    fn initial_values_follow_device_number() {
        let devices = fleet(10);
        let mut generator = MetricsGenerator::seeded(&devices, 7);
        let first = generator.initial("PENKO-1020-003");

        assert_eq!(first.tare_weight, 35.0);
        assert!((240.0..=260.0).contains(&first.net_weight));
        assert_eq!(first.load_cell_count, 4);
        assert_eq!(first.measuring_speed, 1600);
        let temperature = first.temperature.unwrap();
        assert!((20.5..=22.5).contains(&temperature));
    }

    #[test]
    fn active_device_stays_within_bounds() {
        let devices = fleet(10);
        let mut generator = MetricsGenerator::seeded(&devices, 42);
        let mut previous = generator.generate("PENKO-1020-001");

        for _ in 0..2000 {
            let next = generator.generate("PENKO-1020-001");
            assert!((0.0..=450.0).contains(&next.net_weight));
            assert!((10.0..=100.0).contains(&next.tare_weight));
            assert!((18.0..=26.0).contains(&next.temperature.unwrap()));
            assert_eq!(
                next.is_stable,
                (next.net_weight - previous.net_weight).abs() < 0.5
            );
            assert_eq!(next.weight, Some(next.net_weight));
            assert_eq!(next.gross_weight, round_to(next.net_weight + next.tare_weight, 2));
            previous = next;
        }
    }

    #[test]
    fn inactive_device_repeats_frozen_snapshot() {
        let devices = fleet(10);
        let mut generator = MetricsGenerator::seeded(&devices, 1);

        // PENKO-1020-007 is idle
        let first = generator.generate("PENKO-1020-007");
        let second = generator.generate("PENKO-1020-007");

        assert_eq!(first.net_weight, second.net_weight);
        assert_eq!(first.tare_weight, second.tare_weight);
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn historical_entries_are_five_seconds_apart() {
        let devices = fleet(10);
        let mut generator = MetricsGenerator::seeded(&devices, 3);
        let history = generator.historical("PENKO-1020-002", 4);

        assert_eq!(history.len(), 4);
        for pair in history.windows(2) {
            assert_eq!((pair[1].timestamp - pair[0].timestamp).num_seconds(), 5);
        }
        assert!(generator.historical("PENKO-1020-002", 0).is_empty());
    }

    #[test]
    fn reset_forgets_state() {
        let devices = fleet(10);
        let mut generator = MetricsGenerator::seeded(&devices, 9);
        generator.generate("PENKO-1020-001");
        generator.reset();

        assert!(generator.current.is_empty());
        assert!(generator.last_active.is_empty());
    }
}
