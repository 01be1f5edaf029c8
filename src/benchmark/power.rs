//! Package power sampling from the RAPL energy counter.
//!
//! A background thread reads `energy_uj` every interval and streams watt
//! samples back over a channel. A second channel stops it: the interval wait
//! is a `recv_timeout` on that channel, so `finish()` returns immediately.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

const RAPL_PACKAGE: &str = "/sys/class/powercap/intel-rapl:0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerSummary {
    /// Mean of all samples; 0 when none were taken
    pub avg_watts: f64,
    pub peak_watts: f64,
    pub samples: usize,
}

impl PowerSummary {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        Self {
            avg_watts: samples.iter().sum::<f64>() / samples.len() as f64,
            peak_watts: samples.iter().copied().fold(0.0, f64::max),
            samples: samples.len(),
        }
    }
}

/// A monotonically increasing microjoule counter that wraps at `max_range_uj`.
#[derive(Debug, Clone)]
pub struct EnergyCounter {
    energy_path: PathBuf,
    max_range_uj: Option<u64>,
}

impl EnergyCounter {
    /// The package-0 RAPL domain, if the host exposes a readable one.
    pub fn detect() -> Option<Self> {
        Self::at(Path::new(RAPL_PACKAGE))
    }

    pub fn at(domain: &Path) -> Option<Self> {
        let counter = Self {
            energy_path: domain.join("energy_uj"),
            max_range_uj: read_u64(&domain.join("max_energy_range_uj")),
        };
        // Unprivileged reads fail on recent kernels.
        counter.read_uj().map(|_| counter)
    }

    pub fn read_uj(&self) -> Option<u64> {
        read_u64(&self.energy_path)
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Average watts between two counter readings, accounting for one wrap.
pub fn watts_between(
    previous_uj: u64,
    current_uj: u64,
    max_range_uj: Option<u64>,
    elapsed: Duration,
) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    let delta = if current_uj >= previous_uj {
        current_uj - previous_uj
    } else {
        let range = max_range_uj?;
        range.checked_sub(previous_uj)? + current_uj
    };
    Some(delta as f64 / 1_000_000.0 / secs)
}

pub struct PowerSampler {
    stop_tx: Option<Sender<()>>,
    samples_rx: Receiver<f64>,
    handle: Option<JoinHandle<()>>,
}

impl PowerSampler {
    pub fn start(counter: EnergyCounter, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (samples_tx, samples_rx) = mpsc::channel::<f64>();

        let handle = std::thread::spawn(move || {
            let mut previous = counter.read_uj();
            let mut previous_at = Instant::now();
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let current = counter.read_uj();
                let now = Instant::now();
                if let (Some(prev), Some(cur)) = (previous, current) {
                    if let Some(watts) =
                        watts_between(prev, cur, counter.max_range_uj, now - previous_at)
                    {
                        debug!(watts, "power sample");
                        if samples_tx.send(watts).is_err() {
                            break;
                        }
                    }
                }
                previous = current;
                previous_at = now;
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            samples_rx,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Stop sampling and average everything collected.
    pub fn finish(mut self) -> PowerSummary {
        self.stop();
        let samples: Vec<f64> = self.samples_rx.try_iter().collect();
        PowerSummary::from_samples(&samples)
    }
}

impl Drop for PowerSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_means_zero_watts() {
        assert_eq!(PowerSummary::from_samples(&[]), PowerSummary::default());
        let summary = PowerSummary::from_samples(&[100.0, 120.0, 110.0]);
        assert_eq!(summary.avg_watts, 110.0);
        assert_eq!(summary.peak_watts, 120.0);
        assert_eq!(summary.samples, 3);
    }

    #[test]
    fn watts_from_counter_delta() {
        let watts = watts_between(1_000_000, 501_000_000, None, Duration::from_secs(5));
        assert_eq!(watts, Some(100.0));
        assert_eq!(watts_between(0, 10, None, Duration::ZERO), None);
    }

    #[test]
    fn counter_wrap_is_handled() {
        let max = 262_143_328_850;
        let watts = watts_between(max - 100_000_000, 400_000_000, Some(max), Duration::from_secs(5));
        assert_eq!(watts, Some(100.0));
        assert_eq!(watts_between(500, 100, None, Duration::from_secs(1)), None);
    }

    #[test]
    fn sampler_reads_fake_counter_and_stops_promptly() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("energy_uj"), "1000000\n").unwrap();
        let counter = EnergyCounter::at(dir.path()).expect("counter readable");

        let sampler = PowerSampler::start(counter, Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(150));
        let started = Instant::now();
        let summary = sampler.finish();
        assert!(started.elapsed() < Duration::from_secs(1));
        // Counter never moves: every sample is 0 W.
        assert!(summary.samples >= 1);
        assert_eq!(summary.avg_watts, 0.0);
    }

    #[test]
    fn missing_counter_is_not_detected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EnergyCounter::at(dir.path()).is_none());
    }
}
