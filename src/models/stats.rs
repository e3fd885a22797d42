// Client resource statistics and their downsampling

use serde::{Deserialize, Serialize};

/// Default bucket width for stored statistics, in microseconds (one minute)
pub const DEFAULT_SAMPLE_INTERVAL_US: i64 = 60_000_000;

/// CPU sample; `user_cpu_time`/`system_cpu_time` are cumulative counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    /// Microseconds since epoch
    pub timestamp: i64,
    pub user_cpu_time: f64,
    pub system_cpu_time: f64,
    pub cpu_percent: f64,
}

/// IO sample; byte counts are cumulative counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IoSample {
    pub timestamp: i64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientStats {
    #[serde(default)]
    pub cpu_samples: Vec<CpuSample>,
    #[serde(default)]
    pub io_samples: Vec<IoSample>,
}

impl ClientStats {
    /// Collapse samples into buckets of `interval_us`.
    ///
    /// Cumulative counters keep the last sample of each bucket; the CPU
    /// percentage is averaged. Buckets are aligned to multiples of the
    /// interval and emitted in time order.
    pub fn downsample(&self, interval_us: i64) -> ClientStats {
        let interval = interval_us.max(1);

        let mut cpu_samples: Vec<CpuSample> = Vec::new();
        let mut cpu_counts: Vec<usize> = Vec::new();
        let mut sorted_cpu = self.cpu_samples.clone();
        sorted_cpu.sort_by_key(|s| s.timestamp);
        for sample in sorted_cpu {
            let bucket = sample.timestamp.div_euclid(interval) * interval;
            if let (Some(last), Some(count)) = (cpu_samples.last_mut(), cpu_counts.last_mut()) {
                if last.timestamp == bucket {
                    *count += 1;
                    // running mean
                    last.cpu_percent += (sample.cpu_percent - last.cpu_percent) / *count as f64;
                    last.user_cpu_time = sample.user_cpu_time;
                    last.system_cpu_time = sample.system_cpu_time;
                    continue;
                }
            }
            cpu_samples.push(CpuSample {
                timestamp: bucket,
                ..sample
            });
            cpu_counts.push(1);
        }

        let mut io_samples: Vec<IoSample> = Vec::new();
        let mut sorted_io = self.io_samples.clone();
        sorted_io.sort_by_key(|s| s.timestamp);
        for sample in sorted_io {
            let bucket = sample.timestamp.div_euclid(interval) * interval;
            match io_samples.last_mut() {
                Some(last) if last.timestamp == bucket => {
                    last.read_bytes = sample.read_bytes;
                    last.write_bytes = sample.write_bytes;
                }
                _ => io_samples.push(IoSample {
                    timestamp: bucket,
                    ..sample
                }),
            }
        }

        ClientStats {
            cpu_samples,
            io_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twelve_samples() -> ClientStats {
        let mut stats = ClientStats::default();
        for i in 0..12i64 {
            stats.cpu_samples.push(CpuSample {
                timestamp: i * 10_000_000,
                user_cpu_time: 10.0 + i as f64,
                system_cpu_time: 20.0 + i as f64,
                cpu_percent: 10.0 + i as f64,
            });
            stats.io_samples.push(IoSample {
                timestamp: i * 10_000_000,
                read_bytes: 10 + i as u64,
                write_bytes: 10 + i as u64,
            });
        }
        stats
    }

    #[test]
    fn test_downsample_into_minute_buckets() {
        let sampled = twelve_samples().downsample(DEFAULT_SAMPLE_INTERVAL_US);

        assert_eq!(sampled.cpu_samples.len(), 2);
        assert_eq!(sampled.io_samples.len(), 2);

        assert_eq!(sampled.io_samples[0].read_bytes, 15);
        assert_eq!(sampled.io_samples[1].read_bytes, 21);

        let first_avg: f64 = (10..16).map(|v| v as f64).sum::<f64>() / 6.0;
        let second_avg: f64 = (16..22).map(|v| v as f64).sum::<f64>() / 6.0;
        assert!((sampled.cpu_samples[0].cpu_percent - first_avg).abs() < 1e-9);
        assert!((sampled.cpu_samples[1].cpu_percent - second_avg).abs() < 1e-9);

        assert_eq!(sampled.cpu_samples[0].user_cpu_time, 15.0);
        assert_eq!(sampled.cpu_samples[1].system_cpu_time, 31.0);
        assert_eq!(sampled.cpu_samples[1].timestamp, 60_000_000);
    }

    #[test]
    fn test_downsample_empty_stats() {
        let sampled = ClientStats::default().downsample(DEFAULT_SAMPLE_INTERVAL_US);
        assert!(sampled.cpu_samples.is_empty());
        assert!(sampled.io_samples.is_empty());
    }
}
