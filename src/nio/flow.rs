use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::trace;

use crate::config::ClusterConfig;

/// Adaptive write throttle: once per second the manager derives the
///  observed send rate from the workers' byte counters and linearly
///  interpolates the per-socket write back-off and the worker loop pacing
///  between their configured bounds. Workers read the two scalars lock-free
///  on every iteration.
pub(crate) struct FlowControl {
    send_wait_time_ns: AtomicU64,
    io_loop_interval_us: AtomicU64,
    last: Mutex<LastSample>,
}

struct LastSample {
    time_ms: u64,
    send_bytes: u64,
}

impl FlowControl {
    pub(crate) fn new(config: &ClusterConfig) -> FlowControl {
        FlowControl {
            send_wait_time_ns: AtomicU64::new(config.send_min_wait_time.as_nanos() as u64),
            io_loop_interval_us: AtomicU64::new(config.min_loop_interval.as_micros() as u64),
            last: Mutex::new(LastSample {
                time_ms: 0,
                send_bytes: 0,
            }),
        }
    }

    pub(crate) fn send_wait_time_ns(&self) -> u64 {
        self.send_wait_time_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn io_loop_interval_us(&self) -> u64 {
        self.io_loop_interval_us.load(Ordering::Relaxed)
    }

    pub(crate) fn recalc(&self, config: &ClusterConfig, total_send_bytes: u64, now_ms: u64) {
        let observed_bps = {
            let mut last = self.last.lock().unwrap();
            let elapsed_ms = now_ms.saturating_sub(last.time_ms);
            if elapsed_ms == 0 {
                return;
            }
            let delta = total_send_bytes.saturating_sub(last.send_bytes);
            last.time_ms = now_ms;
            last.send_bytes = total_send_bytes;
            (8 * delta).saturating_mul(1000) / elapsed_ms
        };

        let min_wait = config.send_min_wait_time.as_nanos() as u64;
        let max_wait = config.send_max_wait_time.as_nanos() as u64;
        let min_loop = config.min_loop_interval.as_micros() as u64;
        let max_loop = config.max_loop_interval.as_micros() as u64;

        let (wait, interval) = if config.flow_ctrl_max_bps <= 0
            || (observed_bps as i64) < config.flow_ctrl_min_bps
        {
            (min_wait, min_loop)
        } else {
            let mut busy_ratio = observed_bps as f64 / config.flow_ctrl_max_bps as f64;
            if busy_ratio > 1.0 {
                busy_ratio = 1.0;
            }
            (
                min_wait + ((max_wait - min_wait) as f64 * busy_ratio) as u64,
                min_loop + ((max_loop - min_loop) as f64 * busy_ratio) as u64,
            )
        };

        trace!(
            "flow control: {} bps observed -> send wait {} ns, loop interval {} us",
            observed_bps,
            wait,
            interval
        );
        self.send_wait_time_ns.store(wait, Ordering::Relaxed);
        self.io_loop_interval_us.store(interval, Ordering::Relaxed);
    }
}
