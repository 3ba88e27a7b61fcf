use anyhow::bail;
use std::time::Duration;

/// Configuration of the cluster I/O engine. All tuning knobs of the engine
///  are collected here; an instance is validated once at engine creation and
///  immutable afterwards.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// number of worker threads, each owning its own poll set
    pub worker_threads: usize,

    /// number of sockets per peer, half initiated locally and half accepted.
    ///  Must be even and at least 2.
    pub connections_per_machine: usize,

    /// TCP port every node listens on
    pub cluster_port: u16,

    /// upper bound for the slot array of the peer registry; peers beyond this
    ///  count cannot be added
    pub max_machines: usize,

    /// give up on a half-open outbound connect after this long
    pub connect_timeout: Duration,

    /// interval between in-band pings per socket; zero disables pinging
    pub ping_send_interval: Duration,
    /// a ping without a response for this long counts as a miss
    pub ping_latency_threshold: Duration,
    /// close the socket after this many consecutive ping misses
    pub ping_retries: u32,

    /// observed send rate below this does not throttle at all
    pub flow_ctrl_min_bps: i64,
    /// send rate the throttle interpolation saturates at; <= 0 disables
    ///  flow control entirely
    pub flow_ctrl_max_bps: i64,
    /// per-socket write back-off at zero load
    pub send_min_wait_time: Duration,
    /// per-socket write back-off at saturation
    pub send_max_wait_time: Duration,
    /// minimum worker loop pacing; the worker sleeps the remainder of this
    ///  interval if an iteration finishes early (only applied above 100us)
    pub min_loop_interval: Duration,
    /// worker loop pacing at saturation
    pub max_loop_interval: Duration,

    /// SO_SNDBUF for promoted sockets; zero keeps the kernel default
    pub send_buffer_size: usize,
    /// SO_RCVBUF for promoted sockets; zero keeps the kernel default
    pub receive_buffer_size: usize,

    /// size of the framer's primary receive buffer
    pub read_buffer_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> ClusterConfig {
        ClusterConfig {
            worker_threads: 2,
            connections_per_machine: 6,
            cluster_port: 8086,
            max_machines: 128,
            connect_timeout: Duration::from_secs(10),
            ping_send_interval: Duration::from_secs(1),
            ping_latency_threshold: Duration::from_secs(5),
            ping_retries: 3,
            flow_ctrl_min_bps: 0,
            flow_ctrl_max_bps: 0,
            send_min_wait_time: Duration::from_micros(1000),
            send_max_wait_time: Duration::from_micros(3000),
            min_loop_interval: Duration::from_micros(100),
            max_loop_interval: Duration::from_micros(2000),
            send_buffer_size: 0,
            receive_buffer_size: 0,
            read_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_threads == 0 {
            bail!("worker_threads must be at least 1");
        }
        if self.connections_per_machine < 2 || self.connections_per_machine % 2 != 0 {
            bail!(
                "connections_per_machine must be even and >= 2, got {}",
                self.connections_per_machine
            );
        }
        if self.max_machines == 0 {
            bail!("max_machines must be at least 1");
        }
        if self.read_buffer_size < 64 * 1024 {
            bail!("read_buffer_size is too small: {}", self.read_buffer_size);
        }
        if self.send_max_wait_time < self.send_min_wait_time {
            bail!("send_max_wait_time must be >= send_min_wait_time");
        }
        if self.max_loop_interval < self.min_loop_interval {
            bail!("max_loop_interval must be >= min_loop_interval");
        }
        Ok(())
    }

    /// sockets of one role per peer
    pub fn half_connections(&self) -> usize {
        self.connections_per_machine / 2
    }
}
