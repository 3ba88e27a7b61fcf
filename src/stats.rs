use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker I/O counters. Each worker thread owns one instance and updates
///  it without contention; the manager thread reduces all instances once per
///  second for the periodic report and for flow control.
#[derive(Default)]
pub struct SocketStats {
    pub send_msg_count: AtomicU64,
    pub send_bytes: AtomicU64,
    pub drop_msg_count: AtomicU64,
    pub drop_bytes: AtomicU64,
    pub recv_msg_count: AtomicU64,
    pub recv_bytes: AtomicU64,
    pub push_msg_count: AtomicU64,
    pub push_msg_bytes: AtomicU64,
    pub fail_msg_count: AtomicU64,
    pub fail_msg_bytes: AtomicU64,
    pub call_writev_count: AtomicU64,
    pub call_read_count: AtomicU64,
    pub send_retry_count: AtomicU64,
    pub send_delayed_time: AtomicU64,
    pub epoll_wait_count: AtomicU64,
    pub epoll_wait_time_used: AtomicU64,
    pub loop_usleep_count: AtomicU64,
    pub loop_usleep_time: AtomicU64,
    pub ping_total_count: AtomicU64,
    pub ping_success_count: AtomicU64,
    pub ping_time_used: AtomicU64,
}

macro_rules! sum_field {
    ($target:ident, $sources:ident, $field:ident) => {
        $target.$field = $sources
            .iter()
            .map(|s| s.$field.load(Ordering::Relaxed))
            .sum();
    };
}

/// Plain-number reduction of all workers' counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub send_msg_count: u64,
    pub send_bytes: u64,
    pub drop_msg_count: u64,
    pub drop_bytes: u64,
    pub recv_msg_count: u64,
    pub recv_bytes: u64,
    pub push_msg_count: u64,
    pub push_msg_bytes: u64,
    pub fail_msg_count: u64,
    pub fail_msg_bytes: u64,
    pub call_writev_count: u64,
    pub call_read_count: u64,
    pub send_retry_count: u64,
    pub send_delayed_time: u64,
    pub epoll_wait_count: u64,
    pub epoll_wait_time_used: u64,
    pub loop_usleep_count: u64,
    pub loop_usleep_time: u64,
    pub ping_total_count: u64,
    pub ping_success_count: u64,
    pub ping_time_used: u64,
}

impl SocketStats {
    pub fn add(&self, field: impl Fn(&SocketStats) -> &AtomicU64, delta: u64) {
        field(self).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn incr(&self, field: impl Fn(&SocketStats) -> &AtomicU64) {
        self.add(field, 1);
    }
}

pub fn reduce(sources: &[&SocketStats]) -> StatsSnapshot {
    let mut sum = StatsSnapshot::default();
    sum_field!(sum, sources, send_msg_count);
    sum_field!(sum, sources, send_bytes);
    sum_field!(sum, sources, drop_msg_count);
    sum_field!(sum, sources, drop_bytes);
    sum_field!(sum, sources, recv_msg_count);
    sum_field!(sum, sources, recv_bytes);
    sum_field!(sum, sources, push_msg_count);
    sum_field!(sum, sources, push_msg_bytes);
    sum_field!(sum, sources, fail_msg_count);
    sum_field!(sum, sources, fail_msg_bytes);
    sum_field!(sum, sources, call_writev_count);
    sum_field!(sum, sources, call_read_count);
    sum_field!(sum, sources, send_retry_count);
    sum_field!(sum, sources, send_delayed_time);
    sum_field!(sum, sources, epoll_wait_count);
    sum_field!(sum, sources, epoll_wait_time_used);
    sum_field!(sum, sources, loop_usleep_count);
    sum_field!(sum, sources, loop_usleep_time);
    sum_field!(sum, sources, ping_total_count);
    sum_field!(sum, sources, ping_success_count);
    sum_field!(sum, sources, ping_time_used);
    sum
}

impl StatsSnapshot {
    pub fn log(&self) {
        tracing::debug!(
            "cluster io: sent {} msgs / {} bytes, recv {} msgs / {} bytes, \
             dropped {} msgs, failed {} msgs, writev calls {}, read calls {}, \
             pings {}/{} ok, ping ns {}",
            self.send_msg_count,
            self.send_bytes,
            self.recv_msg_count,
            self.recv_bytes,
            self.drop_msg_count,
            self.fail_msg_count,
            self.call_writev_count,
            self.call_read_count,
            self.ping_success_count,
            self.ping_total_count,
            self.ping_time_used,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_sums_across_workers() {
        let a = SocketStats::default();
        let b = SocketStats::default();
        a.add(|s| &s.send_bytes, 100);
        b.add(|s| &s.send_bytes, 23);
        a.incr(|s| &s.send_msg_count);
        b.incr(|s| &s.send_msg_count);
        b.incr(|s| &s.send_msg_count);

        let sum = reduce(&[&a, &b]);
        assert_eq!(sum.send_bytes, 123);
        assert_eq!(sum.send_msg_count, 3);
        assert_eq!(sum.recv_bytes, 0);
    }
}
