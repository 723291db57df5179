/// Wall clock port. Tests replace it with a fixed instant.
pub trait Clock {
    /// Unix epoch seconds.
    fn now(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        proxmox_time::epoch_i64()
    }
}
