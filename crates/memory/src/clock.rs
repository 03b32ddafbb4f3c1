use chrono::{DateTime, FixedOffset, Local};

/// Injectable wall-clock source.
///
/// Sessions and schedulers stamp events through this trait so tests can pin
/// time; the default reads the system clock with its local UTC offset.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}
