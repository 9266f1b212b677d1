use crate::{Duration, Instant};

/// Fires at most once per `interval`, used to throttle reconnect attempts
/// (`ConnectionManager::maybe_reconnect` in the teacher crate runs on the
/// same pattern).
///
/// `last_acted: None` means "never fired" so the first `fired()`/`maybe()`
/// call after construction always fires, mirroring the teacher's
/// `Instant::ZERO` sentinel without requiring an artificial epoch on
/// `std::time::Instant`.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(Duration),
    {
        if let Some(el) = self.elapsed_if_due() {
            f(el);
            self.last_acted = Some(Instant::now());
        }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.elapsed_if_due().is_some() {
            self.last_acted = Some(Instant::now());
            true
        } else {
            false
        }
    }

    #[inline]
    fn elapsed_if_due(&self) -> Option<Duration> {
        match self.last_acted {
            None => Some(Duration::MAX),
            Some(last) => {
                let el = last.elapsed();
                (el >= self.interval).then_some(el)
            }
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    #[inline]
    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    #[inline]
    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}
