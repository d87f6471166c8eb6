use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Count of deliveries currently inside a handler. Owned by the worker host
/// and handed to each consumer explicitly; the host's drain loop reads it
/// during shutdown.
#[derive(Clone, Debug, Default)]
pub struct InFlight {
    count: Arc<AtomicUsize>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter until the returned guard is dropped.
    pub fn begin(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }
}

pub struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_in_flight_work() {
        let in_flight = InFlight::new();
        assert!(in_flight.is_idle());

        let first = in_flight.begin();
        let second = in_flight.begin();
        assert_eq!(in_flight.count(), 2);

        drop(first);
        assert_eq!(in_flight.count(), 1);

        drop(second);
        assert!(in_flight.is_idle());
    }

    #[test]
    fn clones_share_the_same_counter() {
        let in_flight = InFlight::new();
        let other = in_flight.clone();

        let _guard = in_flight.begin();
        assert_eq!(other.count(), 1);
    }
}
