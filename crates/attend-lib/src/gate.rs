use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop signal observed by every pull loop of one recording session.
///
/// Clones share the same flag. There is no reset: a session that needs to
/// record again gets a new gate.
#[derive(Debug, Clone, Default)]
pub struct CancellationGate {
    signaled: Arc<AtomicBool>,
}

impl CancellationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gate. Returns `true` only for the call that flipped it.
    pub fn signal(&self) -> bool {
        !self.signaled.swap(true, Ordering::SeqCst)
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_clear() {
        assert!(!CancellationGate::new().is_signaled());
    }

    #[test]
    fn second_signal_is_a_no_op() {
        let gate = CancellationGate::new();
        assert!(gate.signal());
        assert!(!gate.signal());
        assert!(gate.is_signaled());
    }

    #[test]
    fn clones_observe_signal_across_threads() {
        let gate = CancellationGate::new();
        let reader = gate.clone();
        let handle = thread::spawn(move || {
            while !reader.is_signaled() {
                thread::yield_now();
            }
            true
        });
        gate.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn fresh_gates_are_independent() {
        let first = CancellationGate::new();
        first.signal();
        let second = CancellationGate::new();
        assert!(!second.is_signaled());
    }
}
