use parking_lot::{Condvar, Mutex};

/// A reusable barrier that puts threads to sleep until every participant
/// has arrived. Used to keep simulated robots in lockstep.
#[derive(Debug)]
pub struct SenseBarrier {
    /// (arrived, sense)
    state: Mutex<(usize, bool)>,
    cvar: Condvar,
    participants: usize,
}

impl SenseBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            state: Mutex::new((0, false)),
            cvar: Condvar::new(),
            participants: participants.max(1),
        }
    }

    #[inline]
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Blocks until all participants have called this function. Returns true
    /// on exactly one thread per round, the last to arrive.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        let my_sense = state.1;
        state.0 += 1;

        if state.0 == self.participants {
            state.0 = 0;
            state.1 = !my_sense;
            self.cvar.notify_all();
            return true;
        }
        while state.1 == my_sense {
            self.cvar.wait(&mut state);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn single_participant_never_blocks() {
        let barrier = SenseBarrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
    }

    #[test]
    fn rounds_stay_in_lockstep() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 20;
        let barrier = Arc::new(SenseBarrier::new(THREADS));
        let counter = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let counter = Arc::clone(&counter);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        // everyone finished this round before anyone moves on
                        assert!(counter.load(Ordering::SeqCst) >= (round + 1) * THREADS);
                        barrier.wait();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), THREADS * ROUNDS);
        assert_eq!(leaders.load(Ordering::SeqCst), ROUNDS);
    }
}
