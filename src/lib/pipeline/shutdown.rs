use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Instant;

///
/// Cancellation signal shared by the threads of a run. Nothing is ever sent;
/// the trigger drops the only sender, which makes every receiver ready at
/// once, so a thread blocked in `select!` on it wakes immediately.
///
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: Receiver<()>,
}

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: Option<Sender<()>>,
}

impl ShutdownTrigger {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = channel::bounded(0);
        (ShutdownTrigger { tx: Some(tx) }, Shutdown { rx })
    }

    pub fn trigger(&mut self) {
        self.tx.take();
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.is_none()
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// For use in `select!`, ready once triggered
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Held by every thread of a stage until it exits
#[derive(Clone, Debug)]
pub struct StageToken {
    _tx: Sender<()>,
}

///
/// Tells when all threads of a stage have finished: each holds a token and
/// the stage is done once the last token is dropped.
///
#[derive(Debug)]
pub struct StageTracker {
    name: &'static str,
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

impl StageTracker {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = channel::bounded(0);
        StageTracker {
            name,
            tx: Some(tx),
            rx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Must be called before `wait`
    pub fn token(&self) -> Option<StageToken> {
        self.tx.as_ref().map(|tx| StageToken { _tx: tx.clone() })
    }

    pub fn is_done(&mut self) -> bool {
        self.tx.take();
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// True when the stage finished before `deadline`
    pub fn wait(&mut self, deadline: Instant) -> bool {
        self.tx.take();
        loop {
            match self.rx.recv_deadline(deadline) {
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return false,
                Ok(()) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::select;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn trigger_wakes_blocked_thread() {
        let (mut trigger, shutdown) = ShutdownTrigger::new();
        let (_tx, never) = channel::unbounded::<u32>();

        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                select! {
                    recv(never) -> _ => false,
                    recv(shutdown.receiver()) -> _ => true,
                }
            })
        };
        assert!(!shutdown.is_triggered());
        thread::sleep(Duration::from_millis(20));
        trigger.trigger();
        assert!(waiter.join().unwrap());
        assert!(shutdown.is_triggered());
        assert!(trigger.is_triggered());
    }

    #[test]
    fn tracker_waits_for_all_tokens() {
        let mut tracker = StageTracker::new("workers");
        let tokens: Vec<StageToken> = (0..3).filter_map(|_| tracker.token()).collect();
        assert_eq!(tokens.len(), 3);

        let handles: Vec<_> = tokens
            .into_iter()
            .enumerate()
            .map(|(i, token)| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * i as u64));
                    drop(token);
                })
            })
            .collect();
        assert!(tracker.wait(Instant::now() + Duration::from_secs(10)));
        assert!(tracker.is_done());
        for h in handles {
            h.join().unwrap();
        }
        assert!(tracker.token().is_none());
    }

    #[test]
    fn tracker_times_out() {
        let mut tracker = StageTracker::new("reader");
        let token = tracker.token();
        assert!(!tracker.wait(Instant::now() + Duration::from_millis(20)));
        assert!(!tracker.is_done());
        drop(token);
        assert!(tracker.is_done());
    }
}
