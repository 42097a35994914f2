use ballast::error::Result;
use mio::{Poll, PollOpt, Ready, Registration, SetReadiness, Token};

/// An always-registerable readiness object multiplexed into a poll set so
/// other threads can interrupt a blocking `poll`. Waking is non-blocking,
/// idempotent, and safe from any thread.
pub struct Wakeup {
    registration: Registration,
    ready: SetReadiness,
}

/// Cloneable cross-thread waking handle.
#[derive(Clone)]
pub struct WakeupHandle {
    ready: SetReadiness,
}

impl Wakeup {
    pub fn new() -> Wakeup {
        let (registration, ready) = Registration::new2();
        Wakeup { registration, ready }
    }

    /// Registers the wakeup for read readiness on the owning poll set.
    pub fn register(&self, poll: &Poll, token: Token) -> Result<()> {
        poll.register(&self.registration, token, Ready::readable(), PollOpt::level())?;
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> WakeupHandle {
        WakeupHandle {
            ready: self.ready.clone(),
        }
    }

    #[inline]
    pub fn request_wakeup(&self) {
        let _ = self.ready.set_readiness(Ready::readable());
    }

    /// Drains all pending wakeups.
    #[inline]
    pub fn consume_wakeup(&self) {
        let _ = self.ready.set_readiness(Ready::empty());
    }
}

impl WakeupHandle {
    #[inline]
    pub fn request_wakeup(&self) {
        let _ = self.ready.set_readiness(Ready::readable());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const WAKE: Token = Token(0);

    #[test]
    fn test_wakeup_interrupts_poll() {
        let poll = Poll::new().unwrap();
        let wakeup = Wakeup::new();
        wakeup.register(&poll, WAKE).unwrap();

        let handle = wakeup.handle();
        let waker = thread::spawn(move || {
            handle.request_wakeup();
        });

        let mut events = mio::Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        waker.join().unwrap();

        let tokens: Vec<Token> = events.iter().map(|ev| ev.token()).collect();
        assert_eq!(tokens, vec![WAKE]);
    }

    #[test]
    fn test_consume_clears_readiness() {
        let poll = Poll::new().unwrap();
        let wakeup = Wakeup::new();
        wakeup.register(&poll, WAKE).unwrap();

        wakeup.request_wakeup();
        wakeup.request_wakeup(); // idempotent
        wakeup.consume_wakeup();

        let mut events = mio::Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
        assert_eq!(events.iter().count(), 0);
    }
}
