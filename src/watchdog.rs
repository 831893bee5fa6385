// Licensed under the Apache-2.0 license

//! Per-session heartbeat watchdog.
//!
//! A pure deadline tracker: one entry per live session, armed with the
//! negotiated heartbeat period and re-armed on session traffic. The
//! watchdog never interprets protocol state; expiry is reported through
//! the injected stop handler. `tick()` releases all internal borrows
//! before invoking the handler, so the handler may re-enter the session
//! table (e.g. send END_SESSION or free the session).

use crate::session::MAX_NUM_SESSIONS;
use crate::time::SpdmTimer;
use arrayvec::ArrayVec;

/// Teardown callback supplied by the embedding.
///
/// Invoked without any core lock held; must be reentrant against the
/// session table.
pub trait SessionStopHandler {
    fn stop_session(&mut self, session_id: u32, end_session_attributes: u8);
}

impl<F: FnMut(u32, u8)> SessionStopHandler for F {
    fn stop_session(&mut self, session_id: u32, end_session_attributes: u8) {
        self(session_id, end_session_attributes)
    }
}

#[derive(Clone, Copy)]
struct WatchdogEntry {
    session_id: u32,
    period_ms: u64,
    deadline_ms: u64,
    end_session_attributes: u8,
}

/// Cooperative watchdog over the embedding's monotonic clock.
///
/// Driven by `tick()` from whatever scheduling entity the embedding
/// chooses: a dedicated thread with a short polling sleep, an async
/// task, or an external timer interrupt.
pub struct Watchdog<'a> {
    timer: &'a dyn SpdmTimer,
    entries: ArrayVec<WatchdogEntry, MAX_NUM_SESSIONS>,
}

impl<'a> Watchdog<'a> {
    pub fn new(timer: &'a dyn SpdmTimer) -> Self {
        Self {
            timer,
            entries: ArrayVec::new(),
        }
    }

    /// Start (or restart) the timer for a session. A period of 0
    /// disables heartbeat supervision and disarms any existing entry.
    pub fn arm(&mut self, session_id: u32, heartbeat_period_secs: u8, end_session_attributes: u8) {
        self.disarm(session_id);
        if heartbeat_period_secs == 0 {
            return;
        }
        let period_ms = u64::from(heartbeat_period_secs) * 1000;
        let entry = WatchdogEntry {
            session_id,
            period_ms,
            deadline_ms: self.timer.now_ms() + period_ms,
            end_session_attributes,
        };
        // The table never exceeds the session table size
        let _ = self.entries.try_push(entry);
    }

    /// Push the deadline out by one period; call on any session traffic.
    pub fn reset(&mut self, session_id: u32) -> bool {
        let now_ms = self.timer.now_ms();
        for entry in self.entries.iter_mut() {
            if entry.session_id == session_id {
                entry.deadline_ms = now_ms + entry.period_ms;
                return true;
            }
        }
        false
    }

    /// Stop supervising a session permanently.
    pub fn disarm(&mut self, session_id: u32) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.session_id != session_id);
        before != self.entries.len()
    }

    pub fn armed(&self, session_id: u32) -> bool {
        self.entries.iter().any(|e| e.session_id == session_id)
    }

    /// The earliest pending deadline, for embeddings that sleep until
    /// the next interesting instant instead of polling.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.deadline_ms).min()
    }

    /// Fire expired entries. Expired sessions are disarmed first, then
    /// the handler runs once per expiry. Returns the number fired.
    pub fn tick(&mut self, handler: &mut dyn SessionStopHandler) -> usize {
        let now_ms = self.timer.now_ms();
        let mut expired: ArrayVec<(u32, u8), MAX_NUM_SESSIONS> = ArrayVec::new();
        self.entries.retain(|e| {
            if e.deadline_ms <= now_ms {
                let _ = expired.try_push((e.session_id, e.end_session_attributes));
                false
            } else {
                true
            }
        });

        for (session_id, attributes) in expired.iter() {
            handler.stop_session(*session_id, *attributes);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTimer;

    #[test]
    fn test_watchdog_fires_on_expiry() {
        let timer = FakeTimer::new();
        let mut watchdog = Watchdog::new(&timer);
        watchdog.arm(0x0001_0002, 2, 0);
        assert!(watchdog.armed(0x0001_0002));

        let mut fired: Option<(u32, u8)> = None;

        timer.advance_ms(1999);
        assert_eq!(
            watchdog.tick(&mut |session_id: u32, attrs: u8| fired = Some((session_id, attrs))),
            0
        );
        assert!(fired.is_none());

        timer.advance_ms(1);
        assert_eq!(
            watchdog.tick(&mut |session_id: u32, attrs: u8| fired = Some((session_id, attrs))),
            1
        );
        assert_eq!(fired, Some((0x0001_0002, 0)));
        // One-shot: the entry is gone after firing
        assert!(!watchdog.armed(0x0001_0002));
    }

    #[test]
    fn test_reset_pushes_deadline_out() {
        let timer = FakeTimer::new();
        let mut watchdog = Watchdog::new(&timer);
        watchdog.arm(7, 1, 0xFF);

        let mut fired = 0usize;

        timer.advance_ms(900);
        assert!(watchdog.reset(7));
        timer.advance_ms(900);
        watchdog.tick(&mut |_: u32, _: u8| fired += 1);
        assert_eq!(fired, 0);

        timer.advance_ms(100);
        watchdog.tick(&mut |_: u32, _: u8| fired += 1);
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_disarm_and_zero_period() {
        let timer = FakeTimer::new();
        let mut watchdog = Watchdog::new(&timer);

        // Heartbeat disabled: never armed
        watchdog.arm(1, 0, 0);
        assert!(!watchdog.armed(1));

        watchdog.arm(2, 1, 0);
        assert!(watchdog.disarm(2));
        timer.advance_ms(5000);
        let mut handler = |_: u32, _: u8| panic!("disarmed watchdog fired");
        assert_eq!(watchdog.tick(&mut handler), 0);
    }

    #[test]
    fn test_handler_may_rearm_other_sessions() {
        let timer = FakeTimer::new();
        let mut watchdog = Watchdog::new(&timer);
        watchdog.arm(1, 1, 0);
        watchdog.arm(2, 10, 0);
        assert_eq!(watchdog.next_deadline_ms(), Some(1000));

        timer.advance_ms(1000);
        let mut stopped: ArrayVec<u32, 4> = ArrayVec::new();
        let mut handler = |session_id: u32, _: u8| stopped.push(session_id);
        assert_eq!(watchdog.tick(&mut handler), 1);
        assert_eq!(stopped.as_slice(), &[1]);
        assert!(watchdog.armed(2));
    }
}
