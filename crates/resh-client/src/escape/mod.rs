//! Escape sequence handling on the stdin path.
//!
//! OpenSSH-style: a read holding only `\r`, then a read holding only the
//! escape character within the configured window, opens the local console.
//! Nothing else is ever swallowed.

mod console;

use std::time::Duration;

use tokio::time::Instant;

pub use console::{ConsoleOutcome, EscapeConsole, suspend_process};

/// Result of passing one stdin read through the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeResult {
    /// Forward these bytes.
    PassThrough(Vec<u8>),
    /// The escape trigger was seen; the read was consumed.
    Console,
}

/// Watches stdin reads for `\r` followed by the escape character.
#[derive(Debug)]
pub struct EscapeDetector {
    /// `None` disables detection.
    escape_char: Option<u8>,
    window: Duration,
    /// Arrival of the last lone `\r` read.
    enter_time: Option<Instant>,
}

impl EscapeDetector {
    pub fn new(escape_char: Option<u8>, window: Duration) -> Self {
        Self {
            escape_char,
            window,
            enter_time: None,
        }
    }

    pub fn escape_char(&self) -> Option<u8> {
        self.escape_char
    }

    /// Process one stdin read.
    pub fn process(&mut self, input: &[u8]) -> EscapeResult {
        self.process_at(input, Instant::now())
    }

    /// Process one stdin read that arrived at `now`.
    pub fn process_at(&mut self, input: &[u8], now: Instant) -> EscapeResult {
        let Some(escape_char) = self.escape_char else {
            return EscapeResult::PassThrough(input.to_vec());
        };

        if input == b"\r" {
            self.enter_time = Some(now);
            return EscapeResult::PassThrough(input.to_vec());
        }

        let armed = self.enter_time.take();
        if input == [escape_char]
            && armed.is_some_and(|t| now.saturating_duration_since(t) <= self.window)
        {
            return EscapeResult::Console;
        }
        EscapeResult::PassThrough(input.to_vec())
    }

    pub fn reset(&mut self) {
        self.enter_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn disabled_passes_everything() {
        let mut d = EscapeDetector::new(None, WINDOW);
        assert_eq!(d.process(b"\r"), EscapeResult::PassThrough(b"\r".to_vec()));
        assert_eq!(d.process(b"~"), EscapeResult::PassThrough(b"~".to_vec()));
    }

    #[test]
    fn enter_then_tilde_opens_console() {
        let mut d = EscapeDetector::new(Some(b'~'), WINDOW);
        let t0 = Instant::now();
        assert_eq!(
            d.process_at(b"hello", t0),
            EscapeResult::PassThrough(b"hello".to_vec())
        );
        assert_eq!(d.process_at(b"\r", t0), EscapeResult::PassThrough(b"\r".to_vec()));
        assert_eq!(
            d.process_at(b"~", t0 + Duration::from_millis(300)),
            EscapeResult::Console
        );
        // trigger is single-use
        assert_eq!(
            d.process_at(b"~", t0 + Duration::from_millis(400)),
            EscapeResult::PassThrough(b"~".to_vec())
        );
    }

    #[test]
    fn slow_escape_is_forwarded() {
        let mut d = EscapeDetector::new(Some(b'~'), WINDOW);
        let t0 = Instant::now();
        d.process_at(b"\r", t0);
        assert_eq!(
            d.process_at(b"~", t0 + Duration::from_secs(2)),
            EscapeResult::PassThrough(b"~".to_vec())
        );
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let mut d = EscapeDetector::new(Some(b'~'), WINDOW);
        let t0 = Instant::now();
        d.process_at(b"\r", t0);
        assert_eq!(d.process_at(b"~", t0 + WINDOW), EscapeResult::Console);
    }

    #[test]
    fn pasted_sequence_is_not_a_trigger() {
        let mut d = EscapeDetector::new(Some(b'~'), WINDOW);
        assert_eq!(
            d.process(b"\r~."),
            EscapeResult::PassThrough(b"\r~.".to_vec())
        );
        d.process(b"\r");
        d.process(b"x");
        assert_eq!(d.process(b"~"), EscapeResult::PassThrough(b"~".to_vec()));
    }

    #[test]
    fn control_escape_char() {
        let mut d = EscapeDetector::new(Some(0x1d), WINDOW);
        d.process(b"\r");
        assert_eq!(d.process(&[0x1d]), EscapeResult::Console);
    }

    fn arb_read() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            3 => Just(b"\r".to_vec()),
            3 => Just(b"~".to_vec()),
            1 => Just(b"\r~".to_vec()),
            2 => proptest::collection::vec(any::<u8>(), 1..8),
        ]
    }

    proptest! {
        #[test]
        fn only_the_trigger_is_swallowed(
            reads in proptest::collection::vec((arb_read(), 0u64..2000), 0..64)
        ) {
            let mut d = EscapeDetector::new(Some(b'~'), WINDOW);
            let start = Instant::now();
            let mut now = start;
            let mut prev: Option<(Vec<u8>, Instant)> = None;
            let mut forwarded = Vec::new();
            let mut expected = Vec::new();

            for (read, gap_ms) in reads {
                now += Duration::from_millis(gap_ms);
                let trigger = read == b"~"
                    && prev
                        .as_ref()
                        .is_some_and(|(p, t)| p == b"\r" && now - *t <= WINDOW);
                match d.process_at(&read, now) {
                    EscapeResult::Console => prop_assert!(trigger),
                    EscapeResult::PassThrough(bytes) => {
                        prop_assert!(!trigger);
                        prop_assert_eq!(&bytes, &read);
                        forwarded.extend_from_slice(&bytes);
                    }
                }
                if !trigger {
                    expected.extend_from_slice(&read);
                }
                // a consumed trigger leaves nothing armed
                prev = if trigger { None } else { Some((read, now)) };
            }
            prop_assert_eq!(forwarded, expected);
        }
    }
}
