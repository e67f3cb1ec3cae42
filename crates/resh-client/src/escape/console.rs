//! The escape console: a small modal menu drawn on stderr.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use resh_core::error::Result;
use resh_core::options::escape_char_display;

use crate::terminal::StdinReader;

/// What the user picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleOutcome {
    Cancelled,
    /// Send one literal escape character to the remote.
    SendLiteral(u8),
    /// Close the connection.
    Terminate,
    /// Stop the local process (SIGTSTP).
    Suspend,
}

#[derive(Debug, Clone)]
struct MenuItem {
    key: u8,
    label: &'static str,
    outcome: ConsoleOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Up,
    Down,
    Enter,
    Cancel,
    Char(u8),
}

/// Split one terminal read into keys.
fn decode_keys(input: &[u8]) -> Vec<Key> {
    if input == [0x1b] {
        return vec![Key::Cancel];
    }
    let mut keys = Vec::new();
    let mut i = 0;
    while i < input.len() {
        match &input[i..] {
            [0x1b, b'[' | b'O', b'A', ..] => {
                keys.push(Key::Up);
                i += 3;
            }
            [0x1b, b'[' | b'O', b'B', ..] => {
                keys.push(Key::Down);
                i += 3;
            }
            // other CSI/SS3 sequences are ignored whole
            [0x1b, b'[' | b'O', rest @ ..] => {
                let end = rest
                    .iter()
                    .position(|b| (0x40..=0x7e).contains(b))
                    .map_or(rest.len(), |p| p + 1);
                i += 2 + end;
            }
            [0x1b, ..] => {
                keys.push(Key::Cancel);
                i += 1;
            }
            [b'\r' | b'\n', ..] => {
                keys.push(Key::Enter);
                i += 1;
            }
            [c, ..] => {
                keys.push(Key::Char(*c));
                i += 1;
            }
            [] => break,
        }
    }
    keys
}

/// Modal escape menu.
///
/// Reads keys from the same stdin reader as the pipeline, so nothing typed
/// while the menu is open reaches the remote.
pub struct EscapeConsole<W> {
    out: W,
    escape_char: u8,
    items: Vec<MenuItem>,
    selected: usize,
    /// Lines drawn by the last frame.
    drawn: usize,
}

impl<W: AsyncWrite + Unpin> EscapeConsole<W> {
    pub fn new(out: W, escape_char: u8) -> Self {
        let mut items = vec![
            MenuItem {
                key: escape_char,
                label: "Send the escape character",
                outcome: ConsoleOutcome::SendLiteral(escape_char),
            },
            MenuItem {
                key: b'.',
                label: "Terminate the connection",
                outcome: ConsoleOutcome::Terminate,
            },
        ];
        if cfg!(unix) {
            items.push(MenuItem {
                key: 0x1a,
                label: "Suspend resh",
                outcome: ConsoleOutcome::Suspend,
            });
        }
        Self {
            out,
            escape_char,
            items,
            selected: 0,
            drawn: 0,
        }
    }

    /// Show the menu until the user picks an item or cancels.
    pub async fn run(&mut self, input: &mut StdinReader) -> Result<ConsoleOutcome> {
        self.render().await?;
        let outcome = loop {
            let Some(chunk) = input.read().await else {
                break ConsoleOutcome::Cancelled;
            };
            if let Some(outcome) = self.handle(&chunk) {
                break outcome;
            }
            self.render().await?;
        };
        self.clear().await?;
        debug!(?outcome, "escape console closed");
        Ok(outcome)
    }

    fn handle(&mut self, chunk: &[u8]) -> Option<ConsoleOutcome> {
        for key in decode_keys(chunk) {
            if let Key::Char(c) = key
                && let Some(item) = self.items.iter().find(|item| item.key == c)
            {
                return Some(item.outcome);
            }
            match key {
                Key::Up | Key::Char(b'k' | b'K') => {
                    self.selected = self.selected.saturating_sub(1);
                }
                Key::Down | Key::Char(b'j' | b'J') => {
                    self.selected = (self.selected + 1).min(self.items.len() - 1);
                }
                Key::Char(b'h' | b'H') => self.selected = 0,
                Key::Char(b'l' | b'L') => self.selected = self.items.len() - 1,
                Key::Enter => return Some(self.items[self.selected].outcome),
                Key::Cancel | Key::Char(b'q' | b'Q' | 0x03) => {
                    return Some(ConsoleOutcome::Cancelled);
                }
                Key::Char(_) => {}
            }
        }
        None
    }

    async fn render(&mut self) -> Result<()> {
        let mut frame = String::new();
        if self.drawn > 0 {
            frame.push_str(&format!("\r\x1b[{}A\x1b[J", self.drawn));
        } else {
            frame.push_str("\r\n");
        }
        frame.push_str(&format!(
            "\x1b[1mresh escape console\x1b[0m  (escape: {})\r\n",
            escape_char_display(self.escape_char)
        ));
        for (i, item) in self.items.iter().enumerate() {
            let key = escape_char_display(item.key);
            if i == self.selected {
                frame.push_str(&format!("  \x1b[7m> {:>2}  {}\x1b[0m\r\n", key, item.label));
            } else {
                frame.push_str(&format!("    {:>2}  {}\r\n", key, item.label));
            }
        }
        frame.push_str("  \x1b[2m↑/↓ move  Enter select  q cancel\x1b[0m");
        self.drawn = self.items.len() + 1;
        self.out.write_all(frame.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        let frame = format!("\r\x1b[{}A\x1b[J", self.drawn + 1);
        self.drawn = 0;
        self.out.write_all(frame.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }
}

/// Stop this process group with SIGTSTP, cooking the terminal while stopped.
pub fn suspend_process() -> Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::getpgrp;

    crate::terminal::restore_terminal();
    let result = killpg(getpgrp(), Signal::SIGTSTP);
    // execution resumes here after SIGCONT
    crate::terminal::reenter_raw_mode();
    result.map_err(|e| std::io::Error::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use resh_test_utils::CaptureWriter;
    use tokio::sync::mpsc;

    fn reader(chunks: &[&[u8]]) -> StdinReader {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in chunks {
            tx.send(chunk.to_vec()).unwrap();
        }
        StdinReader::from_channel(rx)
    }

    async fn pick(chunks: &[&[u8]]) -> (ConsoleOutcome, String) {
        let out = CaptureWriter::new();
        let mut console = EscapeConsole::new(out.clone(), b'~');
        let outcome = console.run(&mut reader(chunks)).await.unwrap();
        (outcome, out.contents_string())
    }

    #[test]
    fn arrow_sequences_decode() {
        assert_eq!(decode_keys(b"\x1b[A\x1bOB"), vec![Key::Up, Key::Down]);
        assert_eq!(decode_keys(b"\x1b"), vec![Key::Cancel]);
        assert_eq!(decode_keys(b"\x1b[1;5C\r"), vec![Key::Enter]);
        assert_eq!(decode_keys(b"j\r"), vec![Key::Char(b'j'), Key::Enter]);
    }

    #[tokio::test]
    async fn dot_terminates() {
        let (outcome, drawn) = pick(&[b"."]).await;
        assert_eq!(outcome, ConsoleOutcome::Terminate);
        assert!(drawn.contains("Terminate the connection"));
        // frame is erased on close
        assert!(drawn.ends_with("\x1b[J"));
    }

    #[tokio::test]
    async fn escape_key_sends_literal() {
        let (outcome, _) = pick(&[b"~"]).await;
        assert_eq!(outcome, ConsoleOutcome::SendLiteral(b'~'));
    }

    #[tokio::test]
    async fn navigate_then_enter() {
        let (outcome, _) = pick(&[b"j", b"\r"]).await;
        assert_eq!(outcome, ConsoleOutcome::Terminate);
        let (outcome, _) = pick(&[b"\x1b[B", b"\x1b[B", b"\x1b[A", b"\r"]).await;
        assert_eq!(outcome, ConsoleOutcome::Terminate);
        let (outcome, _) = pick(&[b"\r"]).await;
        assert_eq!(outcome, ConsoleOutcome::SendLiteral(b'~'));
    }

    #[tokio::test]
    async fn cancel_keys() {
        for key in [&b"q"[..], b"\x1b", b"\x03"] {
            let (outcome, _) = pick(&[key]).await;
            assert_eq!(outcome, ConsoleOutcome::Cancelled);
        }
        let (outcome, _) = pick(&[]).await;
        assert_eq!(outcome, ConsoleOutcome::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ctrl_z_suspends() {
        let (outcome, drawn) = pick(&[b"\x1a"]).await;
        assert_eq!(outcome, ConsoleOutcome::Suspend);
        assert!(drawn.contains("^Z"));
    }

    #[tokio::test]
    async fn drawn_on_the_given_writer_only() {
        let (_, drawn) = pick(&[b"q"]).await;
        assert!(drawn.contains("resh escape console"));
        assert!(drawn.contains("(escape: ~)"));
    }
}
