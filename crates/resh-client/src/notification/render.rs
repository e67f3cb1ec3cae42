//! Rendering logic for the connection notice.

use std::time::Duration;

use super::format::{ellipsize, fit, human_readable_duration_short};

/// What the notice reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoticeStatus {
    /// Time since the connection was lost.
    pub lost_for: Duration,
    /// Time left in the reconnect window.
    pub remaining: Duration,
    pub last_error: Option<String>,
    pub reconnected: bool,
}

impl NoticeStatus {
    pub fn reconnected() -> Self {
        Self {
            reconnected: true,
            ..Default::default()
        }
    }

    pub fn text(&self) -> String {
        if self.reconnected {
            return "Reconnected, redrawing the screen...".to_string();
        }
        format!(
            "Connection lost {} ago, reconnecting... ({} left)",
            human_readable_duration_short(self.lost_for),
            human_readable_duration_short(self.remaining)
        )
    }
}

/// One inverse-video banner line spanning the terminal.
pub fn compact_lines(status: &NoticeStatus, width: u16) -> Vec<String> {
    let text = if status.reconnected {
        format!(" resh: {} ", status.text())
    } else {
        format!(
            " resh: {} | Ctrl+A to toggle full notifications ",
            status.text()
        )
    };
    vec![format!("\x1b[7m{}\x1b[0m", fit(&text, width as usize))]
}

/// A bordered box centered in the terminal.
pub fn full_lines(status: &NoticeStatus, width: u16) -> Vec<String> {
    let width = width as usize;
    let mut content = vec![format!("resh: {}", status.text())];
    if let Some(err) = &status.last_error {
        content.push(format!("Last error: {}", err));
    }
    if !status.reconnected {
        content.push("Press Ctrl+C to exit, Ctrl+A to collapse".to_string());
    }

    // border and one space of padding on each side
    let max_inner = width.saturating_sub(4).max(1);
    let content: Vec<String> = content.iter().map(|l| ellipsize(l, max_inner)).collect();
    let inner = content
        .iter()
        .map(|l| l.chars().count())
        .max()
        .unwrap_or(0);
    let margin = " ".repeat(width.saturating_sub(inner + 4) / 2);
    let rule = "─".repeat(inner + 2);

    let mut lines = Vec::with_capacity(content.len() + 2);
    lines.push(format!("{margin}\x1b[1m┌{rule}┐\x1b[0m"));
    for line in &content {
        lines.push(format!("{margin}\x1b[1m│\x1b[0m {} \x1b[1m│\x1b[0m", fit(line, inner)));
    }
    lines.push(format!("{margin}\x1b[1m└{rule}┘\x1b[0m"));
    lines
}

/// Where and how frames are drawn, remembering the previous frame.
#[derive(Debug, Default)]
pub struct Placement {
    on_top: bool,
    last_lines: usize,
    /// Cursor position (row, col) reported by the terminal, 1-based.
    pub cursor: Option<(u16, u16)>,
}

impl Placement {
    pub fn new(on_top: bool) -> Self {
        Self {
            on_top,
            ..Default::default()
        }
    }

    pub fn last_lines(&self) -> usize {
        self.last_lines
    }

    fn restore_cursor(&self, out: &mut String) {
        match self.cursor {
            Some((row, col)) => out.push_str(&format!("\x1b[{row};{col}H")),
            None => out.push_str("\x1b[u"),
        }
    }

    /// Bytes drawing `lines`, replacing the previous frame.
    pub fn frame(&mut self, lines: &[String]) -> String {
        let mut out = String::new();
        if self.on_top {
            out.push_str("\x1b[s");
            for (i, line) in lines.iter().enumerate() {
                out.push_str(&format!("\x1b[{};1H{}\x1b[K", i + 1, line));
            }
            for i in lines.len()..self.last_lines {
                out.push_str(&format!("\x1b[{};1H\x1b[K", i + 1));
            }
            self.restore_cursor(&mut out);
        } else {
            if self.last_lines == 0 {
                out.push_str("\r\n");
            } else {
                out.push('\r');
                if self.last_lines > 1 {
                    out.push_str(&format!("\x1b[{}A", self.last_lines - 1));
                }
            }
            out.push_str(&lines.join("\x1b[K\r\n"));
            out.push_str("\x1b[K");
            if lines.len() < self.last_lines {
                out.push_str("\x1b[J");
            }
        }
        self.last_lines = lines.len();
        out
    }

    /// Bytes erasing the last frame.
    pub fn clear(&mut self) -> String {
        if self.last_lines == 0 {
            return String::new();
        }
        let mut out = String::new();
        if self.on_top {
            out.push_str("\x1b[s");
            for i in 0..self.last_lines {
                out.push_str(&format!("\x1b[{};1H\x1b[K", i + 1));
            }
            self.restore_cursor(&mut out);
        } else {
            out.push('\r');
            if self.last_lines > 1 {
                out.push_str(&format!("\x1b[{}A", self.last_lines - 1));
            }
            // back onto the line the notice started below
            out.push_str("\x1b[J\x1b[A");
        }
        self.last_lines = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost(secs: u64) -> NoticeStatus {
        NoticeStatus {
            lost_for: Duration::from_secs(secs),
            remaining: Duration::from_secs(600 - secs),
            last_error: None,
            reconnected: false,
        }
    }

    fn visible(line: &str) -> String {
        let mut out = String::new();
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn compact_is_one_inverse_line_of_terminal_width() {
        let lines = compact_lines(&lost(12), 100);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("\x1b[7m"));
        let text = visible(&lines[0]);
        assert_eq!(text.chars().count(), 100);
        assert!(text.contains("Connection lost 12s ago"));
        assert!(text.contains("Ctrl+A to toggle full notifications"));
    }

    #[test]
    fn compact_truncates_on_narrow_terminals() {
        let lines = compact_lines(&lost(3), 20);
        assert_eq!(visible(&lines[0]).chars().count(), 20);
    }

    #[test]
    fn full_box_is_centered_and_shows_error() {
        let mut status = lost(75);
        status.last_error = Some("connection refused".into());
        let lines = full_lines(&status, 120);
        assert_eq!(lines.len(), 5);

        let rows: Vec<String> = lines.iter().map(|l| visible(l)).collect();
        let box_width = rows[0].trim_start().chars().count();
        assert!(rows.iter().all(|r| r.trim_start().chars().count() == box_width));
        let margin = rows[0].chars().count() - box_width;
        assert_eq!(margin, (120 - box_width) / 2);
        assert!(rows[1].contains("1:15 ago"));
        assert!(rows[2].contains("Last error: connection refused"));
        assert!(rows[3].contains("Press Ctrl+C to exit"));
    }

    #[test]
    fn full_box_fits_narrow_terminal() {
        let lines = full_lines(&lost(1), 30);
        assert!(lines.iter().all(|l| visible(l).chars().count() <= 30));
    }

    #[test]
    fn on_top_saves_homes_and_restores() {
        let mut p = Placement::new(true);
        let frame = p.frame(&["a".into(), "b".into()]);
        assert!(frame.starts_with("\x1b[s\x1b[1;1Ha"));
        assert!(frame.contains("\x1b[2;1Hb"));
        assert!(frame.ends_with("\x1b[u"));

        // shrinking clears the old second row
        let frame = p.frame(&["a".into()]);
        assert!(frame.contains("\x1b[2;1H\x1b[K"));

        p.cursor = Some((10, 4));
        assert!(p.frame(&["a".into()]).ends_with("\x1b[10;4H"));
    }

    #[test]
    fn in_place_redraws_over_previous_frame() {
        let mut p = Placement::new(false);
        let first = p.frame(&["x".into(), "y".into(), "z".into()]);
        assert!(first.starts_with("\r\n"));
        assert_eq!(p.last_lines(), 3);

        let second = p.frame(&["x".into()]);
        assert!(second.starts_with("\r\x1b[2A"));
        assert!(second.ends_with("\x1b[J"));
        assert_eq!(p.last_lines(), 1);

        assert_eq!(p.clear(), "\r\x1b[J\x1b[A");
        assert_eq!(p.clear(), "");
    }
}
