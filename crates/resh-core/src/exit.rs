//! Process exit codes.
//!
//! Codes are dense, starting at 101 so they never collide with the remote
//! command's own exit status in the common 0..=100 range.

/// Exit code reported by the client for its own failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    ArgsInvalid = 101,
    UserConfig,
    SetupWinVT,
    NoDestHost,
    Background,
    LoginFailed,
    IoFwFailed,
    SubFwFailed,
    StartFailed,
    ShellFailed,
    StdinFailed,
    TrzszFailed,
    ConsoleKill,
    UdpCtrlC,
    TmuxDetach,
    UdpAliveTimeout,
    UdpReconnectTimeout,
    UploadFailed,
    HostKeyFailed,
}

impl ExitCode {
    /// Numeric value passed to `std::process::exit`.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Short stage name used as a prefix for user-visible errors.
    pub fn stage(self) -> &'static str {
        match self {
            ExitCode::ArgsInvalid => "args",
            ExitCode::UserConfig => "config",
            ExitCode::SetupWinVT => "terminal",
            ExitCode::NoDestHost => "destination",
            ExitCode::Background => "background",
            ExitCode::LoginFailed => "login",
            ExitCode::IoFwFailed => "stdio forward",
            ExitCode::SubFwFailed => "subsystem",
            ExitCode::StartFailed => "start",
            ExitCode::ShellFailed => "start shell",
            ExitCode::StdinFailed => "stdin",
            ExitCode::TrzszFailed => "trzsz",
            ExitCode::ConsoleKill => "console",
            ExitCode::UdpCtrlC => "reconnect",
            ExitCode::TmuxDetach => "tmux",
            ExitCode::UdpAliveTimeout => "keep-alive",
            ExitCode::UdpReconnectTimeout => "reconnect",
            ExitCode::UploadFailed => "upload",
            ExitCode::HostKeyFailed => "host key",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_dense_from_101() {
        assert_eq!(ExitCode::ArgsInvalid.code(), 101);
        assert_eq!(ExitCode::UserConfig.code(), 102);
        assert_eq!(ExitCode::ConsoleKill.code(), 113);
        assert_eq!(ExitCode::UdpCtrlC.code(), 114);
        assert_eq!(ExitCode::TmuxDetach.code(), 115);
        assert_eq!(ExitCode::HostKeyFailed.code(), 119);
    }
}
