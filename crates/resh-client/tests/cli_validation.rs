//! CLI validation tests for the resh client.

use std::process::Command;

use clap::Parser;
use resh_client::cli::{Cli, RemoteAction};
use resh_core::ExitCode;

fn resh() -> Command {
    Command::new(env!("CARGO_BIN_EXE_resh"))
}

#[test]
fn test_subsystem_needs_exactly_one_name() {
    let cli = Cli::try_parse_from(["resh", "-s", "host"]).unwrap();
    assert!(cli.validate().unwrap_err().contains("-s"));

    let cli = Cli::try_parse_from(["resh", "-s", "host", "sftp"]).unwrap();
    assert!(cli.validate().is_ok());
    assert_eq!(cli.remote_action(), RemoteAction::Subsystem("sftp".into()));
}

#[test]
fn test_no_command_rejects_command_and_uploads() {
    let cli = Cli::try_parse_from(["resh", "-N", "host", "ls"]).unwrap();
    assert!(cli.validate().is_err());

    let cli = Cli::try_parse_from(["resh", "-N", "--upload-file", "a.txt", "host"]).unwrap();
    assert!(cli.validate().is_err());
}

#[test]
fn test_stdio_forward_conflicts() {
    assert!(Cli::try_parse_from(["resh", "-W", "db:5432", "-N", "host"]).is_err());
    assert!(Cli::try_parse_from(["resh", "-W", "db:0", "host"]).is_err());
    assert!(Cli::try_parse_from(["resh", "-W", "db", "host"]).is_err());

    let cli = Cli::try_parse_from(["resh", "-W", "[::1]:22", "host"]).unwrap();
    assert_eq!(
        cli.remote_action(),
        RemoteAction::StdioForward {
            host: "::1".into(),
            port: 22
        }
    );
    assert!(!cli.should_allocate_pty(true));
}

#[test]
fn test_pty_flags_conflict() {
    assert!(Cli::try_parse_from(["resh", "-t", "-T", "host"]).is_err());
}

#[test]
fn test_reconnect_alias_enables_udp() {
    let cli = Cli::try_parse_from(["resh", "--reconnect", "host"]).unwrap();
    assert!(cli.udp);
}

#[test]
fn test_binary_without_destination_exits_with_no_dest_host() {
    let output = resh().args(["-F", "/dev/null"]).output().unwrap();
    assert_eq!(output.status.code(), Some(ExitCode::NoDestHost.code()));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("resh: "), "{stderr}");
    assert!(stderr.ends_with("\r\n"), "{stderr:?}");
}

#[test]
fn test_binary_rejects_invalid_flag_combination() {
    let output = resh().args(["-F", "/dev/null", "-s", "host"]).output().unwrap();
    assert_eq!(output.status.code(), Some(ExitCode::ArgsInvalid.code()));
}

#[test]
fn test_binary_rejects_bad_control_master_before_connecting() {
    let output = resh()
        .args(["-F", "/dev/null", "-o", "ControlMaster=sometimes", "host"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(ExitCode::UserConfig.code()));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ControlMaster"), "{stderr}");
}
