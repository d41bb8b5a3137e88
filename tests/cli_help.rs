use std::fmt::Write as _;

use anyhow::{Context, Result};
use assert_cmd::Command;
use tempfile::tempdir;

struct HelpCase {
    path: &'static [&'static str],
    expected_snippet: &'static str,
}

const HELP_CASES: &[HelpCase] = &[
    HelpCase {
        path: &[],
        expected_snippet: "FleetLink command dispatch server CLI",
    },
    HelpCase {
        path: &["start"],
        expected_snippet: "Start the FleetLink server",
    },
    HelpCase {
        path: &["start"],
        expected_snippet: "--foreground",
    },
    HelpCase {
        path: &["stop"],
        expected_snippet: "Stop the FleetLink server",
    },
    HelpCase {
        path: &["status"],
        expected_snippet: "Display FleetLink server status",
    },
    HelpCase {
        path: &["restart"],
        expected_snippet: "Restart the FleetLink server",
    },
    HelpCase {
        path: &["destroy"],
        expected_snippet: "Destroy all FleetLink data and configuration",
    },
    HelpCase {
        path: &["config"],
        expected_snippet: "Update system configuration",
    },
    HelpCase {
        path: &["config"],
        expected_snippet: "--sweep-interval",
    },
    HelpCase {
        path: &["device"],
        expected_snippet: "Manage devices",
    },
    HelpCase {
        path: &["device", "register"],
        expected_snippet: "Register a device",
    },
    HelpCase {
        path: &["device", "list"],
        expected_snippet: "List all registered devices",
    },
    HelpCase {
        path: &["device", "show"],
        expected_snippet: "Show a single device",
    },
    HelpCase {
        path: &["command"],
        expected_snippet: "Issue and inspect device commands",
    },
    HelpCase {
        path: &["command", "issue"],
        expected_snippet: "Issue a command to a device",
    },
    HelpCase {
        path: &["command", "issue"],
        expected_snippet: "--priority",
    },
    HelpCase {
        path: &["command", "list"],
        expected_snippet: "List commands",
    },
    HelpCase {
        path: &["command", "show"],
        expected_snippet: "Show a single command record",
    },
    HelpCase {
        path: &["command", "cancel"],
        expected_snippet: "Cancel a command",
    },
];

#[test]
fn cli_help_regressions() -> Result<()> {
    for case in HELP_CASES {
        let stdout = run_help(case.path)
            .with_context(|| format!("command {:?} --help failed", case.path))?;
        assert!(
            stdout.contains(case.expected_snippet),
            "expected help for {:?} to contain {:?}\nstdout:\n{}",
            case.path,
            case.expected_snippet,
            indent_output(&stdout)
        );
    }
    Ok(())
}

fn run_help(path: &[&str]) -> Result<String> {
    let temp_log = tempdir()?;
    let mut cmd = Command::cargo_bin("fleetlink")?;
    cmd.args(path);
    cmd.arg("--help");
    cmd.env("FLEETLINK_LOG_DIR", temp_log.path());
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "fleetlink {:?} --help exited with {}: {}",
            path,
            output.status,
            stderr
        );
    }
    let stdout = String::from_utf8(output.stdout)?.replace("\r\n", "\n");
    Ok(stdout)
}

fn indent_output(output: &str) -> String {
    let mut indented = String::new();
    for line in output.lines() {
        let _ = writeln!(&mut indented, "    {}", line);
    }
    indented
}
