//! Kira agent server binary.
//! Run with: cargo run --bin kira-agent

use std::process::ExitCode;

use kira_agent::start_kira_agent;

fn main() -> ExitCode {
    start_kira_agent::run()
}
