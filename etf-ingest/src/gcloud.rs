//! Real [`CommandRunner`] backed by the `gcloud` CLI.
//!
//! Commands run with stdin closed and both output streams captured: stdout carries values the
//! deployment reads back (the service URL), stderr carries gcloud's progress and error text.
//! Set `GCLOUD_BIN` to run a different executable in place of `gcloud`.

use std::process::{Command, Stdio};

use etf_ingest_core::contract::{CommandOutput, CommandRunner, CommandSpec, RunError};
use etf_ingest_core::deploy::GCLOUD;

pub const GCLOUD_BIN_ENV: &str = "GCLOUD_BIN";

pub struct GcloudRunner {
    gcloud: String,
}

impl GcloudRunner {
    pub fn new(gcloud: impl Into<String>) -> Self {
        Self {
            gcloud: gcloud.into(),
        }
    }

    pub fn from_env() -> Self {
        let gcloud = std::env::var(GCLOUD_BIN_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| GCLOUD.to_string());
        Self::new(gcloud)
    }

    fn program<'a>(&'a self, command: &'a CommandSpec) -> &'a str {
        if command.program == GCLOUD {
            &self.gcloud
        } else {
            &command.program
        }
    }
}

impl CommandRunner for GcloudRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RunError> {
        let program = self.program(command);
        let output = Command::new(program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                tracing::error!(error = ?e, program, "Failed to launch gcloud process");
                e
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "gcloud", "{line}");
        }

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}
