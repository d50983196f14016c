//! Detection of active operator sessions on a VM.
//!
//! A fixed battery of read-only checks runs in order. Each check that finds
//! activity contributes a section to the summary; an empty summary means the
//! VM is idle. Only the first check is authoritative: when it fails the whole
//! detection fails, while failures of later checks become warnings.

use camino::Utf8Path;
use thiserror::Error;

use crate::command::{RemoteCommand, read_if_present};
use crate::remote::{RemoteError, RemoteRunner, RemoteTarget};

/// Marker file whose presence extends the idle timeout.
pub const KEEPALIVE_MARKER: &str = "/var/lib/berth/keepalive";

/// Container label identifying interactive workload containers.
pub const SESSION_LABEL: &str = "berth.session=active";

/// Exit status shells use for a missing command.
const COMMAND_NOT_FOUND: i32 = 127;

/// Errors raised by session detection.
#[derive(Debug, Error)]
pub enum DetectError {
    /// Raised when the primary check fails.
    #[error("session check `{check}` failed: {source}")]
    Check {
        /// Check name.
        check: &'static str,
        /// Underlying remote failure.
        #[source]
        source: RemoteError,
    },
}

/// Aggregated result of the check battery.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionReport {
    /// Human-readable description of active sessions; empty when idle.
    pub summary: String,
    /// Checks that could not be evaluated.
    pub warnings: Vec<String>,
}

impl SessionReport {
    /// Returns `true` when any check found activity.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        !self.summary.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
enum SessionCheck {
    Multiplexer,
    Logins,
    Containers,
    Keepalive,
}

impl SessionCheck {
    const ALL: [Self; 4] = [
        Self::Multiplexer,
        Self::Logins,
        Self::Containers,
        Self::Keepalive,
    ];

    const fn name(self) -> &'static str {
        match self {
            Self::Multiplexer => "tmux clients",
            Self::Logins => "logged-in users",
            Self::Containers => "workload containers",
            Self::Keepalive => "keepalive marker",
        }
    }

    const fn heading(self) -> &'static str {
        match self {
            Self::Multiplexer => "attached tmux clients:",
            Self::Logins => "logged-in sessions:",
            Self::Containers => "running workload containers:",
            Self::Keepalive => "idle timeout extended by keepalive marker:",
        }
    }

    fn command(self) -> RemoteCommand {
        match self {
            Self::Multiplexer => {
                RemoteCommand::fixed("tmux list-clients -F '#{client_tty} #{session_name}'")
            }
            Self::Logins => RemoteCommand::fixed("who"),
            Self::Containers => RemoteCommand::fixed(format!(
                "docker ps --filter label={SESSION_LABEL} --format '{{{{.Names}}}} {{{{.Status}}}}' 2>/dev/null || true"
            )),
            Self::Keepalive => read_if_present(Utf8Path::new(KEEPALIVE_MARKER)),
        }
    }

    /// Returns `true` for failures that mean "nothing to report".
    fn is_clear_failure(self, err: &RemoteError) -> bool {
        let RemoteError::CommandFailed { code, stderr } = err else {
            return false;
        };
        if *code == COMMAND_NOT_FOUND {
            return true;
        }
        match self {
            Self::Multiplexer => {
                stderr.contains("no server running") || stderr.contains("error connecting to")
            }
            Self::Logins | Self::Containers | Self::Keepalive => false,
        }
    }
}

/// Runs the check battery over a [`RemoteRunner`].
#[derive(Debug)]
pub struct SessionDetector<'r, R> {
    runner: &'r R,
}

impl<'r, R: RemoteRunner + Sync> SessionDetector<'r, R> {
    /// Creates a detector that checks through `runner`.
    #[must_use]
    pub const fn new(runner: &'r R) -> Self {
        Self { runner }
    }

    /// Runs every check against `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DetectError::Check`] when the primary check fails for a
    /// reason other than "no sessions".
    pub async fn detect(&self, target: &RemoteTarget) -> Result<SessionReport, DetectError> {
        let mut sections = Vec::new();
        let mut warnings = Vec::new();

        for (index, check) in SessionCheck::ALL.into_iter().enumerate() {
            let command = check.command();
            let output = match self.runner.run(target, &command).await {
                Ok(stdout) => stdout,
                Err(err) if check.is_clear_failure(&err) => String::new(),
                Err(source) if index == 0 => {
                    return Err(DetectError::Check {
                        check: check.name(),
                        source,
                    });
                }
                Err(err) => {
                    tracing::warn!(check = check.name(), error = %err, "session check failed");
                    warnings.push(format!("could not check {}: {err}", check.name()));
                    continue;
                }
            };

            let lines = output
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.trim().is_empty())
                .collect::<Vec<_>>();
            if lines.is_empty() {
                continue;
            }
            let mut section = String::from(check.heading());
            for line in lines {
                section.push_str("\n  ");
                section.push_str(line.trim_start());
            }
            sections.push(section);
        }

        Ok(SessionReport {
            summary: sections.join("\n"),
            warnings,
        })
    }
}
