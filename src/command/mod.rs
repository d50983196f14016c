//! Injection-safe remote shell commands.
//!
//! The system `ssh` client joins its trailing arguments with spaces before
//! handing them to the remote login shell, so a compound command passed as
//! several arguments loses its structure. Everything here therefore renders
//! to exactly one opaque script string wrapped in [`RemoteCommand`].
//!
//! Untrusted content (for example a public-key line) is validated before it
//! is quoted: any shell metacharacter is rejected outright rather than
//! escaped, and the surviving content is embedded inside single quotes.
//! Content may not start with `-`, so it can never be read as an option by
//! the remote tool it is handed to.

use std::fmt;

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;

/// Home-relative path of the SSH authorised keys file.
pub const AUTHORIZED_KEYS_FILE: &str = ".ssh/authorized_keys";

/// Characters that must never appear in untrusted content.
const FORBIDDEN: &[char] = &[
    ';', '|', '&', '$', '`', '\n', '\r', '\'', '"', '\\', '<', '>', '(', ')', '{', '}', '\0',
];

/// Errors raised while validating untrusted remote content.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when content is empty or whitespace only.
    #[error("remote content must not be empty")]
    EmptyInput,
    /// Raised when content contains a shell metacharacter.
    #[error("invalid characters in remote content: {found:?} is not allowed")]
    InvalidCharacters {
        /// First offending character.
        found: char,
    },
    /// Raised when content would be parsed as a command-line option.
    #[error("remote content must not start with '-'")]
    LeadingDash,
}

/// A single shell script destined for the remote login shell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    script: String,
}

impl RemoteCommand {
    /// Wraps a fixed script that embeds no untrusted content.
    #[must_use]
    pub fn fixed(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// Returns the script text.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Returns the command as the argument vector handed to the transport.
    ///
    /// The vector always has exactly one element.
    #[must_use]
    pub fn argv(&self) -> [&str; 1] {
        [self.script.as_str()]
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.script)
    }
}

/// Validates untrusted content and returns it wrapped in single quotes.
///
/// # Errors
///
/// Returns [`CommandError::EmptyInput`] for blank content,
/// [`CommandError::InvalidCharacters`] when a shell metacharacter is present
/// and [`CommandError::LeadingDash`] for option-shaped content.
pub fn quote_untrusted(content: &str) -> Result<String, CommandError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CommandError::EmptyInput);
    }
    if let Some(found) = content.chars().find(|ch| FORBIDDEN.contains(ch)) {
        return Err(CommandError::InvalidCharacters { found });
    }
    if trimmed.starts_with('-') {
        return Err(CommandError::LeadingDash);
    }
    Ok(format!("'{trimmed}'"))
}

/// Renders a path relative to the remote user's home directory.
fn home_path(relative: &Utf8Path) -> String {
    let escaped = escape(relative.as_str().into());
    format!("\"$HOME\"/{escaped}")
}

/// Builds a script that prints how many lines of `file` equal `content`.
///
/// A missing file yields empty output rather than a failure.
///
/// # Errors
///
/// Returns [`CommandError`] when `content` fails validation.
pub fn key_membership(file: &Utf8Path, content: &str) -> Result<RemoteCommand, CommandError> {
    let quoted = quote_untrusted(content)?;
    let target = home_path(file);
    Ok(RemoteCommand::fixed(format!(
        "grep -cxF -e {quoted} {target} 2>/dev/null || true"
    )))
}

/// Interprets the output of a [`key_membership`] script.
#[must_use]
pub fn membership_present(stdout: &str) -> bool {
    stdout
        .trim()
        .parse::<u32>()
        .is_ok_and(|count| count > 0)
}

/// Builds a script that appends `content` to `file` unless already present,
/// creating the parent directory first.
///
/// # Errors
///
/// Returns [`CommandError`] when `content` fails validation.
pub fn append_line(file: &Utf8Path, content: &str) -> Result<RemoteCommand, CommandError> {
    let quoted = quote_untrusted(content)?;
    let target = home_path(file);
    let parent = file
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .map_or_else(|| String::from("\"$HOME\""), home_path);
    Ok(RemoteCommand::fixed(format!(
        concat!(
            "mkdir -p {parent} && chmod 700 {parent} && ",
            "{{ grep -qxF -e {quoted} {target} 2>/dev/null || printf '%s\\n' {quoted} >> {target}; }} && ",
            "chmod 600 {target}"
        ),
        parent = parent,
        quoted = quoted,
        target = target,
    )))
}

/// Builds a script that prints `path` when it exists and stays silent
/// otherwise.
#[must_use]
pub fn read_if_present(path: &Utf8Path) -> RemoteCommand {
    let escaped = escape(path.as_str().into());
    RemoteCommand::fixed(format!("cat {escaped} 2>/dev/null || true"))
}

#[cfg(test)]
mod tests;
