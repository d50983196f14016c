//! Host key scanning through `ssh-keyscan`.

use std::ffi::OsString;

use crate::exec::{CommandRunner, ProcessCommandRunner};

use super::{HostKeyScanner, ScanError, ScannedHostKey, fingerprint_of};

/// Default `ssh-keyscan` binary name.
pub const DEFAULT_KEYSCAN_BIN: &str = "ssh-keyscan";

const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 5;
const KEY_TYPE: &str = "ed25519";

/// [`HostKeyScanner`] that shells out to `ssh-keyscan`.
#[derive(Clone, Debug)]
pub struct KeyscanScanner<R> {
    runner: R,
    keyscan_bin: String,
    timeout_secs: u64,
}

impl KeyscanScanner<ProcessCommandRunner> {
    /// Creates a scanner that spawns `keyscan_bin`.
    #[must_use]
    pub fn with_process_runner(keyscan_bin: impl Into<String>) -> Self {
        Self::new(ProcessCommandRunner, keyscan_bin)
    }
}

impl<R: CommandRunner> KeyscanScanner<R> {
    /// Creates a scanner using the provided runner.
    #[must_use]
    pub fn new(runner: R, keyscan_bin: impl Into<String>) -> Self {
        Self {
            runner,
            keyscan_bin: keyscan_bin.into(),
            timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
        }
    }
}

impl<R: CommandRunner> HostKeyScanner for KeyscanScanner<R> {
    fn scan(&self, host: &str, port: u16) -> Result<ScannedHostKey, ScanError> {
        let args = [
            OsString::from("-T"),
            OsString::from(self.timeout_secs.to_string()),
            OsString::from("-t"),
            OsString::from(KEY_TYPE),
            OsString::from("-p"),
            OsString::from(port.to_string()),
            OsString::from(host),
        ];
        let output = self
            .runner
            .run(&self.keyscan_bin, &args)
            .map_err(|err| ScanError::new(err.to_string()))?;

        let Some(public_key) = parse_keyscan_output(&output.stdout) else {
            let detail = output.stderr.trim();
            return Err(ScanError::new(if detail.is_empty() {
                format!("no {KEY_TYPE} host key returned")
            } else {
                format!("no {KEY_TYPE} host key returned: {detail}")
            }));
        };

        let fingerprint = fingerprint_of(&public_key)?;
        tracing::debug!(host, port, %fingerprint, "scanned host key");
        Ok(ScannedHostKey {
            fingerprint,
            public_key,
        })
    }
}

/// Extracts the first `<type> <base64>` key from `host type key` lines.
fn parse_keyscan_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let (_, rest) = line.split_once(char::is_whitespace)?;
            let key = rest.trim();
            (!key.is_empty()).then(|| key.to_owned())
        })
}
