//! TOML-backed host key store.
//!
//! Pins live in a `[host_keys]` table keyed by VM name:
//!
//! ```toml
//! [host_keys]
//! default = "SHA256:2Qv0..."
//! ```

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;

use super::{HostKeyStore, HostKeyStoreError};

/// File name of the store inside the berth configuration directory.
pub const HOST_KEYS_FILE_NAME: &str = "host_keys.toml";

const APP_DIR: &str = "berth";
const HOST_KEYS_SECTION: &str = "host_keys";

/// Host key store persisted as a TOML file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHostKeyStore {
    path: Utf8PathBuf,
}

impl FileHostKeyStore {
    /// Opens the store at an explicit path.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the store under `$XDG_CONFIG_HOME/berth`, falling back to
    /// `~/.config/berth`.
    ///
    /// # Errors
    ///
    /// Returns [`HostKeyStoreError::Location`] when neither variable is set
    /// or the location is not UTF-8.
    pub fn at_default_location() -> Result<Self, HostKeyStoreError> {
        let raw_base = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|value| !value.is_empty())
            .map(std::path::PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| std::path::PathBuf::from(home).join(".config"))
            })
            .ok_or_else(|| HostKeyStoreError::Location {
                message: String::from("neither XDG_CONFIG_HOME nor HOME is set"),
            })?;
        let base =
            Utf8PathBuf::from_path_buf(raw_base).map_err(|path| HostKeyStoreError::Location {
                message: format!("{} is not valid UTF-8", path.display()),
            })?;
        Ok(Self::new(base.join(APP_DIR).join(HOST_KEYS_FILE_NAME)))
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn load(&self) -> Result<toml::value::Table, HostKeyStoreError> {
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(toml::value::Table::new());
        };
        if contents.trim().is_empty() {
            return Ok(toml::value::Table::new());
        }
        let value: toml::Value =
            toml::from_str(&contents).map_err(|err| self.invalid(err.to_string()))?;
        match value {
            toml::Value::Table(table) => Ok(table),
            _ => Err(self.invalid("root is not a table")),
        }
    }

    fn section<'t>(
        &self,
        root: &'t toml::value::Table,
    ) -> Result<Option<&'t toml::value::Table>, HostKeyStoreError> {
        root.get(HOST_KEYS_SECTION).map_or(Ok(None), |section| {
            section
                .as_table()
                .map(Some)
                .ok_or_else(|| self.invalid(format!("[{HOST_KEYS_SECTION}] must be a table")))
        })
    }

    fn section_mut<'t>(
        &self,
        root: &'t mut toml::value::Table,
    ) -> Result<&'t mut toml::value::Table, HostKeyStoreError> {
        root.entry(String::from(HOST_KEYS_SECTION))
            .or_insert_with(|| toml::Value::Table(toml::value::Table::new()))
            .as_table_mut()
            .ok_or_else(|| self.invalid(format!("[{HOST_KEYS_SECTION}] must be a table")))
    }

    fn save(&self, root: toml::value::Table) -> Result<(), HostKeyStoreError> {
        let rendered = toml::to_string_pretty(&toml::Value::Table(root))
            .map_err(|err| self.invalid(err.to_string()))?;
        write_file(&self.path, &rendered)
    }

    fn invalid(&self, message: impl Into<String>) -> HostKeyStoreError {
        HostKeyStoreError::Invalid {
            path: self.path.to_string(),
            message: message.into(),
        }
    }
}

impl HostKeyStore for FileHostKeyStore {
    fn fingerprint(&self, vm_name: &str) -> Result<Option<String>, HostKeyStoreError> {
        let root = self.load()?;
        let Some(section) = self.section(&root)? else {
            return Ok(None);
        };
        section.get(vm_name).map_or(Ok(None), |raw| {
            raw.as_str()
                .map(|fingerprint| Some(fingerprint.trim().to_owned()))
                .ok_or_else(|| {
                    self.invalid(format!("{HOST_KEYS_SECTION}.{vm_name} must be a string"))
                })
        })
    }

    fn record(&self, vm_name: &str, fingerprint: &str) -> Result<(), HostKeyStoreError> {
        let mut root = self.load()?;
        self.section_mut(&mut root)?.insert(
            vm_name.to_owned(),
            toml::Value::String(fingerprint.trim().to_owned()),
        );
        self.save(root)
    }

    fn forget(&self, vm_name: &str) -> Result<bool, HostKeyStoreError> {
        let mut root = self.load()?;
        if self.section(&root)?.is_none() {
            return Ok(false);
        }
        let removed = self.section_mut(&mut root)?.remove(vm_name).is_some();
        if removed {
            self.save(root)?;
        }
        Ok(removed)
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), HostKeyStoreError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| HostKeyStoreError::Invalid {
        path: path.to_string(),
        message: String::from("store path is missing a filename"),
    })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> HostKeyStoreError {
    HostKeyStoreError::Io {
        path: path.to_string(),
        message: err.to_string(),
    }
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, HostKeyStoreError> {
    let (parent, file_name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(parent, &err)),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, &err)),
    }
}

fn write_file(path: &Utf8Path, contents: &str) -> Result<(), HostKeyStoreError> {
    let (parent, file_name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    dir.write(file_name, contents)
        .map_err(|err| io_error(path, &err))
}
