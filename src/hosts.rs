//! Managed entries in the system hosts file.
//!
//! Every line this crate owns carries the [`MANAGED_TAG`] marker, either as an
//! active mapping (`127.0.0.1 <host>   # source:wock`) or as a disabled one
//! (`# 127.0.0.1 <host>   source:wock`). Unmarked lines are never rewritten.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Marker identifying lines owned by wock
pub const MANAGED_TAG: &str = "source:wock";

const LOOPBACK: &str = "127.0.0.1";

static HOSTNAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?[0-9a-z_-]+(\.[0-9a-z_-]+)*$").expect("hostname pattern is valid")
});

/// Errors raised while editing the hosts file.
#[derive(Debug, Error)]
pub enum HostsError {
    #[error("failed to read hosts file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write hosts file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid hostname '{0}'")]
    InvalidHostname(String),
}

/// Handle on a hosts file.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl Default for HostsFile {
    fn default() -> Self {
        Self::system()
    }
}

impl HostsFile {
    /// The operating system's hosts file.
    pub fn system() -> Self {
        Self::with_path(default_hosts_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw file contents; hosts files are not guaranteed to be UTF-8.
    pub fn read(&self) -> Result<Vec<u8>, HostsError> {
        fs::read(&self.path).map_err(|source| HostsError::Read {
            path: self.path.clone(),
            source,
        })
    }

    /// Point `host` at loopback (`enable`) or comment its entry out.
    pub fn update(&self, host: &str, enable: bool) -> Result<(), HostsError> {
        let content = self.read()?;
        let updated = update_content(&content, host, enable);
        if updated != content {
            self.write(&updated)?;
        }
        debug!(host, enable, "updated hosts file entry");
        Ok(())
    }

    /// Drop every managed line.
    pub fn clear(&self) -> Result<(), HostsError> {
        let content = self.read()?;
        let cleared = clear_content(&content);
        if cleared != content {
            self.write(&cleared)?;
        }
        debug!("cleared managed hosts file entries");
        Ok(())
    }

    /// Replace the file through a sibling temp file and a rename.
    fn write(&self, content: &[u8]) -> Result<(), HostsError> {
        let write_error = |source| HostsError::Write {
            path: self.path.clone(),
            source,
        };

        let temp = self.stage(content).map_err(write_error)?;
        match temp.persist(&self.path) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Bind-mounted files (containers) cannot be renamed over
                warn!(
                    "Atomic replace of {:?} failed ({}), writing in place",
                    self.path, e.error
                );
                fs::write(&self.path, content).map_err(write_error)
            }
        }
    }

    fn stage(&self, content: &[u8]) -> io::Result<NamedTempFile> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        if let Ok(metadata) = fs::metadata(&self.path) {
            fs::set_permissions(temp.path(), metadata.permissions())?;
        }
        Ok(temp)
    }
}

/// Default hosts file location for this platform.
pub fn default_hosts_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

/// Render the managed line for `host`.
pub fn managed_line(host: &str, enable: bool) -> String {
    if enable {
        format!("{LOOPBACK} {host}   # {MANAGED_TAG}")
    } else {
        format!("# {LOOPBACK} {host}   {MANAGED_TAG}")
    }
}

/// Hosts named by a managed line, `None` for lines wock does not own.
///
/// Only ASCII tokens matter here, so a lossy decode is enough to match on.
fn managed_hosts(line: &[u8]) -> Option<Vec<String>> {
    let line = String::from_utf8_lossy(line);
    if !line.contains(MANAGED_TAG) {
        return None;
    }
    let record = line.trim().trim_start_matches('#').trim();
    let mut fields = record.split_whitespace();
    let _address = fields.next()?;
    Some(
        fields
            .take_while(|field| !field.starts_with('#') && *field != MANAGED_TAG)
            .map(str::to_string)
            .collect(),
    )
}

fn is_managed(line: &[u8]) -> bool {
    line.windows(MANAGED_TAG.len())
        .any(|window| window == MANAGED_TAG.as_bytes())
}

fn split_line_ending(line: &[u8]) -> (&[u8], &[u8]) {
    if let Some(text) = line.strip_suffix(b"\r\n") {
        (text, &b"\r\n"[..])
    } else if let Some(text) = line.strip_suffix(b"\n") {
        (text, &b"\n"[..])
    } else {
        (line, &b""[..])
    }
}

fn preferred_line_ending(content: &[u8]) -> &'static [u8] {
    if content.windows(2).any(|pair| pair == b"\r\n") {
        &b"\r\n"[..]
    } else {
        &b"\n"[..]
    }
}

/// Rewrite the managed entry for `host`, appending one if none exists.
///
/// Only the first managed line naming `host` survives; later duplicates are
/// dropped so repeated edits converge on a single entry. Every other line is
/// copied through byte for byte.
pub fn update_content(content: &[u8], host: &str, enable: bool) -> Vec<u8> {
    let newline = preferred_line_ending(content);
    let replacement = managed_line(host, enable);
    let mut output = Vec::with_capacity(content.len() + replacement.len() + 2);
    let mut written = false;

    for line in content.split_inclusive(|b| *b == b'\n') {
        let (text, ending) = split_line_ending(line);
        let owned = managed_hosts(text)
            .is_some_and(|hosts| hosts.iter().any(|h| h.eq_ignore_ascii_case(host)));
        if !owned {
            output.extend_from_slice(line);
            continue;
        }
        if !written {
            output.extend_from_slice(replacement.as_bytes());
            output.extend_from_slice(if ending.is_empty() { newline } else { ending });
            written = true;
        }
    }

    if !written {
        if !output.is_empty() && !output.ends_with(b"\n") {
            output.extend_from_slice(newline);
        }
        output.extend_from_slice(replacement.as_bytes());
        output.extend_from_slice(newline);
    }
    output
}

/// Remove every line carrying the managed tag.
pub fn clear_content(content: &[u8]) -> Vec<u8> {
    content
        .split_inclusive(|b| *b == b'\n')
        .filter(|line| !is_managed(line))
        .flatten()
        .copied()
        .collect()
}

/// Canonical ASCII form of `host`, rejecting names outside the hostname grammar.
///
/// Internationalized names are converted to punycode, and the result is
/// lowercase. A leading `*.` wildcard is allowed.
pub fn normalize_hostname(host: &str) -> Result<String, HostsError> {
    let trimmed = host.trim();
    let (wildcard, rest) = match trimmed.strip_prefix("*.") {
        Some(rest) => ("*.", rest),
        None => ("", trimmed),
    };
    let ascii = idna::domain_to_ascii(rest)
        .map_err(|_| HostsError::InvalidHostname(host.to_string()))?;
    let candidate = format!("{wildcard}{}", ascii.to_ascii_lowercase());
    if HOSTNAME_PATTERN.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(HostsError::InvalidHostname(host.to_string()))
    }
}

pub fn is_valid_hostname(host: &str) -> bool {
    normalize_hostname(host).is_ok()
}
