//! TLS certificates for mocked hosts.
//!
//! The daemon only needs a [`CertProvider`]: something that writes a
//! certificate and private key covering a set of hosts to two known paths.
//! [`LocalCa`] is the shipped implementation; it keeps a development CA on
//! disk and signs leaf certificates with it. Adding that CA to the system
//! trust store is left to the user.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, CertifiedIssuer, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use tracing::info;

const APP_NAME: &str = "wock";
const CA_COMMON_NAME: &str = "wock Development CA";

/// Errors raised while issuing certificates.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("no hosts to issue a certificate for")]
    NoHosts,

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("local CA is partially installed (rootCA.pem/rootCA-key.pem mismatch), run `wock uninstall` then `wock install`")]
    PartialCa,

    #[error("could not determine the {0} directory")]
    NoDirectory(&'static str),
}

impl CertError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Issues a certificate covering a set of hosts.
pub trait CertProvider: Send + Sync {
    /// Write a certificate and key valid for every name in `hosts` to
    /// [`cert_file`](Self::cert_file) and [`key_file`](Self::key_file).
    fn create_cert(&self, hosts: &[String]) -> Result<(), CertError>;

    fn cert_file(&self) -> &Path;

    fn key_file(&self) -> &Path;
}

/// Development CA stored on disk, signing one leaf certificate per host set.
#[derive(Debug, Clone)]
pub struct LocalCa {
    ca_dir: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
}

impl LocalCa {
    /// CA material under the local data directory, issued certificates under
    /// the cache directory.
    pub fn new() -> Result<Self, CertError> {
        let data_dir = dirs::data_local_dir().ok_or(CertError::NoDirectory("data"))?;
        let cache_dir = dirs::cache_dir().ok_or(CertError::NoDirectory("cache"))?;
        Ok(Self::with_dirs(
            data_dir.join(APP_NAME),
            cache_dir.join(APP_NAME),
        ))
    }

    pub fn with_dirs(ca_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            ca_dir: ca_dir.into(),
            cert_file: output_dir.join("cert.pem"),
            key_file: output_dir.join("key.pem"),
        }
    }

    pub fn ca_cert_file(&self) -> PathBuf {
        self.ca_dir.join("rootCA.pem")
    }

    fn ca_key_file(&self) -> PathBuf {
        self.ca_dir.join("rootCA-key.pem")
    }

    pub fn is_installed(&self) -> bool {
        self.ca_cert_file().exists() && self.ca_key_file().exists()
    }

    /// Generate the CA if it does not exist yet.
    ///
    /// Returns `true` when a new CA was created.
    pub fn install(&self) -> Result<bool, CertError> {
        let cert_path = self.ca_cert_file();
        let key_path = self.ca_key_file();
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => return Ok(false),
            (false, false) => {}
            _ => return Err(CertError::PartialCa),
        }

        let key_pair = KeyPair::generate()?;
        let cert = ca_params().self_signed(&key_pair)?;

        fs::create_dir_all(&self.ca_dir).map_err(|e| CertError::io(&self.ca_dir, e))?;
        write_private(&key_path, key_pair.serialize_pem().as_bytes())?;
        fs::write(&cert_path, cert.pem()).map_err(|e| CertError::io(&cert_path, e))?;

        info!("Generated local CA at {}", cert_path.display());
        Ok(true)
    }

    /// Delete the CA material.
    ///
    /// Returns `true` when something was removed.
    pub fn uninstall(&self) -> Result<bool, CertError> {
        let mut removed = false;
        for path in [self.ca_cert_file(), self.ca_key_file()] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CertError::io(&path, e)),
            }
        }
        Ok(removed)
    }

    fn issuer(&self) -> Result<CertifiedIssuer<'static, KeyPair>, CertError> {
        let key_path = self.ca_key_file();
        let key_pem = fs::read_to_string(&key_path).map_err(|e| CertError::io(&key_path, e))?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        // Same subject and key as the stored CA, so leaves chain to it
        Ok(CertifiedIssuer::self_signed(ca_params(), key_pair)?)
    }
}

impl CertProvider for LocalCa {
    fn create_cert(&self, hosts: &[String]) -> Result<(), CertError> {
        if hosts.is_empty() {
            return Err(CertError::NoHosts);
        }
        self.install()?;
        let issuer = self.issuer()?;

        let mut params = CertificateParams::new(hosts.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hosts[0].as_str());
        dn.push(DnType::OrganizationName, APP_NAME);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &issuer)?;

        for path in [&self.cert_file, &self.key_file] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| CertError::io(parent, e))?;
            }
        }
        write_private(&self.key_file, key_pair.serialize_pem().as_bytes())?;
        fs::write(&self.cert_file, cert.pem()).map_err(|e| CertError::io(&self.cert_file, e))?;

        info!(hosts = ?hosts, "Issued certificate at {}", self.cert_file.display());
        Ok(())
    }

    fn cert_file(&self) -> &Path {
        &self.cert_file
    }

    fn key_file(&self) -> &Path {
        &self.key_file
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, APP_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

/// Write key material readable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| CertError::io(path, e))?;
    file.write_all(contents)
        .map_err(|e| CertError::io(path, e))
}
