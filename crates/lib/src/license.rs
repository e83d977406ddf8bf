//! License material substituted into unit secrets and environment entries.
//!
//! The material is opaque: it is read as bytes and only ever copied verbatim or
//! base64-encoded into configuration entries.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tracing::debug;

use crate::settings::LicensePaths;

#[derive(Debug, Error)]
#[error("failed to read license material {path}: {source}")]
pub struct LicenseError {
  pub path: PathBuf,
  #[source]
  pub source: std::io::Error,
}

/// Opaque license blobs. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LicenseMaterial {
  pub license: Option<Vec<u8>>,
  pub metered_license: Option<Vec<u8>>,
  pub ca_certificate: Option<Vec<u8>>,
  pub entitlement_certificate: Option<Vec<u8>>,
  pub site_default: Option<Vec<u8>>,
}

impl LicenseMaterial {
  /// Read every configured license file except the site defaults, which have their own loader.
  pub fn load(paths: &LicensePaths) -> Result<Self, LicenseError> {
    Ok(Self {
      license: read_optional(paths.license.as_deref())?,
      metered_license: read_optional(paths.metered_license.as_deref())?,
      ca_certificate: read_optional(paths.ca_certificate.as_deref())?,
      entitlement_certificate: read_optional(paths.entitlement_certificate.as_deref())?,
      site_default: None,
    })
  }

  /// Substitute license material into a secret entry.
  ///
  /// Returns `None` when the entry does not ask for license material or the material is absent.
  pub fn substitute_secret(&self, entry: &str) -> Option<String> {
    let lower = entry.to_lowercase();
    let license = self.license.as_deref()?;
    if lower.contains("setinit_text_enc=") {
      Some(format!("SETINIT_TEXT_ENC={}", STANDARD.encode(license)))
    } else if lower.contains("setinit_text=") {
      Some(format!("SETINIT_TEXT={}", String::from_utf8_lossy(license)))
    } else {
      None
    }
  }

  /// Substitute license material into an environment entry.
  pub fn substitute_environment(&self, entry: &str) -> Option<String> {
    let lower = entry.to_lowercase();
    if lower.contains("sas_license=") {
      let metered = self.metered_license.as_deref()?;
      Some(format!("SAS_LICENSE={}", String::from_utf8_lossy(metered)))
    } else if lower.contains("sas_client_cert=") {
      let cert = self.entitlement_certificate.as_deref()?;
      Some(format!("SAS_CLIENT_CERT={}", STANDARD.encode(cert)))
    } else if lower.contains("sas_ca_cert=") {
      let cert = self.ca_certificate.as_deref()?;
      Some(format!("SAS_CA_CERT={}", STANDARD.encode(cert)))
    } else if lower.contains("consul_key_value_data_enc=") {
      let site_default = self.site_default.as_deref()?;
      Some(format!("CONSUL_KEY_VALUE_DATA_ENC={}", STANDARD.encode(site_default)))
    } else {
      None
    }
  }
}

fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>, LicenseError> {
  let Some(path) = path else {
    return Ok(None);
  };
  debug!(path = ?path, "reading license material");
  std::fs::read(path).map(Some).map_err(|source| LicenseError {
    path: path.to_path_buf(),
    source,
  })
}
