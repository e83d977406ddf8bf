//! Recipe generation.
//!
//! Renders the `Dockerfile` for a unit from its role list, volumes, ports and any
//! add-ons that name it. Generation reads nothing but add-on fragments, so the same
//! inputs always produce byte-identical text.
//!
//! # Submodules
//!
//! - [`addon`] - add-on manifests, fragment filtering and replacement rules

pub mod addon;

use std::fmt::Write;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::RECIPE_VERSION;
use crate::settings::{DeploymentType, Settings};
use crate::unit::UnitConfig;

pub use addon::{AddOnImage, AddOnManifest, FragmentRule};

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("platform '{0}' is not supported (expected redhat or suse)")]
  UnsupportedPlatform(String),

  #[error("could not parse NAME=VALUE format from volume for {unit}: '{volume}'")]
  MalformedVolume { unit: String, volume: String },

  #[error("invalid add-on manifest {path}: {message}")]
  AddOnManifest { path: PathBuf, message: String },

  #[error("unable to read add-on fragment {path}: {source}")]
  AddOnFragment {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Package family of the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
  Redhat,
  Suse,
}

impl Platform {
  /// Guess the platform from a base image reference.
  pub fn from_base_image(image: &str) -> Self {
    if image.to_lowercase().contains("suse") {
      Platform::Suse
    } else {
      Platform::Redhat
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Platform::Redhat => "redhat",
      Platform::Suse => "suse",
    }
  }

  fn bootstrap(&self) -> &'static str {
    match self {
      Platform::Redhat => {
        "RUN yum install --assumeyes ansible && \\\n    \
         rm -rf /root/.cache /var/cache/yum && \\\n    \
         echo \"minrate=1\" >> /etc/yum.conf && \\\n    \
         echo \"timeout=300\" >> /etc/yum.conf\n"
      }
      Platform::Suse => "RUN zypper install --no-confirm ansible curl && rm -rf /var/cache/zypp\n",
    }
  }
}

impl FromStr for Platform {
  type Err = RecipeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "redhat" => Ok(Platform::Redhat),
      "suse" => Ok(Platform::Suse),
      other => Err(RecipeError::UnsupportedPlatform(other.to_string())),
    }
  }
}

/// Everything recipe generation reads for one unit.
#[derive(Debug, Clone)]
pub struct RecipeInput<'a> {
  pub unit_name: &'a str,
  pub image_name: &'a str,
  pub config: &'a UnitConfig,
  pub base_image: &'a str,
  pub platform: Platform,
  pub deployment: DeploymentType,
  pub addons: &'a [PathBuf],
  pub fragment_rules: &'a [FragmentRule],
}

impl<'a> RecipeInput<'a> {
  pub fn new(
    settings: &'a Settings,
    unit_name: &'a str,
    image_name: &'a str,
    config: &'a UnitConfig,
  ) -> Result<Self, RecipeError> {
    Ok(Self {
      unit_name,
      image_name,
      config,
      base_image: &settings.base_image,
      platform: settings.platform()?,
      deployment: settings.deployment,
      addons: &settings.addons,
      fragment_rules: &settings.fragment_rules,
    })
  }
}

/// Render the recipe for one unit.
///
/// # Errors
///
/// Fails on a volume without `=`, or on a missing or malformed add-on manifest or fragment.
pub fn generate(input: &RecipeInput<'_>) -> Result<String, RecipeError> {
  let mut out = String::new();
  let unit = input.unit_name;

  // writeln! into a String cannot fail
  let _ = writeln!(out, "# Generated recipe for {}", input.image_name);
  let _ = writeln!(out, "FROM {}", input.base_image);
  out.push_str("ARG PLATFORM\nARG PLAYBOOK_SRV\n");
  out.push_str("ENV PLATFORM=$PLATFORM ANSIBLE_CONFIG=/ansible/ansible.cfg ANSIBLE_CONTAINER=true\n");
  out.push_str("RUN mkdir --parents /opt/sas/viya/home/{lib/envesntl,bin}\n");
  out.push_str(input.platform.bootstrap());
  out.push_str("ADD *.yml *.cfg /ansible/\nADD roles /ansible/roles\n");

  out.push_str("\n# Ansible roles, one layer each\n");
  for role in &input.config.roles {
    if role.eq_ignore_ascii_case(unit) {
      let _ = writeln!(out, "# Add the {role} specific role");
      out.push_str("ADD dynamicRoles /ansible/dynamicRoles\n");
    }
    let _ = writeln!(out, "# {role} role");
    let _ = writeln!(
      out,
      "RUN ansible-playbook -vv /ansible/playbook.yml --extra-vars layer={role} \
       --extra-vars PLAYBOOK_SRV=${{PLAYBOOK_SRV}} --extra-vars container_name={unit}"
    );
  }

  if !input.config.volumes.is_empty() {
    out.push_str("\n# Volume mount points\n");
    for volume in &input.config.volumes {
      let (_, path) = volume.split_once('=').ok_or_else(|| RecipeError::MalformedVolume {
        unit: unit.to_string(),
        volume: volume.clone(),
      })?;
      let _ = writeln!(out, "VOLUME {path}");
    }
  }

  if !input.config.ports.is_empty() {
    out.push_str("\n# Ports\n");
    for port in &input.config.ports {
      let _ = writeln!(out, "EXPOSE {port}");
    }
  }

  out.push_str(&addon::merge(unit, input.deployment, input.addons, input.fragment_rules)?);

  let user = &input.config.user;
  out.push_str("\n# Start a top level process that starts all services as a non-root user\n");
  let _ = writeln!(out, "USER {user}:{user}");
  let _ = writeln!(
    out,
    "ENTRYPOINT [\"/usr/bin/tini\", \"--\", \"/opt/sas/viya/home/bin/{unit}-entrypoint.sh\"]"
  );

  out.push_str("\n# Define labels\n");
  let _ = writeln!(
    out,
    "LABEL sas.recipe=\"true\" \\\n      sas.recipe.version=\"{RECIPE_VERSION}\" \\\n      \
     sas.recipe.image=\"{}\" \\\n      sas.layer.{unit}=\"true\"",
    input.image_name
  );

  Ok(out)
}
