//! Add-on fragments merged into a unit's recipe.
//!
//! Every add-on directory carries an `addon_config.yml` manifest naming the units it
//! applies to and the fragment files to pull directives from. Only directive lines are
//! kept; everything else in a fragment (comments, `FROM`, blank lines) is dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RecipeError;
use crate::consts::ADDON_MANIFEST_FILE;
use crate::settings::DeploymentType;

/// Directive prefixes kept from a fragment, matched against the trimmed line.
pub const KEPT_DIRECTIVES: &[&str] = &["RUN ", "ADD ", "ARG", "WORKDIR", "USER", "COPY "];

/// Fragments an add-on contributes to one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddOnImage {
  pub dockerfiles: Vec<String>,
}

/// Parsed `addon_config.yml`: unit name to fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddOnManifest(pub BTreeMap<String, AddOnImage>);

impl AddOnManifest {
  /// Read the manifest at the root of `addon_dir`. A missing or malformed manifest is an error.
  pub fn load(addon_dir: &Path) -> Result<Self, RecipeError> {
    let path = addon_dir.join(ADDON_MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| RecipeError::AddOnManifest {
      path: path.clone(),
      message: e.to_string(),
    })?;
    serde_yaml::from_str(&content).map_err(|e| RecipeError::AddOnManifest {
      path,
      message: e.to_string(),
    })
  }

  pub fn fragments_for(&self, unit: &str) -> Option<&AddOnImage> {
    self.0.get(unit)
  }
}

/// Replaces a build argument's default on one add-on when the deployment differs from a
/// reference deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRule {
  pub addon: String,
  pub argument: String,
  pub unless_deployment: DeploymentType,
  pub replacement: String,
}

impl FragmentRule {
  pub fn defaults() -> Vec<FragmentRule> {
    vec![FragmentRule {
      addon: "ide-jupyter-python3".to_string(),
      argument: "BASEIMAGE".to_string(),
      unless_deployment: DeploymentType::Single,
      replacement: "ARG BASEIMAGE=non-single-container".to_string(),
    }]
  }

  fn rewrite(&self, addon: &str, deployment: DeploymentType, line: &str) -> Option<&str> {
    (self.addon == addon && self.unless_deployment != deployment && line.contains(&self.argument))
      .then_some(self.replacement.as_str())
  }
}

/// Name an add-on is labelled with: the last component of its directory.
pub fn addon_name(addon_dir: &Path) -> String {
  addon_dir
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| addon_dir.to_string_lossy().into_owned())
}

/// Add-on directories whose manifest lists `unit`, with their fragments.
pub fn matching_addons(unit: &str, addons: &[PathBuf]) -> Result<Vec<(PathBuf, AddOnImage)>, RecipeError> {
  let mut matched = Vec::new();
  for dir in addons {
    let manifest = AddOnManifest::load(dir)?;
    if let Some(image) = manifest.fragments_for(unit) {
      matched.push((dir.clone(), image.clone()));
    }
  }
  Ok(matched)
}

/// Render the add-on section of a recipe. Returns an empty string when no add-on applies.
pub fn merge(
  unit: &str,
  deployment: DeploymentType,
  addons: &[PathBuf],
  rules: &[FragmentRule],
) -> Result<String, RecipeError> {
  let matched = matching_addons(unit, addons)?;
  if matched.is_empty() {
    return Ok(String::new());
  }

  let mut out = String::new();
  for (dir, image) in &matched {
    let name = addon_name(dir);
    debug!(unit = %unit, addon = %name, "merging add-on fragments");

    out.push_str("\n# AddOn(s)\n");
    out.push_str(&format!("# {}\n", dir.display()));
    out.push_str(&format!("LABEL sas.recipe.addons.{name}=\"true\"\n"));

    for fragment in &image.dockerfiles {
      let path = dir.join(fragment);
      let content = std::fs::read_to_string(&path).map_err(|source| RecipeError::AddOnFragment { path, source })?;
      for line in kept_lines(&content, &name, deployment, rules) {
        out.push_str(&line);
        out.push('\n');
      }
    }
  }
  out.push_str("LABEL sas.recipe.addons=\"true\"\n");
  Ok(out)
}

/// Filter a fragment down to directive lines and their continuations.
fn kept_lines(content: &str, addon: &str, deployment: DeploymentType, rules: &[FragmentRule]) -> Vec<String> {
  let lines: Vec<&str> = content.lines().collect();
  let mut kept = Vec::new();
  let mut index = 0;

  while index < lines.len() {
    let line = lines[index].trim();
    index += 1;

    if line.is_empty() || !KEPT_DIRECTIVES.iter().any(|d| line.starts_with(d)) {
      continue;
    }

    let rewritten = rules.iter().find_map(|rule| rule.rewrite(addon, deployment, line));
    kept.push(rewritten.unwrap_or(line).to_string());

    if !line.ends_with('\\') {
      continue;
    }
    while index < lines.len() {
      let next = lines[index].trim_end();
      index += 1;
      kept.push(next.to_string());
      if !next.ends_with('\\') {
        break;
      }
    }
  }

  kept
}
