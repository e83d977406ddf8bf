//! Build context assembly.
//!
//! The assembler packages everything a unit's recipe refers to into a single tar
//! archive, in a fixed order:
//!
//! 1. build directory, archive and log are opened
//! 2. the unit configuration is resolved
//! 3. root playbook and variables files
//! 4. the whole static role tree under `roles/`
//! 5. every role the unit lists under `dynamicRoles/`
//! 6. add-on files
//! 7. auxiliary roles
//! 8. `ansible.cfg` and finally the generated `Dockerfile`
//!
//! Directories are walked in sorted order, so identical inputs yield identical entry
//! sequences and payloads.

mod archive;

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::{
  AUXILIARY_ROLES, CONTEXT_ARCHIVE_FILE, EXCLUDED_PATH_MARKERS, RECIPE_FILE, TASKLESS_ROLE, WRAPPER_COMPONENTS,
};
use crate::execute::CancelSignal;
use crate::license::LicenseMaterial;
use crate::recipe::{self, RecipeError, RecipeInput};
use crate::settings::Settings;
use crate::unit::{BuildUnit, ConfigDocument, config};

pub use archive::{ContextArchive, SealedContext};

#[derive(Debug, Error)]
pub enum ContextError {
  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("required source {path} is unavailable: {message}")]
  MissingSource { path: PathBuf, message: String },

  #[error("failed to walk {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error("unable to create dynamic role {role} for {unit}: no variables file in {dir}")]
  DynamicRole { unit: String, role: String, dir: PathBuf },

  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error("context assembly cancelled")]
  Cancelled,
}

/// Assembles build contexts for units of one run.
pub struct ContextAssembler<'a> {
  settings: &'a Settings,
  document: &'a ConfigDocument,
  license: &'a LicenseMaterial,
  static_roles: PathBuf,
  strip: Vec<String>,
}

impl<'a> ContextAssembler<'a> {
  pub fn new(settings: &'a Settings, document: &'a ConfigDocument, license: &'a LicenseMaterial) -> Self {
    let mut strip: Vec<String> = WRAPPER_COMPONENTS.iter().map(|s| s.to_string()).collect();
    if let Some(name) = settings.paths.playbook_dir.file_name() {
      strip.push(name.to_string_lossy().into_owned());
    }

    Self {
      settings,
      document,
      license,
      static_roles: settings.static_roles_dir(),
      strip,
    }
  }

  /// Assemble and seal the context for `unit`, storing its configuration, recipe and sealed
  /// archive on the unit.
  ///
  /// Blocking: run it on the blocking pool. `cancel` is checked between steps.
  pub fn assemble(&self, unit: &mut BuildUnit, cancel: &CancelSignal) -> Result<(), ContextError> {
    let name = unit.name().to_string();
    info!(unit = %name, dir = ?unit.build_dir, "assembling build context");

    // 1. build directory, archive and log; both handles drop on every exit path
    std::fs::create_dir_all(&unit.build_dir).map_err(|source| ContextError::Io {
      path: unit.build_dir.clone(),
      source,
    })?;
    let log_file = unit.log();
    let io_err = |source| ContextError::Io {
      path: log_file.path().to_path_buf(),
      source,
    };
    std::fs::write(log_file.path(), b"").map_err(io_err)?;
    let mut log = log_file.writer().map_err(io_err)?;
    let mut archive = ContextArchive::create(&unit.build_dir.join(CONTEXT_ARCHIVE_FILE))?;

    // 2. configuration
    unit.config = config::resolve(&name, self.document, self.license);
    log.line(&format!("roles: {}", unit.config.roles.join(", "))).map_err(io_err)?;
    checkpoint(cancel)?;

    // 3. root files
    self.add_root_files(&mut archive)?;
    checkpoint(cancel)?;

    // 4. static role tree
    self.add_static_roles(&mut archive)?;
    checkpoint(cancel)?;

    // 5. the unit's own role list
    for role in &unit.config.roles {
      self.add_dynamic_role(&mut archive, &name, role)?;
    }
    let extravars = format!("ANSIBLE_CONTAINER: true\nPROJECT_NAME: \"{}\"\n", self.settings.project_name);
    archive.add_bytes("extravars.yml", extravars.as_bytes())?;
    checkpoint(cancel)?;

    // 6. add-ons
    for (dir, _) in recipe::addon::matching_addons(&name, &self.settings.addons)? {
      let added = self.copy_tree(&mut archive, &dir, "", &[])?;
      log
        .line(&format!("includes add-on {} ({added} files)", dir.display()))
        .map_err(io_err)?;
    }
    checkpoint(cancel)?;

    // 7. auxiliary roles
    for role in AUXILIARY_ROLES {
      let dir = self.static_roles.join(role);
      if dir.is_dir() {
        self.copy_tree(&mut archive, &dir, &format!("roles/{role}/"), &self.strip)?;
      }
    }
    checkpoint(cancel)?;

    // 8. ansible.cfg, then the recipe as the final entry
    archive.add_optional_file(&self.util("ansible.cfg"), "ansible.cfg")?;
    let input = RecipeInput::new(self.settings, &name, unit.image_name(), &unit.config)?;
    let recipe_text = recipe::generate(&input)?;
    archive.add_bytes(RECIPE_FILE, recipe_text.as_bytes())?;

    let sealed = archive.seal()?;
    log
      .line(&format!("context sealed: {} entries, digest {}", sealed.entries, sealed.digest))
      .map_err(io_err)?;
    log.flush().map_err(io_err)?;

    info!(unit = %name, entries = sealed.entries, digest = %sealed.digest, "build context sealed");
    unit.recipe = Some(recipe_text);
    unit.context = Some(sealed);
    Ok(())
  }

  fn util(&self, file: &str) -> PathBuf {
    self.settings.paths.util_dir.join(file)
  }

  fn playbook(&self, rel: &str) -> PathBuf {
    self.settings.paths.playbook_dir.join(rel)
  }

  fn add_root_files(&self, archive: &mut ContextArchive) -> Result<(), ContextError> {
    archive.add_file(&self.util("playbook.yml"), "playbook.yml")?;
    archive.add_optional_file(&self.playbook("vars.yml"), "vars.yml")?;
    archive.add_optional_file(&self.playbook("group_vars/all"), "all.yml")?;
    let soe_defaults = self.playbook("internal/soe_defaults.yml");
    archive.add_optional_file(&soe_defaults, "soe_defaults.yml")?;
    archive.add_optional_file(&soe_defaults, "roles/sas-install/vars/soe_defaults.yml")?;
    Ok(())
  }

  fn add_static_roles(&self, archive: &mut ContextArchive) -> Result<(), ContextError> {
    for role in self.static_role_names()? {
      let dir = self.static_roles.join(&role);
      self.copy_tree(archive, &dir, &format!("roles/{role}/"), &self.strip)?;
      self.add_role_extras(archive, &role, &dir, "roles")?;
    }
    Ok(())
  }

  /// Default entrypoint when the role has none, plus its `group_vars` file if the playbook has one.
  fn add_role_extras(
    &self,
    archive: &mut ContextArchive,
    role: &str,
    dir: &Path,
    prefix: &str,
  ) -> Result<(), ContextError> {
    if !dir.join("templates/entrypoint").is_file() {
      archive.add_file(&self.util("entrypoint"), &format!("{prefix}/{role}/templates/entrypoint"))?;
    }
    archive.add_optional_file(
      &self.playbook(&format!("group_vars/{role}")),
      &format!("{prefix}/{role}/vars/{role}"),
    )?;
    Ok(())
  }

  fn add_dynamic_role(&self, archive: &mut ContextArchive, unit: &str, role: &str) -> Result<(), ContextError> {
    let static_dir = self.static_roles.join(role);
    if static_dir.is_dir() {
      debug!(unit = %unit, role = %role, "dynamic role from static source");
      self.copy_tree(archive, &static_dir, &format!("dynamicRoles/{role}/"), &self.strip)?;
      return self.add_role_extras(archive, role, &static_dir, "dynamicRoles");
    }

    debug!(unit = %unit, role = %role, "synthesizing dynamic role");
    archive.add_file(&self.util("entrypoint"), &format!("dynamicRoles/{role}/templates/entrypoint"))?;

    let group_vars = self.playbook("group_vars");
    let vars = find_case_insensitive(&group_vars, unit).ok_or_else(|| ContextError::DynamicRole {
      unit: unit.to_string(),
      role: role.to_string(),
      dir: group_vars.clone(),
    })?;
    archive.add_file(&vars, &format!("dynamicRoles/{role}/vars/{role}"))?;

    if role != TASKLESS_ROLE {
      archive.add_file(&self.util("task.yml"), &format!("dynamicRoles/{role}/tasks/main.yml"))?;
    }
    Ok(())
  }

  fn static_role_names(&self) -> Result<Vec<String>, ContextError> {
    let entries = std::fs::read_dir(&self.static_roles).map_err(|e| ContextError::MissingSource {
      path: self.static_roles.clone(),
      message: e.to_string(),
    })?;

    let mut names = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|source| ContextError::Io {
        path: self.static_roles.clone(),
        source,
      })?;
      if entry.path().is_dir() {
        names.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
    names.sort();
    Ok(names)
  }

  /// Copy every file under `src` to `prefix` + its relative path, minus `strip` components.
  fn copy_tree(
    &self,
    archive: &mut ContextArchive,
    src: &Path,
    prefix: &str,
    strip: &[String],
  ) -> Result<usize, ContextError> {
    let mut added = 0;
    for entry in WalkDir::new(src).follow_links(true).sort_by_file_name() {
      let entry = entry.map_err(|e| ContextError::Walk {
        path: src.to_path_buf(),
        message: e.to_string(),
      })?;
      if !entry.file_type().is_file() {
        continue;
      }

      let path = entry.path();
      let shown = path.to_string_lossy();
      if EXCLUDED_PATH_MARKERS.iter().any(|m| shown.contains(m)) {
        debug!(path = %shown, "excluding file from context");
        continue;
      }

      let rel = path.strip_prefix(src).unwrap_or(path);
      let name = format!("{prefix}{}", internal_path(rel, strip));
      if archive.add_file(path, &name)? {
        added += 1;
      }
    }
    Ok(added)
  }
}

fn checkpoint(cancel: &CancelSignal) -> Result<(), ContextError> {
  if cancel.is_cancelled() {
    Err(ContextError::Cancelled)
  } else {
    Ok(())
  }
}

/// Join the normal components of `rel` with `/`, dropping any listed in `strip`.
fn internal_path(rel: &Path, strip: &[String]) -> String {
  rel
    .components()
    .filter_map(|c| match c {
      Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
      _ => None,
    })
    .filter(|part| !strip.contains(part))
    .collect::<Vec<_>>()
    .join("/")
}

/// First file in `dir` (sorted by name) whose name equals `name` ignoring case.
fn find_case_insensitive(dir: &Path, name: &str) -> Option<PathBuf> {
  let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
    .ok()?
    .filter_map(Result::ok)
    .filter(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(name))
    .map(|e| e.path())
    .filter(|p| p.is_file())
    .collect();
  matches.sort();
  matches.into_iter().next()
}
