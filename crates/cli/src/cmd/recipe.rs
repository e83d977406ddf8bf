//! Implementation of the `rolebuild recipe` command.

use std::path::Path;

use anyhow::{Context, Result};

use rolebuild_lib::license::LicenseMaterial;
use rolebuild_lib::recipe::{self, RecipeInput};
use rolebuild_lib::unit::{BuildUnit, config};

use super::{SettingsArgs, load_document};

/// Print the recipe `unit` would be built from. License material is not loaded, so
/// license placeholders stay as configured.
pub fn cmd_recipe(unit: &str, args: &SettingsArgs) -> Result<()> {
  let settings = args.load(false)?;
  let document = load_document(&settings)?;

  let unit = BuildUnit::new(unit, "preview", &settings, Path::new("."));
  let unit_config = config::resolve(unit.name(), &document, &LicenseMaterial::default());
  let input = RecipeInput::new(&settings, unit.name(), unit.image_name(), &unit_config)?;
  let text = recipe::generate(&input).with_context(|| format!("Failed to generate recipe for {}", unit.name()))?;

  print!("{text}");
  Ok(())
}
