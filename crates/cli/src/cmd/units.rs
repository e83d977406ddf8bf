//! Implementation of the `rolebuild units` command.
//!
//! Lists the inventory's units with their image names, selection state and resolved roles.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use rolebuild_lib::inventory::{apply_selection, load_inventory};
use rolebuild_lib::license::LicenseMaterial;
use rolebuild_lib::unit::{BuildUnit, config};

use super::{SettingsArgs, load_document};
use crate::output::{Mark, print_json, print_mark, print_stat};

#[derive(Debug, Serialize)]
struct UnitListing {
  name: String,
  image: String,
  selected: bool,
  roles: Vec<String>,
}

pub fn cmd_units(args: &SettingsArgs, json: bool) -> Result<()> {
  let settings = args.load(false)?;
  let names = load_inventory(&settings.inventory_file()).context("Failed to read inventory")?;
  let document = load_document(&settings)?;

  let tag = settings.tag.clone().unwrap_or_else(|| "latest".to_string());
  let mut units: Vec<BuildUnit> = names
    .iter()
    .map(|name| BuildUnit::new(name, &tag, &settings, Path::new(".")))
    .collect();
  let selected = apply_selection(&mut units, &settings.build_only).context("Invalid unit selection")?;

  let listings: Vec<UnitListing> = units
    .iter()
    .map(|unit| UnitListing {
      name: unit.name().to_string(),
      image: unit.image_name().to_string(),
      selected: unit.is_selected(),
      roles: config::resolve(unit.name(), &document, &LicenseMaterial::default()).roles,
    })
    .collect();

  if json {
    return print_json(&listings);
  }

  if listings.is_empty() {
    print_mark(Mark::Pending, "No units found in the inventory");
    return Ok(());
  }

  for listing in &listings {
    let mark = if listing.selected { Mark::Selected } else { Mark::Skipped };
    let marker = mark.render(Stream::Stdout);
    println!("{marker} {} ({})", listing.name, listing.image);
    println!(
      "    {}",
      listing.roles.join(" ").if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }
  println!();
  print_stat("Units", &listings.len().to_string());
  print_stat("Selected", &selected.to_string());
  Ok(())
}
