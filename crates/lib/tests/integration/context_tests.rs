use std::fs::File;
use std::io::Read;
use std::path::Path;

use rolebuild_lib::context::ContextAssembler;
use rolebuild_lib::execute::CancelSignal;
use rolebuild_lib::license::LicenseMaterial;
use rolebuild_lib::recipe::{self, RecipeInput};
use rolebuild_lib::unit::{BuildUnit, config};

use super::common::TestEnv;

fn entries(path: &Path) -> Vec<(String, u32, Vec<u8>)> {
  let mut archive = tar::Archive::new(File::open(path).unwrap());
  archive
    .entries()
    .unwrap()
    .map(|e| {
      let mut e = e.unwrap();
      let name = e.path().unwrap().to_string_lossy().into_owned();
      let mode = e.header().mode().unwrap();
      let mut data = Vec::new();
      e.read_to_end(&mut data).unwrap();
      (name, mode, data)
    })
    .collect()
}

#[test]
fn same_inputs_produce_the_same_archive() {
  let env = TestEnv::with_hosts(&["consul"]);
  env.write_file("addons/auth-demo/Dockerfile", "FROM x\nRUN echo demo\n");
  env.write_file("addons/auth-demo/demo.sh", "#!/bin/sh\n");
  env.write_file(
    "addons/auth-demo/addon_config.yml",
    "consul:\n  dockerfiles:\n    - Dockerfile\n",
  );

  let mut settings = env.settings(1);
  settings.addons = vec![env.root().join("addons/auth-demo")];
  let document = env.document();
  let license = LicenseMaterial::default();
  let assembler = ContextAssembler::new(&settings, &document, &license);

  let mut sealed = Vec::new();
  for run in ["run-a", "run-b"] {
    let mut unit = BuildUnit::new("consul", "it", &settings, &env.root().join(run));
    assembler.assemble(&mut unit, &CancelSignal::new()).unwrap();
    sealed.push(unit.context.unwrap());
  }

  let (a, b) = (entries(&sealed[0].path), entries(&sealed[1].path));
  assert_eq!(a, b);
  assert_eq!(sealed[0].digest, sealed[1].digest);
  assert!(a.iter().all(|(_, mode, _)| *mode == 0o777));
  assert!(a.iter().any(|(name, _, _)| name == "demo.sh"));
  assert!(!a.iter().any(|(name, _, _)| name == "addon_config.yml"));
}

#[test]
fn recipe_generation_is_idempotent() {
  let env = TestEnv::with_hosts(&["consul"]);
  let settings = env.settings(1);
  let unit_config = config::resolve("consul", &env.document(), &LicenseMaterial::default());
  let input = RecipeInput::new(&settings, "consul", "sas-viya-consul", &unit_config).unwrap();

  let first = recipe::generate(&input).unwrap();
  let second = recipe::generate(&input).unwrap();
  assert_eq!(first, second);
  assert!(first.contains("\nFROM centos:7\n"));
  assert!(first.contains("EXPOSE 8500"));
  assert!(first.contains("VOLUME /opt/sas/viya/config/var/log"));
}
