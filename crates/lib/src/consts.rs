//! Shared constants for recipe generation, context assembly and image naming.

/// Version stamped into image tags and recipe labels.
pub const RECIPE_VERSION: &str = "19.06.3";

/// `chrono` format for the timestamp half of a generated tag.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Name of the recipe entry inside the build context.
pub const RECIPE_FILE: &str = "Dockerfile";

/// File names inside a unit's build directory.
pub const CONTEXT_ARCHIVE_FILE: &str = "build_context.tar";
pub const UNIT_LOG_FILE: &str = "log.txt";

/// Add-on manifest file name, looked up at the root of every add-on directory.
pub const ADDON_MANIFEST_FILE: &str = "addon_config.yml";

/// Run-as user when a unit does not configure one.
pub const DEFAULT_USER: &str = "sas";

/// Volume appended to every unit.
pub const LOG_VOLUME: &str = "log=/opt/sas/viya/config/var/log";

/// Roles injected ahead of the unit's own role when none are configured.
pub const BOOTSTRAP_ROLES: &[&str] = &[
  "ansible",
  "tini",
  "sas-prerequisites",
  "sas-install-base-packages",
  "sas-java",
];

/// Role injected after the unit's own role when none are configured.
pub const CLEANUP_ROLE: &str = "cloud-config";

pub const DEFAULT_LIMITS: &[&str] = &["memory=10Gi"];
pub const DEFAULT_REQUESTS: &[&str] = &["memory=2Gi"];

/// Role subtrees copied into every context regardless of the unit's role list.
pub const AUXILIARY_ROLES: &[&str] = &["casserver-config", "cloud-config", "sas-install"];

/// Role that never receives the default task file when synthesized.
pub const TASKLESS_ROLE: &str = "ansible";

/// Path components stripped from static role paths before they land in the archive.
pub const WRAPPER_COMPONENTS: &[&str] = &["internal"];

/// Substrings that exclude a file from every directory copy.
pub const EXCLUDED_PATH_MARKERS: &[&str] = &["Dockerfile", ADDON_MANIFEST_FILE];

/// Hostname the build containers use to reach the machine driving the build.
pub const BUILDER_HOST: &str = "sas-container-recipes-builder";

/// Inventory section that lists the hosts to build.
pub const INVENTORY_SECTION: &str = "[sas-all:children]";

/// Inventory entries that are groupings rather than buildable hosts.
pub const INVENTORY_IGNORED: &[&str] = &[
  "all",
  "sas-all",
  "CommandLine",
  "sas-casserver-secondary",
  "sas-casserver-worker",
];
