//! SELinux process and mount labels for new containers.
//!
//! Label options follow the `--security-opt label=...` syntax:
//!
//! - `disable` - no labels at all
//! - `user:<u>` / `role:<r>` / `type:<t>` - process label components
//! - `filetype:<t>` - mount label type
//! - `level:<l>` - MLS level for both labels
//!
//! Without a `level` option each container gets a random MCS category pair
//! so that containers cannot read each other's files.

use kiln_core::error::{KilnError, Result};
use rand::Rng;

const DEFAULT_USER: &str = "system_u";
const DEFAULT_PROCESS_ROLE: &str = "system_r";
const DEFAULT_PROCESS_TYPE: &str = "container_t";
const DEFAULT_FILE_ROLE: &str = "object_r";
const DEFAULT_FILE_TYPE: &str = "container_file_t";

/// Number of MCS categories to draw from.
const MCS_CATEGORIES: u32 = 1024;

/// Labels assigned to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityLabels {
    pub process_label: String,
    pub mount_label: String,
}

/// Compute the labels for a new container from its label options.
pub fn init_labels(label_opts: &[String]) -> Result<SecurityLabels> {
    let mut user = DEFAULT_USER.to_string();
    let mut role = DEFAULT_PROCESS_ROLE.to_string();
    let mut process_type = DEFAULT_PROCESS_TYPE.to_string();
    let mut file_type = DEFAULT_FILE_TYPE.to_string();
    let mut level: Option<String> = None;

    for opt in label_opts {
        if opt == "disable" {
            return Ok(SecurityLabels::default());
        }
        let (key, value) = opt.split_once(':').ok_or_else(|| {
            KilnError::ConfigError(format!("bad label option '{}': expected key:value", opt))
        })?;
        if value.is_empty() {
            return Err(KilnError::ConfigError(format!(
                "bad label option '{}': empty value",
                opt
            )));
        }
        match key {
            "user" => user = value.to_string(),
            "role" => role = value.to_string(),
            "type" => process_type = value.to_string(),
            "filetype" => file_type = value.to_string(),
            "level" => level = Some(value.to_string()),
            other => {
                return Err(KilnError::ConfigError(format!(
                    "bad label option '{}': unknown key '{}'",
                    opt, other
                )))
            }
        }
    }

    let level = level.unwrap_or_else(random_mcs_level);
    Ok(SecurityLabels {
        process_label: format!("{}:{}:{}:{}", user, role, process_type, level),
        mount_label: format!("{}:{}:{}:{}", user, DEFAULT_FILE_ROLE, file_type, level),
    })
}

fn random_mcs_level() -> String {
    let mut rng = rand::thread_rng();
    let first = rng.gen_range(0..MCS_CATEGORIES - 1);
    let second = rng.gen_range(first + 1..MCS_CATEGORIES);
    format!("s0:c{},c{}", first, second)
}
