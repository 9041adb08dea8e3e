//! Environment-layered configuration. `ConfigureSmelt` as sent by a client is authoritative; any
//! field a client left at its zero value is filled in from the environment before the controller
//! acts on it.

use smelt_proto::{configure_smelt, CfgDocker, ConfigureSmelt};

const SMELT_ROOT: &str = "SMELT_ROOT";
const SMELT_JOB_SLOTS: &str = "SMELT_JOB_SLOTS";
const SMELT_DOCKER_IMAGE: &str = "SMELT_DOCKER_IMAGE";
const SMELT_TEST_ONLY: &str = "SMELT_TEST_ONLY";
const SMELT_SILENT: &str = "SMELT_SILENT";

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Layers `SMELT_ROOT`/`SMELT_JOB_SLOTS`/`SMELT_DOCKER_IMAGE`/`SMELT_TEST_ONLY`/`SMELT_SILENT`
/// under whatever `overrides` already specifies. Explicit client fields always win.
pub fn from_env(mut overrides: ConfigureSmelt) -> ConfigureSmelt {
    if overrides.smelt_root.is_empty() {
        if let Ok(root) = std::env::var(SMELT_ROOT) {
            overrides.smelt_root = root;
        }
    }

    if overrides.job_slots == 0 {
        if let Ok(slots) = std::env::var(SMELT_JOB_SLOTS) {
            if let Ok(n) = slots.parse() {
                overrides.job_slots = n;
            }
        }
    }

    if !overrides.test_only {
        if let Some(v) = env_bool(SMELT_TEST_ONLY) {
            overrides.test_only = v;
        }
    }

    if !overrides.silent {
        if let Some(v) = env_bool(SMELT_SILENT) {
            overrides.silent = v;
        }
    }

    if overrides.init_executor.is_none() {
        if let Ok(image) = std::env::var(SMELT_DOCKER_IMAGE) {
            overrides.init_executor = Some(configure_smelt::InitExecutor::Docker(CfgDocker {
                image_name: image,
                additional_mounts: Default::default(),
                ulimits: Vec::new(),
                mac_address: String::new(),
            }));
        }
    }

    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests touch process-global env vars, so they must not run concurrently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn explicit_fields_are_never_overridden_by_the_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(SMELT_JOB_SLOTS, "8");
        let cfg = ConfigureSmelt { job_slots: 2, ..Default::default() };
        let resolved = from_env(cfg);
        assert_eq!(resolved.job_slots, 2);
        std::env::remove_var(SMELT_JOB_SLOTS);
    }

    #[test]
    fn zero_valued_fields_fall_back_to_the_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(SMELT_JOB_SLOTS, "6");
        let resolved = from_env(ConfigureSmelt::default());
        assert_eq!(resolved.job_slots, 6);
        std::env::remove_var(SMELT_JOB_SLOTS);
    }
}
