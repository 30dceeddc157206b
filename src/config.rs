//! Execution environment assembly (§3 "Execution environment"): a sanitized
//! mapping from variable name to value, built from a whitelist filter over
//! the inherited environment plus an `/etc/rc.conf`-style config file.
//! Also carries the two config keys the Lifecycle Engine consults:
//! `rc_parallel` and `rc_depend_strict`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Environment variables passed through from the inherited environment
/// untouched, matching the set `runscript.c`'s `env_filter` allows.
const ENV_WHITELIST: &[&str] = &[
    "RC_SOFTLEVEL",
    "IN_BACKGROUND",
    "IN_HOTPLUG",
    "TERM",
    "PATH",
    "HOME",
    "RC_DEBUG",
];

/// Loaded runtime configuration: the merged child environment plus the two
/// behavioral keys the Lifecycle Engine reads.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub env: HashMap<String, String>,
    pub rc_parallel: bool,
    pub rc_depend_strict: bool,
}

impl Config {
    /// Builds the execution environment: whitelist-filtered inherited
    /// environment, overlaid with assignments from an optional
    /// `rc.conf`-style file at `config_path`.
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut env = HashMap::new();
        for key in ENV_WHITELIST {
            if let Ok(value) = std::env::var(key) {
                env.insert((*key).to_string(), value);
            }
        }

        let mut cfg = Config {
            env,
            rc_parallel: false,
            rc_depend_strict: false,
        };

        if let Some(path) = config_path {
            if let Ok(contents) = fs::read_to_string(path) {
                cfg.merge_file(&contents);
            }
        }

        cfg
    }

    fn merge_file(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "rc_parallel" => self.rc_parallel = is_truthy(value),
                "rc_depend_strict" => self.rc_depend_strict = is_truthy(value),
                _ => {
                    self.env.insert(key.to_string(), value.to_string());
                }
            }
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn merge_file_sets_behavioral_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rc.conf");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "rc_parallel=\"YES\"").unwrap();
        writeln!(f, "rc_depend_strict=no").unwrap();
        writeln!(f, "CUSTOM_VAR=hello").unwrap();

        let cfg = Config::load(Some(&path));
        assert!(cfg.rc_parallel);
        assert!(!cfg.rc_depend_strict);
        assert_eq!(cfg.env.get("CUSTOM_VAR"), Some(&"hello".to_string()));
    }

    #[test]
    fn load_without_file_still_whitelists_env() {
        unsafe {
            std::env::set_var("RC_SOFTLEVEL", "default");
        }
        let cfg = Config::load(None);
        assert_eq!(cfg.env.get("RC_SOFTLEVEL"), Some(&"default".to_string()));
        unsafe {
            std::env::remove_var("RC_SOFTLEVEL");
        }
    }
}
