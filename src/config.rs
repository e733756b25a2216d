//! Configuration for the cbmfs server
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::error::Error;

/// DOS bug-compatibility switches for the disk-image back-end.
///
/// All default to true: a mounted image behaves like the real DOS,
/// bugs included.  They can be switched off through the settings keys
/// `bug-file254`, `bug-new-rel-size` and `bug-new-side-sector`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DosBugs {
    /// allocate a bogus block when a written file ends exactly on a
    /// 254-byte sector boundary (not on 8050/8250 geometries)
    pub file254: bool,
    /// record a block count of 0 in the slot of a freshly created REL
    /// file
    pub new_rel_size: bool,
    /// leak a data block when a REL file ends within the first data
    /// block of a new side sector
    pub new_side_sector: bool,
}

impl Default for DosBugs {
    fn default() -> Self {
        // strict DOS compatible
        DosBugs {
            file254: true,
            new_rel_size: true,
            new_side_sector: true,
        }
    }
}

/// Configuration format
pub struct Config {
    /// Version of the configuration root
    pub version: String,

    /// The general settings
    pub settings: config::Config,

    /// 1581-style advanced wildcard matching
    pub advanced_wildcards: bool,

    /// DOS bug emulation switches for mounted images
    pub dos_bugs: DosBugs,
}

/// Trait that defines a set of methods that allow loading and
/// unloading configuration data
pub trait Configuration {
    /// Load the configuration data from a settings object
    fn load(settings: config::Config) -> std::result::Result<Config, Error>;
}

impl Configuration for Config {
    fn load(settings: config::Config) -> std::result::Result<Config, Error> {
        let advanced_wildcards = settings.get_bool("advanced-wildcards").unwrap_or(false);

        let defaults = DosBugs::default();
        let dos_bugs = DosBugs {
            file254: settings.get_bool("bug-file254").unwrap_or(defaults.file254),
            new_rel_size: settings
                .get_bool("bug-new-rel-size")
                .unwrap_or(defaults.new_rel_size),
            new_side_sector: settings
                .get_bool("bug-new-side-sector")
                .unwrap_or(defaults.new_side_sector),
        };

        let config = Config {
            version: String::from("0.1.0"),
            settings,
            advanced_wildcards,
            dos_bugs,
        };

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::load(config::Config::default())
            .unwrap_or_else(|e| panic!("error loading default config: {}", e))
    }
}

impl Config {
    /// Build a config with explicit switches, used by tests and the
    /// runtime `*=+` / `*=-` toggles.
    pub fn with_flags(advanced_wildcards: bool, dos_bugs: DosBugs) -> Config {
        let mut c = Config::default();
        c.advanced_wildcards = advanced_wildcards;
        c.dos_bugs = dos_bugs;
        c
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Configuration, DosBugs};

    #[test]
    fn defaults_are_strict_dos() {
        let c = Config::default();
        assert!(!c.advanced_wildcards);
        assert_eq!(c.dos_bugs, DosBugs::default());
        assert!(c.dos_bugs.file254);
    }

    #[test]
    fn settings_override_the_bug_switches() {
        let settings = config::Config::builder()
            .set_override("bug-file254", false)
            .unwrap()
            .set_override("advanced-wildcards", true)
            .unwrap()
            .build()
            .unwrap();
        let c = Config::load(settings).unwrap();
        assert!(!c.dos_bugs.file254);
        assert!(c.dos_bugs.new_rel_size);
        assert!(c.advanced_wildcards);
    }
}
