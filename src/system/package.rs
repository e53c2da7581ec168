//! Installed package queries through `pacman -Qi`.
use crate::error::RuleError;
use crate::exec::Executor;

/// Metadata of an installed package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    /// Package name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// One-line description.
    pub description: String,
    /// Target architecture.
    pub architecture: String,
    /// Upstream URL.
    pub url: String,
    /// Licenses.
    pub licenses: Vec<String>,
    /// Package groups.
    pub groups: Vec<String>,
    /// Virtual packages provided.
    pub provides: Vec<String>,
    /// Hard dependencies.
    pub depends_on: Vec<String>,
    /// Optional dependencies, with their descriptions.
    pub optional_deps: Vec<String>,
    /// Packages depending on this one.
    pub required_by: Vec<String>,
    /// Packages optionally depending on this one.
    pub optional_for: Vec<String>,
    /// Conflicting packages.
    pub conflicts_with: Vec<String>,
    /// Packages this one replaces.
    pub replaces: Vec<String>,
    /// Installed size as printed, e.g. `929.37 KiB`.
    pub installed_size: String,
    /// Packager.
    pub packager: String,
    /// Build date as printed.
    pub build_date: String,
    /// Install date as printed.
    pub install_date: String,
    /// Whether installed explicitly or as a dependency.
    pub install_reason: String,
    /// Whether the package ships an install script.
    pub install_script: bool,
    /// Signature validation method.
    pub validated_by: String,
    /// Labels this parser does not know, in order of appearance.
    pub ignored_fields: Vec<String>,
}

/// Query the local package database for `name`.
///
/// Returns `Ok(None)` when the package is not installed.
///
/// # Errors
///
/// Returns [`RuleError::CommandFailed`] if `pacman` cannot be run.
pub fn query_package(executor: &dyn Executor, name: &str) -> Result<Option<PackageInfo>, RuleError> {
    let failed = |message: String| RuleError::CommandFailed {
        command: format!("pacman -Qi {name}"),
        message,
    };
    if !executor.which("pacman") {
        return Err(failed("pacman not found on PATH".to_string()));
    }
    let result = executor
        .run_unchecked("pacman", &["-Qi", name])
        .map_err(|e| failed(format!("{e:#}")))?;
    if !result.success {
        if result.stderr.contains("was not found") {
            return Ok(None);
        }
        return Err(failed(result.stderr.trim().to_string()));
    }
    Ok(Some(parse_info(&result.stdout)))
}

/// Split a list value; pacman prints `None` for an empty list.
fn list(value: &str) -> Vec<String> {
    if value == "None" {
        return Vec::new();
    }
    value.split_whitespace().map(str::to_string).collect()
}

/// Parse `Label : value` lines. Continuation lines (leading whitespace)
/// belong to the previous label, which pacman uses for optional deps.
fn parse_info(stdout: &str) -> PackageInfo {
    let mut info = PackageInfo::default();
    let mut last_label = String::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if last_label == "Optional Deps" {
                info.optional_deps.push(line.trim().to_string());
            }
            continue;
        }
        let Some((label, value)) = line.split_once(" : ").or_else(|| line.split_once(':')) else {
            continue;
        };
        let label = label.trim();
        let value = value.trim();
        match label {
            "Name" => info.name = value.to_string(),
            "Version" => info.version = value.to_string(),
            "Description" => info.description = value.to_string(),
            "Architecture" => info.architecture = value.to_string(),
            "URL" => info.url = value.to_string(),
            "Licenses" => info.licenses = list(value),
            "Groups" => info.groups = list(value),
            "Provides" => info.provides = list(value),
            "Depends On" => info.depends_on = list(value),
            "Optional Deps" => {
                if value != "None" {
                    info.optional_deps.push(value.to_string());
                }
            }
            "Required By" => info.required_by = list(value),
            "Optional For" => info.optional_for = list(value),
            "Conflicts With" => info.conflicts_with = list(value),
            "Replaces" => info.replaces = list(value),
            "Installed Size" => info.installed_size = value.to_string(),
            "Packager" => info.packager = value.to_string(),
            "Build Date" => info.build_date = value.to_string(),
            "Install Date" => info.install_date = value.to_string(),
            "Install Reason" => info.install_reason = value.to_string(),
            "Install Script" => info.install_script = value == "Yes",
            "Validated By" => info.validated_by = value.to_string(),
            other => info.ignored_fields.push(other.to_string()),
        }
        label.clone_into(&mut last_label);
    }
    info
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::system::test_helpers::MockExecutor;

    const DBUS: &str = "\
Name            : dbus
Version         : 1.14.10-1
Description     : Freedesktop.org message bus system
Architecture    : x86_64
URL             : https://www.freedesktop.org/wiki/Software/dbus/
Licenses        : GPL  custom
Groups          : None
Provides        : libdbus  libdbus-1.so=3-64
Depends On      : audit  expat  systemd-libs
Optional Deps   : dbus-docs: documentation
                  dbus-x11: X11 support
Required By     : avahi  bluez
Optional For    : None
Conflicts With  : libdbus
Replaces        : libdbus
Installed Size  : 929.37 KiB
Packager        : Someone <someone@archlinux.org>
Build Date      : Sat 02 Sep 2023 10:00:00 AM UTC
Install Date    : Mon 04 Sep 2023 08:00:00 AM UTC
Install Reason  : Installed as a dependency for another package
Install Script  : No
Validated By    : Signature
Extra Field     : surprise

";

    #[test]
    fn parses_known_fields() {
        let exec = MockExecutor::ok(DBUS);
        let info = query_package(&exec, "dbus").unwrap().unwrap();
        assert_eq!(info.name, "dbus");
        assert_eq!(info.version, "1.14.10-1");
        assert_eq!(info.licenses, ["GPL", "custom"]);
        assert!(info.groups.is_empty());
        assert_eq!(info.depends_on, ["audit", "expat", "systemd-libs"]);
        assert_eq!(
            info.optional_deps,
            ["dbus-docs: documentation", "dbus-x11: X11 support"]
        );
        assert_eq!(info.required_by, ["avahi", "bluez"]);
        assert!(!info.install_script);
        assert_eq!(info.installed_size, "929.37 KiB");
        assert_eq!(exec.calls(), ["pacman -Qi dbus"]);
    }

    #[test]
    fn unknown_labels_are_collected() {
        let info = parse_info(DBUS);
        assert_eq!(info.ignored_fields, ["Extra Field"]);
    }

    #[test]
    fn missing_package_is_none() {
        let exec = MockExecutor::fail("error: package 'nope' was not found");
        assert!(query_package(&exec, "nope").unwrap().is_none());
    }

    #[test]
    fn other_failures_are_errors() {
        let exec = MockExecutor::fail("error: could not open database");
        assert!(matches!(
            query_package(&exec, "dbus"),
            Err(RuleError::CommandFailed { .. })
        ));
    }

    #[test]
    fn no_pacman_is_an_error() {
        let exec = MockExecutor::ok("").with_which(false);
        assert!(query_package(&exec, "dbus").is_err());
    }
}
