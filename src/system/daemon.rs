//! Init-system daemon queries through `systemctl`.
use std::time::Duration;

use crate::error::DaemonError;
use crate::exec::Executor;

/// State of a service unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonInfo {
    /// Unit name as queried.
    pub name: String,
    /// `ActiveState=active`.
    pub active: bool,
    /// The unit starts without manual intervention.
    pub enabled: bool,
}

/// Unit file states that count as enabled.
const ENABLED_STATES: &[&str] = &["enabled", "enabled-runtime", "static", "alias"];

/// Query `name` with `systemctl show`, killing the query after `timeout`.
///
/// # Errors
///
/// - [`DaemonError::UnsupportedInit`] if `systemctl` is not on PATH
/// - [`DaemonError::Timeout`] if the query did not finish in time
/// - [`DaemonError::RequiresRoot`] if systemd refused the query
/// - [`DaemonError::DaemonNotFound`] if the unit is not loaded
/// - [`DaemonError::UnexpectedOutput`] if the properties are missing
/// - [`DaemonError::Exec`] for any other failure to run the query
pub fn query_daemon(
    executor: &dyn Executor,
    name: &str,
    timeout: Duration,
) -> Result<DaemonInfo, DaemonError> {
    if !executor.which("systemctl") {
        return Err(DaemonError::UnsupportedInit);
    }
    let result = executor
        .run_with_timeout(
            "systemctl",
            &[
                "show",
                name,
                "--property=ActiveState,UnitFileState,LoadState",
            ],
            timeout,
        )
        .map_err(|e| DaemonError::Exec(format!("{e:#}")))?
        .ok_or(DaemonError::Timeout {
            secs: timeout.as_secs(),
        })?;

    if !result.success {
        let stderr = result.stderr.trim();
        let lowered = stderr.to_lowercase();
        if lowered.contains("access denied")
            || lowered.contains("permission denied")
            || lowered.contains("authentication required")
        {
            return Err(DaemonError::RequiresRoot);
        }
        return Err(DaemonError::Exec(stderr.to_string()));
    }
    parse_show(name, &result.stdout)
}

/// Parse `Key=Value` lines printed by `systemctl show`.
fn parse_show(name: &str, stdout: &str) -> Result<DaemonInfo, DaemonError> {
    let mut load = None;
    let mut active = None;
    let mut unit_file = None;
    for line in stdout.lines() {
        match line.trim().split_once('=') {
            Some(("LoadState", v)) => load = Some(v),
            Some(("ActiveState", v)) => active = Some(v),
            Some(("UnitFileState", v)) => unit_file = Some(v),
            _ => {}
        }
    }

    if load == Some("not-found") {
        return Err(DaemonError::DaemonNotFound(name.to_string()));
    }
    let (Some(_), Some(active)) = (load, active) else {
        return Err(DaemonError::UnexpectedOutput(stdout.trim().to_string()));
    };
    Ok(DaemonInfo {
        name: name.to_string(),
        active: active == "active",
        enabled: unit_file.is_some_and(|state| ENABLED_STATES.contains(&state)),
    })
}
