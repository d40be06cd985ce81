/// Build-time override, else the crate version. An empty override counts as unset.
const fn version_or_cargo(build_override: Option<&'static str>) -> &'static str {
    match build_override {
        Some(version) if !version.is_empty() => version,
        _ => env!("CARGO_PKG_VERSION"),
    }
}

/// Reported by `--version` and in the startup log line.
pub const VERSION: &str = version_or_cargo(option_env!("BANDWIDTH_MONITOR_VERSION"));
