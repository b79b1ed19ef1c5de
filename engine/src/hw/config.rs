use std::path::PathBuf;

pub const HW_PROFILE_ENV: &str = "ISOBRIDGE_HW_PROFILE";
pub const SETTINGS_PATH_ENV: &str = "ISOBRIDGE_SETTINGS";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Settings file named by `ISOBRIDGE_SETTINGS`, if set and non-empty.
pub fn settings_path() -> Option<PathBuf> {
    std::env::var_os(SETTINGS_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
