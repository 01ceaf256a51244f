pub(crate) const RELEASE_VERSION: &str = match option_env!("FARMHAND_GIT_TAG") {
    Some(value) => value,
    None => env!("CARGO_PKG_VERSION"),
};

pub(crate) const GIT_COMMIT: Option<&str> = option_env!("FARMHAND_GIT_COMMIT");

pub(crate) fn release_version() -> &'static str {
    RELEASE_VERSION
}

pub(crate) fn ui_display_version() -> String {
    let version = format_ui_version(release_version());
    match GIT_COMMIT {
        Some(commit) if !release_version().contains(commit) => format!("{version} ({commit})"),
        _ => version,
    }
}

fn format_ui_version(version: &str) -> String {
    if version.starts_with('v') || version.starts_with('V') {
        return version.to_string();
    }

    if version.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        format!("v{version}")
    } else {
        version.to_string()
    }
}
