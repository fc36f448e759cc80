/// Returns the short display name for a host: its first DNS label.
///
/// Status messages shown to users reference hosts by this name so internal
/// domain suffixes stay out of the UI.
pub fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}
