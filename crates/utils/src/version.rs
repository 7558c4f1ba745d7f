use std::sync::LazyLock;

/// Defines the application version.
///
/// Release builds set `GIT_SHA` in the build environment; local builds
/// fall back to a plain `-dev` suffix.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_SHA").unwrap_or("dev")
    )
});

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn version_starts_with_the_package_version() {
        let (package, suffix) = VERSION.split_once('-').expect("version suffix");
        assert_eq!(package, env!("CARGO_PKG_VERSION"));
        assert!(!suffix.is_empty());
    }
}
