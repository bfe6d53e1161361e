use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        short_sha(BUILD_INFO.commit_sha1.unwrap_or("unknown")),
        if BUILD_INFO.is_dirty() { "-dirty" } else { "" }
    )
});

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
