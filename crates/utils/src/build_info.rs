/// Git metadata captured at build time. Fields are `None` when the crate is
/// built outside of a git checkout.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: Option<&'static str>,
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY"),
};

impl BuildInfo {
    pub fn is_dirty(&self) -> bool {
        self.git_dirty == Some("true")
    }
}
