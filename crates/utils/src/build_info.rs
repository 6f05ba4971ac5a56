/// Git metadata captured at build time by `vergen-git2`.
pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) fn build_info() -> BuildInfo {
    BuildInfo {
        commit_sha1: option_env!("VERGEN_GIT_SHA"),
        git_dirty: option_env!("VERGEN_GIT_DIRTY") == Some("true"),
    }
}
