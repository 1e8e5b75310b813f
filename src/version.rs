//! Version information and the update-notice opt-out.

use mockable::Env;

/// The crate version baked in at build time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable that disables the update notice.
pub const SKIP_UPDATE_CHECK_VAR: &str = "TOMATO_SKIP_UPDATE_CHECK";

/// Whether the run should mention checking for updates.
///
/// Any non-empty value in `TOMATO_SKIP_UPDATE_CHECK` disables the notice;
/// the updater itself lives outside the engine.
pub fn update_notice_enabled<E: Env>(env: &E) -> bool {
    env.string(SKIP_UPDATE_CHECK_VAR)
        .is_none_or(|value| value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockable::MockEnv;
    use rstest::rstest;

    #[rstest]
    #[case(None, true)]
    #[case(Some(""), true)]
    #[case(Some("1"), false)]
    #[case(Some("true"), false)]
    fn notice_follows_the_environment(#[case] value: Option<&'static str>, #[case] enabled: bool) {
        let mut env = MockEnv::new();
        env.expect_string()
            .returning(move |_| value.map(String::from));
        assert_eq!(update_notice_enabled(&env), enabled);
    }

    #[rstest]
    fn version_is_populated() {
        assert!(!VERSION.is_empty());
    }
}
