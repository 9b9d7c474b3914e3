//! `shoal-worker version`: build details embedded by build.rs

use std::fmt;

use crate::protocol::PROTOCOL_VERSION;

/// What the binary reports about itself
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short commit hash, "unknown" outside a git checkout
    pub git_hash: &'static str,
    pub built_at: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
}

pub const BUILD: BuildInfo = BuildInfo {
    name: env!("CARGO_PKG_NAME"),
    version: env!("CARGO_PKG_VERSION"),
    git_hash: env!("SHOAL_GIT_HASH"),
    built_at: env!("SHOAL_BUILD_TIMESTAMP"),
    target: env!("SHOAL_TARGET"),
    profile: env!("SHOAL_PROFILE"),
};

impl BuildInfo {
    /// "0.1.0+abc1234"
    pub fn full_version(&self) -> String {
        format!("{}+{}", self.version, self.git_hash)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.version)?;
        writeln!(f, "  Protocol:   {}", PROTOCOL_VERSION)?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Git Hash:   {}", self.git_hash)?;
        writeln!(f, "  Built:      {}", self.built_at)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Profile:    {}", self.profile)
    }
}

pub fn print_version() {
    print!("{}", BUILD);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_carries_hash() {
        assert_eq!(
            BUILD.full_version(),
            format!("{}+{}", BUILD.version, BUILD.git_hash)
        );
    }

    #[test]
    fn test_display_lists_protocol_and_build() {
        let display = BUILD.to_string();

        assert!(display.starts_with("shoal-worker "));
        assert!(display.contains(&format!("Protocol:   {}", PROTOCOL_VERSION)));
        assert!(display.contains("Git Hash:"));
        assert!(display.contains("Target:"));
    }
}
