//! Release string parsing: `package@version+build`.

use crate::patterns::RE_NUMERIC_BUILD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseParts {
    pub package: String,
    pub version: String,
    pub build: String,
}

impl ReleaseParts {
    /// The build, if it is purely numeric (usable as a distribution).
    pub fn numeric_build(&self) -> Option<&str> {
        RE_NUMERIC_BUILD
            .is_match(&self.build)
            .then_some(self.build.as_str())
    }
}

/// Splits a release into package, version and build.
///
/// Both separators are required; `"com.example@1.2.3"` is not a parse.
pub fn parse_release(release: &str) -> Option<ReleaseParts> {
    let (package, rest) = release.split_once('@')?;
    let (version, build) = rest.split_once('+')?;
    if package.is_empty() || version.is_empty() || build.is_empty() {
        return None;
    }
    Some(ReleaseParts {
        package: package.to_string(),
        version: version.to_string(),
        build: build.to_string(),
    })
}
