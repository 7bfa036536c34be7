//! Release registry lookup for `/health` and `/update`.

use anyhow::Context as _;
use serde::Deserialize;
use std::time::Duration;

/// Release feed queried for the newest published version.
const RELEASE_URL: &str = "https://api.github.com/repos/muxbot/muxbot/releases/latest";

/// Registry lookups must never stall a health reply.
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    tag_name: String,
}

/// Outcome of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    pub current: semver::Version,
    pub latest: semver::Version,
}

impl UpdateCheck {
    pub fn update_available(&self) -> bool {
        self.latest > self.current
    }
}

/// Compare the running version against the newest release.
pub async fn check_latest() -> anyhow::Result<UpdateCheck> {
    let current = semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .context("crate version is not valid semver")?;

    let client = reqwest::Client::builder()
        .timeout(LOOKUP_TIMEOUT)
        .user_agent(concat!("muxbot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build registry client")?;

    let release: ReleaseInfo = client
        .get(RELEASE_URL)
        .send()
        .await
        .context("release lookup failed")?
        .error_for_status()
        .context("release lookup returned an error status")?
        .json()
        .await
        .context("release feed returned unexpected JSON")?;

    let latest = parse_tag(&release.tag_name)
        .with_context(|| format!("unparseable release tag: {}", release.tag_name))?;

    Ok(UpdateCheck { current, latest })
}

fn parse_tag(tag: &str) -> Option<semver::Version> {
    semver::Version::parse(tag.trim().trim_start_matches('v')).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_with_and_without_prefix() {
        assert_eq!(
            parse_tag("v1.2.3"),
            Some(semver::Version::new(1, 2, 3))
        );
        assert_eq!(parse_tag("0.4.0"), Some(semver::Version::new(0, 4, 0)));
        assert!(parse_tag("nightly").is_none());
    }

    #[test]
    fn update_available_compares_semver() {
        let check = UpdateCheck {
            current: semver::Version::new(0, 4, 2),
            latest: semver::Version::new(0, 5, 0),
        };
        assert!(check.update_available());

        let check = UpdateCheck {
            current: semver::Version::new(0, 5, 0),
            latest: semver::Version::new(0, 5, 0),
        };
        assert!(!check.update_available());
    }
}
