//! Normalized upstream identity used as the [`crate::hub::StreamHub`]'s
//! registry key.

use std::fmt;

/// A normalized identity for an upstream RTSP source.
///
/// Two requests whose `rtspUrl` differ only in scheme/host case MUST share
/// one [`crate::stream::Stream`]; path and query are preserved verbatim
/// since RTSP servers may treat them case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    /// Normalize a raw `rtspUrl` query parameter into a fingerprint.
    ///
    /// Lowercases scheme and host; leaves path and query untouched. Falls
    /// back to lowercasing the whole string if it doesn't parse as a URL —
    /// callers that need a well-formed URI should validate separately
    /// (the Front Door does).
    pub fn normalize(raw: &str) -> Self {
        match url::Url::parse(raw) {
            Ok(mut parsed) => {
                let scheme = parsed.scheme().to_ascii_lowercase();
                let _ = parsed.set_scheme(&scheme);
                if let Some(host) = parsed.host_str() {
                    let host = host.to_ascii_lowercase();
                    let _ = parsed.set_host(Some(&host));
                }
                Self(parsed.into())
            }
            Err(_) => Self(raw.to_ascii_lowercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host_only() {
        let a = SourceFingerprint::normalize("RTSP://Camera.Local:554/Stream1?Token=AbC");
        let b = SourceFingerprint::normalize("rtsp://camera.local:554/Stream1?Token=AbC");
        assert_eq!(a, b);
        assert!(a.as_str().contains("Stream1"), "path must be preserved verbatim");
        assert!(a.as_str().contains("Token=AbC"), "query must be preserved verbatim");
    }

    #[test]
    fn different_paths_are_distinct() {
        let a = SourceFingerprint::normalize("rtsp://camera.local/stream1");
        let b = SourceFingerprint::normalize("rtsp://camera.local/stream2");
        assert_ne!(a, b);
    }

    #[test]
    fn unparseable_url_falls_back_to_lowercase() {
        let a = SourceFingerprint::normalize("Not A Url");
        assert_eq!(a.as_str(), "not a url");
    }
}
