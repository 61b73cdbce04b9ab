//! [`Destination`] descriptors and the pure [URL Constructor][cons] and
//! [Argument Builder][args] functions of §4.1.
//!
//! [cons]: construct_rtmp_url
//! [args]: build_args

use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::RelayError;

/// Destination platform a live stream may be re-streamed to.
///
/// A tagged variant rather than a stringly-typed platform, per the
/// re-architecture note in §9 of the specification.
#[derive(
    Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// `rtmps://a.rtmp.youtube.com:443/live2/{key}`.
    #[display(fmt = "youtube")]
    Youtube,

    /// `rtmp://live.twitch.tv/app/{key}`.
    #[display(fmt = "twitch")]
    Twitch,

    /// `rtmps://live-api-s.facebook.com:443/rtmp/{key}`.
    #[display(fmt = "facebook")]
    Facebook,

    /// A user-supplied RTMP/RTMPS base URL.
    #[display(fmt = "custom")]
    Custom,
}

/// Non-empty, alphanumeric-plus-`-` identifier of a stream on a destination
/// [`Platform`].
pub type StreamKey = String;

/// Destination descriptor `D` of §3, as received from `start-rtmp-stream` and
/// `test-rtmp-stream`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Destination {
    /// Platform this destination re-streams to.
    pub platform: Platform,

    /// Stream key on that platform.
    #[serde(rename = "streamKey")]
    pub stream_key: StreamKey,

    /// Base URL, meaningful only when [`Platform::Custom`].
    #[serde(default, rename = "url", skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
}

impl Destination {
    /// Validates this descriptor and constructs its [`rtmp_url`].
    ///
    /// # Errors
    ///
    /// If the invariants of §3 are violated: empty stream key, or a
    /// [`Platform::Custom`] destination missing/empty `custom_url`, or a
    /// malformed custom URL.
    ///
    /// [`rtmp_url`]: Destination::rtmp_url
    pub fn rtmp_url(&self) -> Result<Url, RelayError> {
        construct_rtmp_url(
            self.platform,
            &self.stream_key,
            self.custom_url.as_deref(),
        )
    }
}

/// Validates that a stream key is non-empty and consists only of
/// alphanumeric characters and `-`.
#[must_use]
pub fn is_valid_stream_key(key: &str) -> bool {
    !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Constructs the canonical RTMP/RTMPS ingest [`Url`] for the given
/// `platform`, `stream_key` and (for [`Platform::Custom`]) `custom_url`.
///
/// # Errors
///
/// If `stream_key` is empty, if `platform` is [`Platform::Custom`] and
/// `custom_url` is absent or empty, or if the resulting URL is not a
/// syntactically valid RTMP/RTMPS URL.
pub fn construct_rtmp_url(
    platform: Platform,
    stream_key: &str,
    custom_url: Option<&str>,
) -> Result<Url, RelayError> {
    if stream_key.trim().is_empty() {
        return Err(RelayError::InvalidDestination(
            "stream key must not be empty".to_owned(),
        ));
    }

    let raw = match platform {
        Platform::Youtube => {
            format!("rtmps://a.rtmp.youtube.com:443/live2/{stream_key}")
        }
        Platform::Twitch => {
            format!("rtmp://live.twitch.tv/app/{stream_key}")
        }
        Platform::Facebook => {
            format!("rtmps://live-api-s.facebook.com:443/rtmp/{stream_key}")
        }
        Platform::Custom => {
            let base = custom_url.unwrap_or("").trim();
            if base.is_empty() {
                return Err(RelayError::InvalidDestination(
                    "custom URL must not be empty for a `custom` platform \
                     destination"
                        .to_owned(),
                ));
            }
            format!("{}/{}", base.trim_end_matches('/'), stream_key)
        }
    };

    let url = Url::parse(&raw).map_err(|e| {
        RelayError::InvalidDestination(format!(
            "'{raw}' is not a valid RTMP/RTMPS URL: {e}"
        ))
    })?;

    match url.scheme() {
        "rtmp" | "rtmps" => Ok(url),
        other => Err(RelayError::InvalidDestination(format!(
            "unsupported URL scheme '{other}', expected `rtmp` or `rtmps`"
        ))),
    }
}

/// Builds the canonical transcoder argument vector for re-streaming to
/// `rtmp_url`, per the contract of §4.1.
///
/// This exact argument list is a contract: changing it changes on-the-wire
/// behavior and must be versioned alongside this function's doc comment.
#[must_use]
pub fn build_args(rtmp_url: &Url) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "info",
        // Forgiving timestamp handling for a live, possibly-irregular input.
        "-fflags",
        "+genpts+discardcorrupt",
        "-use_wallclock_as_timestamps",
        "1",
        "-probesize",
        "32",
        "-analyzeduration",
        "0",
        "-i",
        "pipe:0",
        // Fast H.264, zero-latency tuning, no scene-cut keyframes.
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-tune",
        "zerolatency",
        "-sc_threshold",
        "0",
        "-b:v",
        "3000k",
        "-maxrate",
        "3000k",
        "-bufsize",
        "6000k",
        "-r",
        "30",
        // Forced keyframe every 2s at 30fps.
        "-g",
        "60",
        "-keyint_min",
        "60",
        "-pix_fmt",
        "yuv420p",
        // Stereo 44.1kHz AAC at 128kbps.
        "-c:a",
        "aac",
        "-ar",
        "44100",
        "-ac",
        "2",
        "-b:a",
        "128k",
        "-flush_packets",
        "1",
        "-f",
        "flv",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain(std::iter::once(rtmp_url.as_str().to_owned()))
    .collect()
}

/// Builds the argument vector for `test-rtmp-stream`: a synthetic test
/// pattern plus sine tone source, re-encoded and pushed to `rtmp_url` for
/// `duration` seconds, per §4.5.
#[must_use]
pub fn build_test_args(rtmp_url: &Url, duration: std::time::Duration) -> Vec<String> {
    let secs = duration.as_secs().clamp(3, 120).to_string();
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "info".to_owned(),
        "-f".to_owned(),
        "lavfi".to_owned(),
        "-i".to_owned(),
        "testsrc=size=1280x720:rate=30".to_owned(),
        "-f".to_owned(),
        "lavfi".to_owned(),
        "-i".to_owned(),
        "sine=frequency=1000".to_owned(),
        "-t".to_owned(),
        secs,
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-preset".to_owned(),
        "veryfast".to_owned(),
        "-tune".to_owned(),
        "zerolatency".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-c:a".to_owned(),
        "aac".to_owned(),
        "-b:a".to_owned(),
        "128k".to_owned(),
        "-f".to_owned(),
        "flv".to_owned(),
        rtmp_url.as_str().to_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_url() {
        let url =
            construct_rtmp_url(Platform::Youtube, "aaaa-bbbb-cccc-dddd", None)
                .unwrap();
        assert_eq!(
            url.as_str(),
            "rtmps://a.rtmp.youtube.com:443/live2/aaaa-bbbb-cccc-dddd",
        );
    }

    #[test]
    fn twitch_url() {
        let url =
            construct_rtmp_url(Platform::Twitch, "live_123", None).unwrap();
        assert_eq!(url.as_str(), "rtmp://live.twitch.tv/app/live_123");
    }

    #[test]
    fn facebook_url() {
        let url =
            construct_rtmp_url(Platform::Facebook, "key1", None).unwrap();
        assert_eq!(
            url.as_str(),
            "rtmps://live-api-s.facebook.com:443/rtmp/key1",
        );
    }

    #[test]
    fn custom_url_joins_with_exactly_one_slash() {
        let without_slash = construct_rtmp_url(
            Platform::Custom,
            "KEY",
            Some("rtmp://h.example.com/app"),
        )
        .unwrap();
        let with_slash = construct_rtmp_url(
            Platform::Custom,
            "KEY",
            Some("rtmp://h.example.com/app/"),
        )
        .unwrap();

        assert_eq!(without_slash.as_str(), "rtmp://h.example.com/app/KEY");
        assert_eq!(with_slash.as_str(), without_slash.as_str());
    }

    #[test]
    fn empty_stream_key_is_rejected() {
        assert!(construct_rtmp_url(Platform::Youtube, "", None).is_err());
        assert!(construct_rtmp_url(Platform::Youtube, "   ", None).is_err());
    }

    #[test]
    fn custom_without_url_is_rejected() {
        assert!(construct_rtmp_url(Platform::Custom, "KEY", None).is_err());
        assert!(
            construct_rtmp_url(Platform::Custom, "KEY", Some("  ")).is_err()
        );
    }

    #[test]
    fn non_rtmp_scheme_is_rejected() {
        assert!(construct_rtmp_url(
            Platform::Custom,
            "KEY",
            Some("https://h.example.com/app")
        )
        .is_err());
    }

    #[test]
    fn build_args_is_a_stable_contract() {
        let url = construct_rtmp_url(Platform::Twitch, "k", None).unwrap();
        let args = build_args(&url);

        assert_eq!(args.first().map(String::as_str), Some("-hide_banner"));
        assert_eq!(args.last().map(String::as_str), Some(url.as_str()));
        assert!(args.iter().any(|a| a == "libx264"));
        assert!(args.iter().any(|a| a == "flv"));
    }

    #[test]
    fn stream_key_validator() {
        assert!(is_valid_stream_key("aaaa-bbbb-1234"));
        assert!(!is_valid_stream_key(""));
        assert!(!is_valid_stream_key("has space"));
        assert!(!is_valid_stream_key("slash/es"));
    }
}
