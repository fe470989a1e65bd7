use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// What a local track is used for. One active track per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaRole {
    Camera,
    Microphone,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaRole {
    pub fn kind(self) -> MediaKind {
        match self {
            MediaRole::Microphone => MediaKind::Audio,
            MediaRole::Camera | MediaRole::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaRole::Camera => "camera",
            MediaRole::Microphone => "microphone",
            MediaRole::Screen => "screen",
        }
    }
}

impl fmt::Display for MediaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camera" => Ok(MediaRole::Camera),
            "microphone" => Ok(MediaRole::Microphone),
            "screen" => Ok(MediaRole::Screen),
            other => Err(format!("unknown media role: {other}")),
        }
    }
}

/// Handle to a captured local track. The capture pipeline owns the media;
/// sessions only attach the handle to their transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// A fresh handle suitable for `role`.
    pub fn for_role(role: MediaRole) -> Self {
        Self::new(format!("{}-{}", role, Uuid::new_v4()), role.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn roles_round_trip_through_their_names() {
        for role in [MediaRole::Camera, MediaRole::Microphone, MediaRole::Screen] {
            assert_eq!(role.as_str().parse::<MediaRole>(), Ok(role));
        }
        assert!("hologram".parse::<MediaRole>().is_err());
    }

    #[test_timeout::timeout]
    fn tracks_for_role_match_its_kind() {
        let track = LocalTrack::for_role(MediaRole::Microphone);
        assert_eq!(track.kind, MediaKind::Audio);
        assert!(track.id.starts_with("microphone-"));
        assert_ne!(track, LocalTrack::for_role(MediaRole::Microphone));
    }
}
