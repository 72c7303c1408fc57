//! Snapshot models returned by the remote library API.
//!
//! Every downloadable thing is an [`Asset`] tagged with an [`AssetKind`], so
//! consumers build filesystem entries for videos, subtitles, cover art and
//! metadata files through one code path.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What an asset is, as reported by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// The main video stream.
    Video,
    /// A non-embedded subtitle track.
    Subtitle,
    /// Cover art or poster image.
    Cover,
    /// An NFO (or similar) metadata document.
    Metadata,
}

/// A single downloadable file belonging to a movie, show or episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub kind: AssetKind,
    /// Opaque identifier used to resolve the download URL.
    pub id: String,
    /// File name exposed in the mounted tree.
    pub name: String,
    /// Size in bytes of the full resource.
    pub size: u64,
    /// Modification time in seconds since the Unix epoch, if known.
    #[serde(default)]
    pub modified: Option<i64>,
}

impl Asset {
    /// Returns the modification time as a `SystemTime`.
    ///
    /// Negative or missing timestamps yield `None`.
    pub fn modified_time(&self) -> Option<SystemTime> {
        let secs = u64::try_from(self.modified?).ok()?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Movie {
    /// Directory name used for this movie, e.g. `Heat (1995)`.
    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({year})", self.title),
            None => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Show {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub year: Option<u16>,
    /// Show-level assets (poster, tvshow.nfo).
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub seasons: Vec<Season>,
}

impl Show {
    pub fn display_name(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({year})", self.title),
            None => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    pub number: u32,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

impl Season {
    /// Directory name used for this season, e.g. `Season 02`.
    pub fn display_name(&self) -> String {
        format!("Season {:02}", self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub number: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}
