//! Fixture entity types
//!
//! Mirrors the backend's persisted shapes closely enough that seeded
//! bundles deserialize cleanly on the other side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub native_language: String,
    pub target_language: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub title: String,
    pub language: String,
    pub duration_seconds: u32,
    pub series: Option<String>,
    pub episode_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    Vtt,
    Srt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtitle {
    pub id: Uuid,
    /// Foreign reference to a MediaItem
    pub media_id: Uuid,
    pub language: String,
    pub format: SubtitleFormat,
    pub cue_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyTerm {
    pub id: Uuid,
    pub term: String,
    pub language: String,
    pub translation: String,
    /// 1 (trivial) to 5 (hard)
    pub difficulty: u8,
}

/// What a progress record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ProgressTarget {
    Media(Uuid),
    Vocabulary(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: Uuid,
    /// Foreign reference to a User
    pub user_id: Uuid,
    pub target: ProgressTarget,
    /// 0.0 to 100.0
    pub completion_percent: f64,
    pub last_seen_at: DateTime<Utc>,
}

/// Everything a scenario generated, serializable for injection into a
/// spawned test command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub scenario: String,
    pub users: Vec<User>,
    pub media: Vec<MediaItem>,
    pub subtitles: Vec<Subtitle>,
    pub vocabulary: Vec<VocabularyTerm>,
    pub progress: Vec<ProgressRecord>,
}
