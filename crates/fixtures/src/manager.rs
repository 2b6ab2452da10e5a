//! Test data generation and consistency checking

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use lingotest_common::{Error, Result};

use crate::entities::*;

const USERNAMES: &[&str] = &[
    "mika", "sofia", "jonas", "amelie", "hiro", "lucia", "piotr", "nadia", "tomas", "yuki",
];
const LANGUAGES: &[&str] = &["es", "fr", "de", "ja", "pt", "it"];
const SERIES: &[&str] = &[
    "Cocina Casera",
    "Nachbarn",
    "Tokyo Mornings",
    "Rua das Flores",
];
const TERMS: &[(&str, &str)] = &[
    ("casa", "house"),
    ("perro", "dog"),
    ("manzana", "apple"),
    ("caminar", "to walk"),
    ("ventana", "window"),
    ("rapido", "fast"),
    ("ciudad", "city"),
    ("amigo", "friend"),
    ("comer", "to eat"),
    ("libro", "book"),
    ("verde", "green"),
    ("noche", "night"),
];

/// A reference that does not resolve within the store
#[derive(Debug, Clone, Serialize)]
pub struct DanglingReference {
    /// Entity kind and id of the record holding the bad reference
    pub record: String,
    /// Which field failed to resolve
    pub field: String,
    pub missing_id: Uuid,
}

/// Result of walking the store's foreign references
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub valid: bool,
    pub errors: Vec<DanglingReference>,
}

/// Generates fixture entities with internal referential integrity
///
/// Usable standalone: the manager owns an in-memory store and hands
/// out serializable bundles.
pub struct TestDataManager {
    rng: StdRng,
    users: Vec<User>,
    media: Vec<MediaItem>,
    subtitles: Vec<Subtitle>,
    vocabulary: Vec<VocabularyTerm>,
    progress: Vec<ProgressRecord>,
}

impl TestDataManager {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Deterministic generation for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            users: Vec::new(),
            media: Vec::new(),
            subtitles: Vec::new(),
            vocabulary: Vec::new(),
            progress: Vec::new(),
        }
    }

    pub fn create_user(&mut self) -> User {
        let name = USERNAMES[self.rng.gen_range(0..USERNAMES.len())];
        let suffix: u16 = self.rng.gen_range(10..1000);
        let mut langs = LANGUAGES.to_vec();
        langs.shuffle(&mut self.rng);
        let user = User {
            id: Uuid::new_v4(),
            username: format!("{name}{suffix}"),
            email: format!("{name}{suffix}@example.com"),
            native_language: "en".to_string(),
            target_language: langs[0].to_string(),
            created_at: Utc::now() - Duration::days(self.rng.gen_range(0..365)),
        };
        self.users.push(user.clone());
        user
    }

    pub fn create_media_item(&mut self) -> MediaItem {
        let series = SERIES[self.rng.gen_range(0..SERIES.len())].to_string();
        let episode = self.rng.gen_range(1..=12);
        let item = MediaItem {
            id: Uuid::new_v4(),
            title: format!("{series} E{episode:02}"),
            language: LANGUAGES[self.rng.gen_range(0..LANGUAGES.len())].to_string(),
            duration_seconds: self.rng.gen_range(300..2700),
            series: Some(series),
            episode_number: Some(episode),
        };
        self.media.push(item.clone());
        item
    }

    pub fn create_subtitle(&mut self, media_id: Uuid) -> Subtitle {
        let sub = Subtitle {
            id: Uuid::new_v4(),
            media_id,
            language: LANGUAGES[self.rng.gen_range(0..LANGUAGES.len())].to_string(),
            format: if self.rng.gen_bool(0.7) {
                SubtitleFormat::Vtt
            } else {
                SubtitleFormat::Srt
            },
            cue_count: self.rng.gen_range(50..800),
        };
        self.subtitles.push(sub.clone());
        sub
    }

    pub fn create_vocabulary_term(&mut self) -> VocabularyTerm {
        let (term, translation) = TERMS[self.rng.gen_range(0..TERMS.len())];
        let n: u16 = self.rng.gen_range(0..1000);
        let term = VocabularyTerm {
            id: Uuid::new_v4(),
            term: format!("{term}-{n}"),
            language: "es".to_string(),
            translation: translation.to_string(),
            difficulty: self.rng.gen_range(1..=5),
        };
        self.vocabulary.push(term.clone());
        term
    }

    pub fn create_progress_record(&mut self, user_id: Uuid, target: ProgressTarget) -> ProgressRecord {
        let record = ProgressRecord {
            id: Uuid::new_v4(),
            user_id,
            target,
            completion_percent: self.rng.gen_range(0.0..=100.0),
            last_seen_at: Utc::now() - Duration::minutes(self.rng.gen_range(0..10_000)),
        };
        self.progress.push(record.clone());
        record
    }

    /// Compose a named bundle of entities
    pub fn create_scenario(&mut self, name: &str) -> Result<FixtureBundle> {
        match name {
            "basic" => {
                let users: Vec<User> = (0..2).map(|_| self.create_user()).collect();
                let media = self.create_media_item();
                for _ in 0..10 {
                    self.create_vocabulary_term();
                }
                self.create_progress_record(users[0].id, ProgressTarget::Media(media.id));
            }
            "comprehensive" => {
                let users: Vec<User> = (0..5).map(|_| self.create_user()).collect();
                let media: Vec<MediaItem> = (0..10).map(|_| self.create_media_item()).collect();
                for item in &media {
                    for _ in 0..2 {
                        self.create_subtitle(item.id);
                    }
                }
                let vocab: Vec<VocabularyTerm> =
                    (0..50).map(|_| self.create_vocabulary_term()).collect();
                // Progress fan-out: every user touches every media item
                // plus a handful of vocabulary terms
                for user in &users {
                    for item in &media {
                        self.create_progress_record(user.id, ProgressTarget::Media(item.id));
                    }
                    for term in vocab.iter().take(5) {
                        self.create_progress_record(user.id, ProgressTarget::Vocabulary(term.id));
                    }
                }
            }
            other => return Err(Error::UnknownScenario(other.to_string())),
        }

        debug!(
            scenario = name,
            users = self.users.len(),
            media = self.media.len(),
            progress = self.progress.len(),
            "generated scenario"
        );
        Ok(self.bundle(name))
    }

    /// Snapshot the store as a serializable bundle
    pub fn bundle(&self, scenario: &str) -> FixtureBundle {
        FixtureBundle {
            scenario: scenario.to_string(),
            users: self.users.clone(),
            media: self.media.clone(),
            subtitles: self.subtitles.clone(),
            vocabulary: self.vocabulary.clone(),
            progress: self.progress.clone(),
        }
    }

    /// Write the current store to a JSON file for child injection
    pub fn write_bundle(&self, scenario: &str, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.bundle(scenario))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Remove a user, leaving any progress records dangling
    pub fn remove_user(&mut self, id: Uuid) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.id != id);
        self.users.len() != before
    }

    /// Remove a media item, leaving subtitles and progress dangling
    pub fn remove_media_item(&mut self, id: Uuid) -> bool {
        let before = self.media.len();
        self.media.retain(|m| m.id != id);
        self.media.len() != before
    }

    /// Walk every foreign reference and report the ones that fail to
    /// resolve within the store
    pub fn validate_data_consistency(&self) -> ConsistencyReport {
        let mut errors = Vec::new();

        let user_ids: std::collections::HashSet<Uuid> = self.users.iter().map(|u| u.id).collect();
        let media_ids: std::collections::HashSet<Uuid> = self.media.iter().map(|m| m.id).collect();
        let vocab_ids: std::collections::HashSet<Uuid> =
            self.vocabulary.iter().map(|v| v.id).collect();

        for sub in &self.subtitles {
            if !media_ids.contains(&sub.media_id) {
                errors.push(DanglingReference {
                    record: format!("subtitle {}", sub.id),
                    field: "media_id".to_string(),
                    missing_id: sub.media_id,
                });
            }
        }

        for record in &self.progress {
            if !user_ids.contains(&record.user_id) {
                errors.push(DanglingReference {
                    record: format!("progress {}", record.id),
                    field: "user_id".to_string(),
                    missing_id: record.user_id,
                });
            }
            match record.target {
                ProgressTarget::Media(id) if !media_ids.contains(&id) => {
                    errors.push(DanglingReference {
                        record: format!("progress {}", record.id),
                        field: "target".to_string(),
                        missing_id: id,
                    });
                }
                ProgressTarget::Vocabulary(id) if !vocab_ids.contains(&id) => {
                    errors.push(DanglingReference {
                        record: format!("progress {}", record.id),
                        field: "target".to_string(),
                        missing_id: id,
                    });
                }
                _ => {}
            }
        }

        ConsistencyReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn media(&self) -> &[MediaItem] {
        &self.media
    }

    pub fn progress(&self) -> &[ProgressRecord] {
        &self.progress
    }
}

impl Default for TestDataManager {
    fn default() -> Self {
        Self::new()
    }
}
