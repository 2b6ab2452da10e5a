//! LingoTest Fixtures
//!
//! Synthetic, referentially-consistent test data: users, media items,
//! subtitle tracks, vocabulary terms, and progress records.

pub mod entities;
pub mod manager;

pub use entities::{
    FixtureBundle, MediaItem, ProgressRecord, ProgressTarget, Subtitle, SubtitleFormat, User,
    VocabularyTerm,
};
pub use manager::{ConsistencyReport, DanglingReference, TestDataManager};
