//! Security-question recovery.
//!
//! Only SHA-256 digests of normalized answers are stored. A successful
//! verification is treated by the controller as equivalent to a badge scan.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// The fixed recovery questions, in answer order.
pub const QUESTIONS: [&str; 3] = [
    "What was the name of your first pet?",
    "What is your mother's maiden name?",
    "What city were you born in?",
];

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("expected {expected} answers, got {actual}")]
    WrongAnswerCount { expected: usize, actual: usize },

    #[error("recovery answers must not be empty")]
    EmptyAnswer,

    #[error("recovery answers are already configured")]
    AlreadyConfigured,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted answer digests, `{"answers": [hex, hex, hex]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    #[serde(default)]
    pub answers: Vec<String>,
}

/// Gate for the knowledge-based unlock path.
#[derive(Debug)]
pub struct RecoveryManager {
    profile: SecurityProfile,
    path: PathBuf,
}

impl RecoveryManager {
    /// Load the profile from `path`. Missing or malformed files load as unconfigured.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let profile = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<SecurityProfile>(&contents) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring malformed security profile");
                    SecurityProfile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SecurityProfile::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read security profile");
                SecurityProfile::default()
            }
        };
        Self { profile, path }
    }

    pub fn questions(&self) -> &'static [&'static str] {
        &QUESTIONS
    }

    /// True once all three digests exist.
    pub fn is_configured(&self) -> bool {
        self.profile.answers.len() == QUESTIONS.len()
    }

    /// Store digests of the answers and persist them. The profile is immutable
    /// once configured.
    pub fn set_answers<S: AsRef<str>>(&mut self, answers: &[S]) -> Result<(), RecoveryError> {
        if self.is_configured() {
            return Err(RecoveryError::AlreadyConfigured);
        }
        validate_answers(answers)?;

        let profile = SecurityProfile {
            answers: answers.iter().map(|a| digest(a.as_ref())).collect(),
        };
        save(&self.path, &profile)?;
        self.profile = profile;
        debug!(path = %self.path.display(), "Security profile saved");
        Ok(())
    }

    /// True iff every answer matches its stored digest.
    pub fn verify<S: AsRef<str>>(&self, answers: &[S]) -> bool {
        if !self.is_configured() || answers.len() != QUESTIONS.len() {
            return false;
        }
        self.profile
            .answers
            .iter()
            .zip(answers)
            .all(|(stored, given)| *stored == digest(given.as_ref()))
    }
}

/// Check that there is one non-empty answer per question.
pub fn validate_answers<S: AsRef<str>>(answers: &[S]) -> Result<(), RecoveryError> {
    if answers.len() != QUESTIONS.len() {
        return Err(RecoveryError::WrongAnswerCount {
            expected: QUESTIONS.len(),
            actual: answers.len(),
        });
    }
    if answers.iter().any(|a| normalize(a.as_ref()).is_empty()) {
        return Err(RecoveryError::EmptyAnswer);
    }
    Ok(())
}

fn save(path: &Path, profile: &SecurityProfile) -> Result<(), RecoveryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(profile)?)?;
    Ok(())
}

/// Lower-case and trim an answer.
pub fn normalize(answer: &str) -> String {
    answer.trim().to_lowercase()
}

/// Hex SHA-256 of the normalized answer.
pub fn digest(answer: &str) -> String {
    hex::encode(Sha256::digest(normalize(answer).as_bytes()))
}
