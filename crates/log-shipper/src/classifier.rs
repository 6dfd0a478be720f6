// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Probabilistic hot/cold text classification.
//!
//! [`NaiveBayesClassifier`] is a multinomial naive Bayes model over lower-cased
//! words with Laplace smoothing. It is internally synchronized and can be
//! plugged into the scheduler through [`classification_hook`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ClassifierError;
use crate::scheduler::ClassificationHook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Hot,
    Cold,
}

impl Label {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Hot => "hot",
            Label::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probability per label. Sums to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub hot: f64,
    pub cold: f64,
}

impl Scores {
    #[must_use]
    pub fn likely(&self) -> Label {
        if self.hot > self.cold {
            Label::Hot
        } else {
            Label::Cold
        }
    }
}

pub trait Classifier: Send + Sync {
    fn learn(&self, text: &str, label: Label);
    fn classify(&self, text: &str) -> Scores;
    /// Whether any text was learned yet. Untrained models score 0.5 / 0.5.
    fn is_trained(&self) -> bool;
    /// Persists the model if it changed since it was loaded or last saved.
    fn backup(&self) -> Result<(), ClassifierError>;
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "i",
    "if", "in", "into", "is", "it", "its", "of", "on", "or", "so", "such", "that", "the",
    "their", "then", "there", "these", "they", "this", "to", "was", "were", "will", "with",
];

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LabelStats {
    documents: u64,
    words: u64,
    frequencies: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Model {
    hot: LabelStats,
    cold: LabelStats,
}

impl Model {
    fn stats_mut(&mut self, label: Label) -> &mut LabelStats {
        match label {
            Label::Hot => &mut self.hot,
            Label::Cold => &mut self.cold,
        }
    }

    fn vocabulary(&self) -> usize {
        self.hot
            .frequencies
            .keys()
            .chain(self.cold.frequencies.keys().filter(|w| !self.hot.frequencies.contains_key(*w)))
            .count()
    }

    fn log_score(&self, stats: &LabelStats, words: &[String], vocabulary: f64) -> f64 {
        let total_documents = (self.hot.documents + self.cold.documents) as f64;
        let prior = (stats.documents as f64 + 1.0) / (total_documents + 2.0);
        let denominator = stats.words as f64 + vocabulary;
        words.iter().fold(prior.ln(), |acc, word| {
            let count = stats.frequencies.get(word).copied().unwrap_or(0) as f64;
            acc + ((count + 1.0) / denominator).ln()
        })
    }
}

#[derive(Debug)]
pub struct NaiveBayesClassifier {
    path: PathBuf,
    model: RwLock<Model>,
    /// Set by `learn`, cleared by a successful `backup`.
    dirty: AtomicBool,
}

impl NaiveBayesClassifier {
    /// Loads the model stored at `path`, or starts an empty one if the file is
    /// missing or empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ClassifierError> {
        let path = path.into();
        let model = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => {
                info!("Loaded classifier model from {}", path.display());
                serde_json::from_slice(&bytes)?
            }
            Ok(_) => Model::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No classifier model at {}, starting fresh", path.display());
                Model::default()
            }
            Err(source) => return Err(ClassifierError::Io { path, source }),
        };
        Ok(Self {
            path,
            model: RwLock::new(model),
            dirty: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Classifier for NaiveBayesClassifier {
    fn learn(&self, text: &str, label: Label) {
        let words = tokenize(text);
        #[allow(clippy::expect_used)]
        let mut model = self.model.write().expect("lock poisoned");
        let stats = model.stats_mut(label);
        stats.documents += 1;
        stats.words += words.len() as u64;
        for word in words {
            *stats.frequencies.entry(word).or_insert(0) += 1;
        }
        self.dirty.store(true, Ordering::Release);
    }

    fn classify(&self, text: &str) -> Scores {
        let words = tokenize(text);
        #[allow(clippy::expect_used)]
        let model = self.model.read().expect("lock poisoned");
        let vocabulary = model.vocabulary().max(1) as f64;
        let hot = model.log_score(&model.hot, &words, vocabulary);
        let cold = model.log_score(&model.cold, &words, vocabulary);

        // Normalize in log space to avoid underflow on long lines.
        let max = hot.max(cold);
        let hot = (hot - max).exp();
        let cold = (cold - max).exp();
        Scores {
            hot: hot / (hot + cold),
            cold: cold / (hot + cold),
        }
    }

    fn is_trained(&self) -> bool {
        #[allow(clippy::expect_used)]
        let model = self.model.read().expect("lock poisoned");
        model.hot.documents + model.cold.documents > 0
    }

    fn backup(&self) -> Result<(), ClassifierError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            debug!("Classifier model unchanged, skipping save");
            return Ok(());
        }
        let bytes = {
            #[allow(clippy::expect_used)]
            let model = self.model.read().expect("lock poisoned");
            serde_json::to_vec(&*model)?
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| {
                self.dirty.store(true, Ordering::Release);
                ClassifierError::Io {
                    path: self.path.clone(),
                    source,
                }
            })?;
        debug!("Classifier model saved to {}", self.path.display());
        Ok(())
    }
}

/// Turns a classifier into a scheduler hook: hot iff P(hot) > P(cold). The
/// keyword verdict stands while the classifier has no training data.
#[must_use]
pub fn classification_hook(classifier: Arc<dyn Classifier>) -> ClassificationHook {
    Arc::new(move |line: &str, verdict: Label| {
        if classifier.is_trained() {
            classifier.classify(line).likely()
        } else {
            verdict
        }
    })
}
