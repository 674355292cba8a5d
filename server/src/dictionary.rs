//! Word lists for matches.

use log::info;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// A word to translate and every accepted translation of it.
pub type WordEntry = (String, Vec<String>);

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("{requested} words requested but only {available} available")]
    NoWordsAvailable { requested: usize, available: usize },
    #[error("dictionary i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("dictionary format failure: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait Dictionary: Send + Sync {
    /// `n` distinct words chosen at random, with their translations.
    fn dictionary(&self, n: usize) -> Result<Vec<WordEntry>, DictionaryError>;
}

#[derive(Debug, Clone, Default)]
pub struct WordListDictionary {
    entries: Vec<WordEntry>,
}

impl WordListDictionary {
    /// Builds a dictionary from `(word, translations)` pairs. Words without
    /// any translation can never be answered and are dropped.
    pub fn new<I, W, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (W, Vec<T>)>,
        W: Into<String>,
        T: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(word, translations)| {
                (
                    word.into(),
                    translations.into_iter().map(Into::into).collect::<Vec<String>>(),
                )
            })
            .filter(|(_, translations)| !translations.is_empty())
            .collect();
        Self { entries }
    }

    /// Loads a `{ "word": ["translation", ...] }` JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let path = path.as_ref();
        let dictionary = Self::from_json(&std::fs::read_to_string(path)?)?;
        info!(
            "Loaded {} words from {}",
            dictionary.len(),
            path.display()
        );
        Ok(dictionary)
    }

    pub fn from_json(json: &str) -> Result<Self, DictionaryError> {
        let map: BTreeMap<String, Vec<String>> = serde_json::from_str(json)?;
        Ok(Self::new(map))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Dictionary for WordListDictionary {
    fn dictionary(&self, n: usize) -> Result<Vec<WordEntry>, DictionaryError> {
        if n > self.entries.len() {
            return Err(DictionaryError::NoWordsAvailable {
                requested: n,
                available: self.entries.len(),
            });
        }
        let mut rng = rand::thread_rng();
        Ok(self
            .entries
            .choose_multiple(&mut rng, n)
            .cloned()
            .collect())
    }
}
