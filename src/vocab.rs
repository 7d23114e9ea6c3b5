//! Artifacts frozen by a training run and reloaded read-only by the
//! prediction service: the ordered feature-column list and the categorical
//! vocabulary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Code given to any value (or column) the vocabulary does not know.
pub const UNKNOWN_CODE: i64 = -1;

/// Feature columns in the exact order the model was fitted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureColumns(Vec<String>);

impl FeatureColumns {
    pub fn new(columns: Vec<String>) -> Self {
        Self(columns)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| c == column)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let columns: FeatureColumns = read_json(path)?;
        anyhow::ensure!(!columns.is_empty(), "{} lists no feature columns", path.display());
        Ok(columns)
    }
}

type Levels = BTreeMap<String, Vec<String>>;

/// Column name → ordered list of levels. A value's code is its index.
/// Serialized as the bare level map; the code lookup is rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Levels", into = "Levels")]
pub struct CategoricalVocabulary {
    levels: Levels,
    codes: HashMap<String, HashMap<String, i64>>,
}

impl From<Levels> for CategoricalVocabulary {
    fn from(levels: Levels) -> Self {
        let codes = levels
            .iter()
            .map(|(column, values)| (column.clone(), index_levels(values)))
            .collect();
        Self { levels, codes }
    }
}

impl From<CategoricalVocabulary> for Levels {
    fn from(vocab: CategoricalVocabulary) -> Self {
        vocab.levels
    }
}

/// First position wins when a hand-edited artifact repeats a level.
fn index_levels(values: &[String]) -> HashMap<String, i64> {
    let mut codes = HashMap::with_capacity(values.len());
    for (idx, value) in values.iter().enumerate() {
        codes.entry(value.clone()).or_insert(idx as i64);
    }
    codes
}

impl CategoricalVocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `column` with the sorted distinct values seen in training.
    pub fn fit<I, S>(&mut self, column: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let levels: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        self.codes.insert(column.to_string(), index_levels(&levels));
        self.levels.insert(column.to_string(), levels);
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.levels.keys().map(String::as_str)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.levels.contains_key(column)
    }

    pub fn levels(&self, column: &str) -> Option<&[String]> {
        self.levels.get(column).map(Vec::as_slice)
    }

    /// Index of `value` among the frozen levels of `column`, or -1.
    pub fn encode(&self, column: &str, value: &str) -> i64 {
        self.codes
            .get(column)
            .and_then(|codes| codes.get(value))
            .copied()
            .unwrap_or(UNKNOWN_CODE)
    }

    pub fn decode(&self, column: &str, code: i64) -> Option<&str> {
        let idx = usize::try_from(code).ok()?;
        self.levels.get(column)?.get(idx).map(String::as_str)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        read_json(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let body = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> CategoricalVocabulary {
        let mut vocab = CategoricalVocabulary::new();
        vocab.fit("store_id", ["TX_1", "CA_1", "CA_2", "CA_1"]);
        vocab.fit("event_name_1", ["nan", "SuperBowl", "nan"]);
        vocab
    }

    #[test]
    fn levels_are_sorted_and_distinct() {
        let vocab = vocab();
        assert_eq!(vocab.levels("store_id").unwrap(), &["CA_1", "CA_2", "TX_1"]);
        assert_eq!(vocab.levels("event_name_1").unwrap(), &["SuperBowl", "nan"]);
    }

    #[test]
    fn known_values_get_their_index_and_unknown_get_minus_one() {
        let vocab = vocab();
        for column in ["store_id", "event_name_1"] {
            let levels = vocab.levels(column).unwrap().to_vec();
            for (idx, level) in levels.iter().enumerate() {
                assert_eq!(vocab.encode(column, level), idx as i64);
            }
            assert_eq!(vocab.encode(column, "NEVER_SEEN"), UNKNOWN_CODE);
        }
        assert_eq!(vocab.encode("not_a_column", "CA_1"), UNKNOWN_CODE);
    }

    #[test]
    fn decode_returns_the_original_level() {
        let vocab = vocab();
        for value in ["CA_1", "CA_2", "TX_1"] {
            let code = vocab.encode("store_id", value);
            assert_eq!(vocab.decode("store_id", code), Some(value));
        }
        assert_eq!(vocab.decode("store_id", UNKNOWN_CODE), None);
        assert_eq!(vocab.decode("store_id", 3), None);
    }

    #[test]
    fn artifacts_survive_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cols_path = dir.path().join("models/feature_columns.json");
        let vocab_path = dir.path().join("models/cat_mappings.json");

        let columns = FeatureColumns::new(vec!["store_id".into(), "sell_price".into()]);
        columns.save(&cols_path).unwrap();
        vocab().save(&vocab_path).unwrap();

        assert_eq!(FeatureColumns::load(&cols_path).unwrap(), columns);
        assert_eq!(CategoricalVocabulary::load(&vocab_path).unwrap(), vocab());

        let raw = std::fs::read_to_string(&cols_path).unwrap();
        assert!(raw.starts_with("[\n  \"store_id\""));
    }

    #[test]
    fn loaded_levels_keep_their_stored_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat_mappings.json");
        std::fs::write(&path, r#"{"store_id": ["TX_1", "CA_1", "WI_1", "CA_1"]}"#).unwrap();

        let vocab = CategoricalVocabulary::load(&path).unwrap();
        assert_eq!(vocab.encode("store_id", "TX_1"), 0);
        assert_eq!(vocab.encode("store_id", "CA_1"), 1);
        assert_eq!(vocab.encode("store_id", "WI_1"), 2);
        assert_eq!(vocab.encode("store_id", "CA_2"), UNKNOWN_CODE);
        assert_eq!(vocab.levels("store_id").unwrap().len(), 4);
    }

    #[test]
    fn large_vocabulary_codes_match_level_positions() {
        let mut vocab = CategoricalVocabulary::new();
        vocab.fit("item_id", (0..3049).map(|i| format!("FOODS_{i:04}")));

        let levels = vocab.levels("item_id").unwrap().to_vec();
        for (idx, level) in levels.iter().enumerate() {
            assert_eq!(vocab.encode("item_id", level), idx as i64);
        }

        // Refitting a column replaces its codes.
        vocab.fit("item_id", ["HOBBIES_1_001"]);
        assert_eq!(vocab.encode("item_id", "FOODS_0000"), UNKNOWN_CODE);
        assert_eq!(vocab.encode("item_id", "HOBBIES_1_001"), 0);
    }

    #[test]
    fn empty_column_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature_columns.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(FeatureColumns::load(&path).is_err());
    }
}
