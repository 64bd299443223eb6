//! Indexed form of a document: terms, sortable slot values and a projection.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metadata::{Metadata, Typecast, Value};

/// Position gap inserted between properties so phrases never span two of them.
const PROPERTY_GAP: u32 = 100;

/// Term key for an exact attribute value.
pub fn exact_key(prefix: &str, value: &str) -> String {
    format!("{}:{}", prefix, value)
}

/// Term key for a tokenized word. Free text uses the empty prefix.
pub fn word_key(prefix: &str, word: &str) -> String {
    format!("{}~{}", prefix, word)
}

/// Lowercased alphanumeric words of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Sortable value stored in a slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SortKey {
    Int(i64),
    Float(f64),
    Str(String),
    /// Language tag to translation; resolved against the caller's languages.
    Localized(BTreeMap<String, String>),
}

impl SortKey {
    /// Derives the slot value of a property from its typed value.
    pub fn from_value(value: &Value, typecast: &Typecast) -> Option<SortKey> {
        match value {
            Value::Null | Value::Blob(_) => None,
            Value::Bool(b) => Some(SortKey::Int(i64::from(*b))),
            Value::Int(i) => Some(SortKey::Int(*i)),
            Value::Float(f) => Some(SortKey::Float(*f)),
            Value::Str(s) => Some(SortKey::Str(s.clone())),
            Value::Localized(map) => Some(SortKey::Localized(map.clone())),
            Value::List(items) => items
                .first()
                .and_then(|item| SortKey::from_value(item, typecast)),
            Value::Aggregate(ids) => Some(SortKey::Int(ids.len() as i64)),
        }
    }

    /// Parses a query bound the way a slot of `typecast` is stored.
    pub fn parse_bound(text: &str, typecast: &Typecast) -> SortKey {
        let inner = match typecast {
            Typecast::List(inner) => inner.as_ref(),
            other => other,
        };
        match inner {
            Typecast::Int | Typecast::Bool => text
                .parse::<i64>()
                .map(SortKey::Int)
                .unwrap_or_else(|_| SortKey::Str(text.to_string())),
            Typecast::Float => text
                .parse::<f64>()
                .map(SortKey::Float)
                .unwrap_or_else(|_| SortKey::Str(text.to_string())),
            _ => SortKey::Str(text.to_string()),
        }
    }

    /// Order-preserving byte encoding used for range scans.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            SortKey::Int(i) => ((*i as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
            SortKey::Float(f) => {
                let bits = f.to_bits();
                let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
                ordered.to_be_bytes().to_vec()
            }
            SortKey::Str(s) => s.as_bytes().to_vec(),
            SortKey::Localized(map) => map
                .values()
                .min()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default(),
        }
    }

    /// Picks the translation for `languages`, falling back to the smallest one.
    pub fn resolve<'a>(map: &'a BTreeMap<String, String>, languages: &[String]) -> Option<&'a str> {
        languages
            .iter()
            .find_map(|lang| map.get(lang))
            .or_else(|| map.values().min())
            .map(String::as_str)
    }

    /// Compares two slot values; numeric values compare numerically.
    pub fn compare(&self, other: &SortKey, languages: &[String]) -> Ordering {
        match (self, other) {
            (SortKey::Int(a), SortKey::Int(b)) => a.cmp(b),
            (SortKey::Float(a), SortKey::Float(b)) => a.total_cmp(b),
            (SortKey::Int(a), SortKey::Float(b)) => (*a as f64).total_cmp(b),
            (SortKey::Float(a), SortKey::Int(b)) => a.total_cmp(&(*b as f64)),
            (SortKey::Localized(a), SortKey::Localized(b)) => {
                Self::resolve(a, languages).cmp(&Self::resolve(b, languages))
            }
            (SortKey::Localized(a), SortKey::Str(b)) => {
                Self::resolve(a, languages).unwrap_or("").as_bytes().cmp(b.as_bytes())
            }
            (SortKey::Str(a), SortKey::Localized(b)) => {
                a.as_bytes().cmp(Self::resolve(b, languages).unwrap_or("").as_bytes())
            }
            (a, b) => a.encode().cmp(&b.encode()),
        }
    }
}

/// Everything the index keeps about one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedDoc {
    pub guid: String,

    /// Term key to word positions.
    pub terms: BTreeMap<String, Vec<u32>>,

    /// Slot number to sortable value.
    pub slots: BTreeMap<u32, SortKey>,

    /// Indexed properties as compact JSON text.
    pub props: BTreeMap<String, String>,
}

impl IndexedDoc {
    /// Builds the indexed form from raw on-disk property values.
    pub fn build(
        metadata: &Metadata,
        guid: &str,
        values: &BTreeMap<String, serde_json::Value>,
        default_language: &str,
    ) -> IndexedDoc {
        let mut doc = IndexedDoc {
            guid: guid.to_string(),
            terms: BTreeMap::new(),
            slots: BTreeMap::new(),
            props: BTreeMap::new(),
        };
        let mut position = 0u32;

        for prop in metadata.iter().filter(|p| p.is_indexed()) {
            let Some(raw) = values.get(&prop.name) else {
                continue;
            };
            let value = match prop.coerce(raw, default_language) {
                Ok(value) => value,
                Err(reason) => {
                    warn!(guid = %guid, prop = %prop.name, %reason, "Skipping unindexable value");
                    continue;
                }
            };

            doc.props.insert(prop.name.clone(), raw.to_string());

            if let Some(slot) = prop.slot {
                if let Some(key) = SortKey::from_value(&value, &prop.typecast) {
                    doc.slots.insert(slot, key);
                }
            }

            if let Some(prefix) = &prop.prefix {
                for term in value.term_strings() {
                    doc.terms.entry(exact_key(prefix, &term)).or_default();
                }
                if !prop.boolean {
                    for text in value.text() {
                        for word in tokenize(&text) {
                            doc.terms
                                .entry(word_key(prefix, &word))
                                .or_default()
                                .push(position);
                            position += 1;
                        }
                        position += PROPERTY_GAP;
                    }
                }
            }

            if prop.full_text {
                for text in value.text() {
                    for word in tokenize(&text) {
                        doc.terms
                            .entry(word_key("", &word))
                            .or_default()
                            .push(position);
                        position += 1;
                    }
                    position += PROPERTY_GAP;
                }
            }
        }

        doc.props
            .entry(crate::metadata::GUID.to_string())
            .or_insert_with(|| serde_json::Value::String(guid.to_string()).to_string());

        doc
    }

    /// Projected value of an indexed property.
    pub fn prop(&self, name: &str) -> Option<serde_json::Value> {
        self.props
            .get(name)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn has_term(&self, key: &str) -> bool {
        self.terms.contains_key(key)
    }

    /// Whether `words` appear at consecutive positions under `prefix`.
    pub fn has_phrase(&self, prefix: &str, words: &[String]) -> bool {
        let Some(first) = words.first() else {
            return true;
        };
        let Some(starts) = self.terms.get(&word_key(prefix, first)) else {
            return false;
        };
        starts.iter().any(|start| {
            words.iter().enumerate().skip(1).all(|(offset, word)| {
                self.terms
                    .get(&word_key(prefix, word))
                    .map_or(false, |positions| positions.contains(&(start + offset as u32)))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyDescriptor;
    use serde_json::json;

    fn metadata() -> Metadata {
        Metadata::new(
            "context",
            vec![
                PropertyDescriptor::new("title", Typecast::Str)
                    .slot(10)
                    .prefix("T")
                    .full_text()
                    .localized(),
                PropertyDescriptor::new("k", Typecast::Int).slot(11).prefix("K").boolean(),
                PropertyDescriptor::new("summary", Typecast::Str).full_text(),
                PropertyDescriptor::new("notes", Typecast::Str),
            ],
        )
        .unwrap()
    }

    fn build(values: serde_json::Value) -> IndexedDoc {
        let values: BTreeMap<String, serde_json::Value> =
            serde_json::from_value(values).unwrap();
        IndexedDoc::build(&metadata(), "guid1", &values, "en")
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(tokenize("Йцу-кен"), vec!["йцу", "кен"]);
        assert!(tokenize("  ,, ").is_empty());
    }

    #[test]
    fn test_build_terms_and_slots() {
        let doc = build(json!({
            "guid": "guid1",
            "title": {"en": "Quick fox", "ru": "йцу"},
            "k": 3,
            "summary": "lazy dog",
            "notes": "not indexed",
        }));

        assert!(doc.has_term(&exact_key("I", "guid1")));
        assert!(doc.has_term(&exact_key("K", "3")));
        assert!(!doc.has_term(&word_key("K", "3")));
        assert!(doc.has_term(&word_key("T", "quick")));
        assert!(doc.has_term(&word_key("", "йцу")));
        assert!(doc.has_term(&word_key("", "dog")));
        assert!(!doc.has_term(&word_key("", "indexed")));
        assert_eq!(doc.slots.get(&11), Some(&SortKey::Int(3)));
        assert!(doc.prop("notes").is_none());
        assert_eq!(doc.prop("k"), Some(json!(3)));
    }

    #[test]
    fn test_phrase_does_not_span_properties() {
        let doc = build(json!({"title": "quick fox", "summary": "lazy dog"}));
        let words = |s: &str| tokenize(s);
        assert!(doc.has_phrase("", &words("quick fox")));
        assert!(doc.has_phrase("", &words("lazy dog")));
        assert!(!doc.has_phrase("", &words("fox lazy")));
        assert!(!doc.has_phrase("", &words("fox quick")));
    }

    #[test]
    fn test_sort_key_encoding_preserves_order() {
        let ints = [-5i64, -1, 0, 1, 42];
        for pair in ints.windows(2) {
            assert!(SortKey::Int(pair[0]).encode() < SortKey::Int(pair[1]).encode());
        }
        let floats = [-2.5f64, -0.5, 0.0, 0.25, 10.0];
        for pair in floats.windows(2) {
            assert!(SortKey::Float(pair[0]).encode() < SortKey::Float(pair[1]).encode());
        }
    }

    #[test]
    fn test_localized_resolution() {
        let mut map = BTreeMap::new();
        map.insert("ru".to_string(), "б".to_string());
        map.insert("fr".to_string(), "a".to_string());
        assert_eq!(SortKey::resolve(&map, &["ru".to_string()]), Some("б"));
        assert_eq!(SortKey::resolve(&map, &["en".to_string()]), Some("a"));
    }
}
