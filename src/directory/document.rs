//! Lazy document view.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::IndexedDoc;
use crate::metadata::{Metadata, Permission, MTIME, SEQNO};
use crate::storage::{PropertyMeta, Record};

/// A document as returned by `get` and `find`.
///
/// Indexed properties come from the index projection when there is one; everything
/// else is read from storage on first access.
#[derive(Clone, Debug)]
pub struct Document {
    record: Record,
    metadata: Arc<Metadata>,
    projection: Option<IndexedDoc>,

    /// Group size when the find grouped its results
    grouped: Option<usize>,

    default_language: String,
}

impl Document {
    pub(crate) fn new(
        record: Record,
        metadata: Arc<Metadata>,
        projection: Option<IndexedDoc>,
        grouped: Option<usize>,
        default_language: String,
    ) -> Self {
        Self {
            record,
            metadata,
            projection,
            grouped,
            default_language,
        }
    }

    pub fn guid(&self) -> &str {
        self.record.guid()
    }

    pub fn grouped(&self) -> Option<usize> {
        self.grouped
    }

    pub fn meta(&self, prop: &str) -> Result<Option<PropertyMeta>> {
        Ok(self.record.meta(prop)?)
    }

    /// Every stored property with its revision record.
    pub fn properties(&self) -> Result<std::collections::BTreeMap<String, PropertyMeta>> {
        Ok(self.record.all()?)
    }

    pub fn mtime(&self) -> Result<i64> {
        if let Some(value) = self.projected(MTIME) {
            if let Some(mtime) = value.as_i64() {
                return Ok(mtime);
            }
        }
        Ok(self.record.mtime()?)
    }

    pub fn seqno(&self) -> Result<u64> {
        if let Some(value) = self.projected(SEQNO) {
            if let Some(seqno) = value.as_u64() {
                return Ok(seqno);
            }
        }
        Ok(self.record.seqno()?)
    }

    /// Value of `prop`, or `None` when it was never written.
    pub fn get(&self, prop: &str) -> Result<Option<serde_json::Value>> {
        if self.metadata.get(prop).is_none() {
            return Err(Error::InvalidValue(format!("unknown property {}", prop)));
        }
        if let Some(value) = self.projected(prop) {
            return Ok(Some(value));
        }
        match prop {
            MTIME => Ok(Some(serde_json::json!(self.record.mtime()?))),
            SEQNO => Ok(Some(serde_json::json!(self.record.seqno()?))),
            _ => Ok(self.record.meta(prop)?.map(|meta| meta.value)),
        }
    }

    /// Projects a localized property to one translation.
    pub fn get_localized(&self, prop: &str, languages: &[String]) -> Result<Option<String>> {
        Ok(match self.get(prop)? {
            Some(serde_json::Value::Object(map)) => {
                negotiate(&map, languages, &self.default_language)
            }
            Some(serde_json::Value::String(text)) => Some(text),
            _ => None,
        })
    }

    /// Renders readable properties as a JSON object.
    ///
    /// An empty `reply` selects every readable non-BLOB property. Localized values
    /// are projected when `languages` is not empty.
    pub fn to_json(
        &self,
        reply: &[String],
        languages: &[String],
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let names: Vec<String> = if reply.is_empty() {
            self.metadata
                .iter()
                .filter(|prop| !prop.blob)
                .map(|prop| prop.name.clone())
                .collect()
        } else {
            reply.to_vec()
        };

        let mut out = serde_json::Map::new();
        for name in names {
            let prop = self
                .metadata
                .get(&name)
                .ok_or_else(|| Error::InvalidValue(format!("unknown property {}", name)))?;
            if !prop.permissions.contains(Permission::READ) {
                continue;
            }
            let value = if prop.localized && !languages.is_empty() {
                self.get_localized(&name, languages)?
                    .map(serde_json::Value::String)
            } else {
                self.get(&name)?
            };
            if let Some(value) = value {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    fn projected(&self, prop: &str) -> Option<serde_json::Value> {
        self.projection.as_ref().and_then(|doc| doc.prop(prop))
    }
}

/// Picks the best translation: exact tag, then primary subtag, then the default
/// language, then the smallest translation.
pub fn negotiate(
    map: &serde_json::Map<String, serde_json::Value>,
    languages: &[String],
    default_language: &str,
) -> Option<String> {
    let text = |key: &str| map.get(key).and_then(|v| v.as_str()).map(str::to_string);

    for lang in languages {
        if let Some(found) = text(lang) {
            return Some(found);
        }
    }

    for lang in languages {
        let primary = primary_subtag(lang);
        let matched = map
            .iter()
            .find(|(tag, _)| primary_subtag(tag) == primary)
            .and_then(|(_, v)| v.as_str());
        if let Some(found) = matched {
            return Some(found.to_string());
        }
    }

    text(default_language).or_else(|| {
        map.values()
            .filter_map(|v| v.as_str())
            .min()
            .map(str::to_string)
    })
}

fn primary_subtag(tag: &str) -> &str {
    tag.split(|c| c == '-' || c == '_').next().unwrap_or(tag)
}
