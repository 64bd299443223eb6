//! Diff and merge for replication.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use super::{query_error, Directory};
use crate::error::{Error, Result};
use crate::index::{FindRequest, StoreKind, StoreOp};
use crate::metadata::{BlobRef, MTIME, SEQNO};
use crate::storage::fs::validate_name;
use crate::storage::{PropertyMeta, StorageError};
use crate::sync::Sequence;

/// Last-writer-wins: whether `incoming` replaces `local`.
///
/// A later mtime wins. Equal mtimes are settled by comparing the compact JSON bytes of
/// both values, greater bytes winning, so every peer settles the same way.
pub fn wins(incoming: &PropertyMeta, local: &PropertyMeta) -> bool {
    match incoming.mtime.cmp(&local.mtime) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => canonical(&incoming.value) > canonical(&local.value),
    }
}

fn canonical(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Properties of one document that fall into a diff range.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffRecord {
    pub guid: String,
    pub diff: BTreeMap<String, PropertyMeta>,
}

/// Result of [`Directory::diff`].
#[derive(Clone, Debug, Default)]
pub struct Diff {
    /// Documents in ascending seqno order.
    pub records: Vec<DiffRecord>,

    /// Volume seqno when enumeration started.
    pub seqno: u64,
}

impl Directory {
    /// Collects every property whose seqno lies in `range`.
    ///
    /// Documents are paged in `(seqno, guid)` order. Merged documents keep their origin
    /// seqno, so several documents may share one; a page that ends inside such a group
    /// reads the whole group before moving past its seqno. Writes landing while the diff
    /// runs are picked up or skipped but never duplicated.
    pub async fn diff(&self, range: &Sequence) -> Result<Diff> {
        let mut diff = Diff {
            records: Vec::new(),
            seqno: self.seqno.current(),
        };
        let Some(mut cursor) = range.first() else {
            return Ok(diff);
        };

        let page_size = self.config.diff_page_size;
        let mut seen = HashSet::new();
        loop {
            let page = self.seqno_page(&format!("{}:{}..", SEQNO, cursor), Some(page_size))?;
            let full = page.len() >= page_size;
            let Some(&(last, _)) = page.last() else {
                break;
            };

            let mut batch: Vec<String> = page
                .into_iter()
                .filter(|(seqno, _)| !full || *seqno < last)
                .map(|(_, guid)| guid)
                .collect();
            if full {
                // The group at `last` may continue past the page.
                let group = self.seqno_page(&format!("{}:{}..{}", SEQNO, last, last), None)?;
                batch.extend(group.into_iter().map(|(_, guid)| guid));
            }

            for guid in batch {
                if !seen.insert(guid.clone()) {
                    continue;
                }
                // Removed since the page was read.
                let record = match self.storage.get(&guid) {
                    Ok(record) => record,
                    Err(StorageError::NotFound(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                let changed: BTreeMap<String, PropertyMeta> = record
                    .all()?
                    .into_iter()
                    .filter(|(_, meta)| range.contains(meta.seqno))
                    .collect();
                if !changed.is_empty() {
                    diff.records.push(DiffRecord { guid, diff: changed });
                }
                tokio::task::yield_now().await;
            }

            if !full {
                break;
            }
            cursor = last + 1;
        }

        debug!(
            resource = %self.name(),
            range = %range,
            documents = diff.records.len(),
            "Diff collected"
        );
        Ok(diff)
    }

    /// `(seqno, guid)` pairs matching `query`, ordered by seqno then guid.
    fn seqno_page(&self, query: &str, limit: Option<usize>) -> Result<Vec<(u64, String)>> {
        let request = FindRequest {
            query: Some(query.to_string()),
            order_by: vec![SEQNO.to_string()],
            limit,
            include_deleted: true,
            ..Default::default()
        };
        let result = self.proxy.find(&request).map_err(query_error)?;
        Ok(result
            .hits
            .into_iter()
            .map(|hit| {
                let seqno = hit.doc.prop(SEQNO).and_then(|v| v.as_u64()).unwrap_or_default();
                (seqno, hit.doc.guid)
            })
            .collect())
    }

    /// Applies an incoming diff with last-writer-wins per property.
    ///
    /// `blobs` holds the payloads of BLOB properties present in `diff`; the writer
    /// stores a payload only when its property wins, before the property file. With `touch` the accepted properties get a
    /// fresh local seqno so they travel on to other peers. Returns whether anything
    /// was accepted.
    pub async fn merge(
        &self,
        guid: &str,
        diff: BTreeMap<String, PropertyMeta>,
        mut blobs: BTreeMap<String, Vec<u8>>,
        touch: bool,
    ) -> Result<bool> {
        validate_name(guid).map_err(|e| Error::InvalidValue(e.to_string()))?;

        let mut op = StoreOp::new(guid, StoreKind::Merge { touch });
        for (name, meta) in diff {
            if name == MTIME || name == SEQNO {
                continue;
            }
            let Some(desc) = self.metadata.get(&name) else {
                warn!(resource = %self.name(), guid = %guid, prop = %name, "Skipping unknown property");
                continue;
            };

            if desc.blob {
                if let Some(data) = blobs.remove(&name) {
                    let blob: BlobRef = serde_json::from_value(meta.value.clone())?;
                    let digest = hex::encode(Sha1::digest(&data));
                    if digest != blob.digest {
                        warn!(
                            resource = %self.name(),
                            guid = %guid,
                            prop = %name,
                            "Blob payload does not match its digest"
                        );
                        continue;
                    }
                    op.blobs.insert(name.clone(), data);
                }
            }
            op.props.insert(name, meta);
        }

        if op.props.is_empty() {
            return Ok(false);
        }
        let accepted = self.writer.store(op).await?;
        debug!(resource = %self.name(), guid = %guid, accepted, "Merged diff");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::{Metadata, PropertyDescriptor, Typecast};
    use crate::volume::{EventFilter, EventKind, Volume};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn resources() -> Vec<Metadata> {
        vec![Metadata::new(
            "context",
            vec![
                PropertyDescriptor::new("title", Typecast::Str)
                    .slot(10)
                    .prefix("T")
                    .full_text(),
                PropertyDescriptor::new("k", Typecast::Int).default(json!(0)),
                PropertyDescriptor::blob("icon", "image/png"),
            ],
        )
        .unwrap()]
    }

    fn open(dir: &TempDir, page: usize) -> Volume {
        let config = Config {
            diff_page_size: page,
            ..Config::new(dir.path()).with_flush(100, Duration::ZERO)
        };
        Volume::open(config, resources()).unwrap()
    }

    fn meta(value: serde_json::Value, mtime: i64, seqno: u64) -> PropertyMeta {
        PropertyMeta::new(value, mtime, seqno)
    }

    #[test]
    fn test_wins() {
        assert!(wins(&meta(json!("a"), 2, 1), &meta(json!("z"), 1, 9)));
        assert!(!wins(&meta(json!("z"), 1, 9), &meta(json!("a"), 2, 1)));
        assert!(wins(&meta(json!("b"), 5, 1), &meta(json!("a"), 5, 1)));
        assert!(!wins(&meta(json!("a"), 5, 1), &meta(json!("b"), 5, 1)));
        assert!(!wins(&meta(json!("a"), 5, 1), &meta(json!("a"), 5, 2)));
    }

    #[tokio::test]
    async fn test_diff_pages_in_seqno_order() {
        let temp_dir = TempDir::new().unwrap();
        let volume = open(&temp_dir, 2);
        let directory = volume.directory("context").unwrap();

        let mut guids = Vec::new();
        for i in 0..5 {
            let props = json!({"title": format!("t{}", i)}).as_object().cloned().unwrap();
            guids.push(directory.create(props).await.unwrap());
        }
        let props = json!({"k": 7}).as_object().cloned().unwrap();
        directory.update(&guids[0], props).await.unwrap();

        let diff = directory.diff(&Sequence::from_start(1)).await.unwrap();
        let order: Vec<&str> = diff.records.iter().map(|r| r.guid.as_str()).collect();
        let mut expected: Vec<&str> = guids[1..].iter().map(String::as_str).collect();
        expected.push(&guids[0]);
        assert_eq!(order, expected);
        assert_eq!(diff.seqno, 6);

        let diff = directory.diff(&Sequence::from(vec![(6, None)])).await.unwrap();
        assert_eq!(diff.records.len(), 1);
        assert_eq!(diff.records[0].diff.keys().collect::<Vec<_>>(), vec!["k"]);
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_diff_covers_documents_sharing_a_seqno() {
        let temp_dir = TempDir::new().unwrap();
        let volume = open(&temp_dir, 2);
        let directory = volume.directory("context").unwrap();

        for guid in ["ga", "gb", "gc"] {
            let mut diff = BTreeMap::new();
            diff.insert("guid".to_string(), meta(json!(guid), 7, 5));
            diff.insert("title".to_string(), meta(json!(guid), 7, 5));
            assert!(directory.merge(guid, diff, BTreeMap::new(), false).await.unwrap());
        }
        let local = directory
            .create(json!({"title": "local"}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let diff = directory.diff(&Sequence::from_start(1)).await.unwrap();
        let order: Vec<&str> = diff.records.iter().map(|r| r.guid.as_str()).collect();
        assert_eq!(order, vec![local.as_str(), "ga", "gb", "gc"]);

        let diff = directory.diff(&Sequence::from(vec![(5, Some(5))])).await.unwrap();
        assert_eq!(diff.records.len(), 3);
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_last_writer_wins() {
        let temp_dir = TempDir::new().unwrap();
        let volume = open(&temp_dir, 256);
        let directory = volume.directory("context").unwrap();
        let mut events = volume.subscribe(EventFilter::default());

        let mut diff = BTreeMap::new();
        diff.insert("guid".to_string(), meta(json!("g"), 10, 4));
        diff.insert("title".to_string(), meta(json!("remote"), 10, 4));
        assert!(directory.merge("g", diff, BTreeMap::new(), false).await.unwrap());
        assert_eq!(events.recv().await.unwrap().event, EventKind::Create);

        let doc = directory.get("g").unwrap();
        assert_eq!(doc.meta("title").unwrap(), Some(meta(json!("remote"), 10, 4)));

        let mut stale = BTreeMap::new();
        stale.insert("title".to_string(), meta(json!("old"), 9, 8));
        assert!(!directory.merge("g", stale, BTreeMap::new(), true).await.unwrap());

        let mut newer = BTreeMap::new();
        newer.insert("title".to_string(), meta(json!("newer"), 11, 8));
        newer.insert("bogus".to_string(), meta(json!(1), 11, 8));
        assert!(directory.merge("g", newer, BTreeMap::new(), true).await.unwrap());
        assert_eq!(events.recv().await.unwrap().event, EventKind::Update);

        let title = directory.get("g").unwrap().meta("title").unwrap().unwrap();
        assert_eq!(title.value, json!("newer"));
        assert_eq!(title.mtime, 11);
        assert_eq!(title.seqno, volume.seqno());
        volume.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_blob() {
        let temp_dir = TempDir::new().unwrap();
        let volume = open(&temp_dir, 256);
        let directory = volume.directory("context").unwrap();

        let data = b"payload".to_vec();
        let blob = BlobRef {
            digest: hex::encode(Sha1::digest(&data)),
            size: data.len() as u64,
            mime_type: "image/png".into(),
            url: None,
        };
        let mut diff = BTreeMap::new();
        diff.insert("guid".to_string(), meta(json!("g"), 3, 1));
        diff.insert("title".to_string(), meta(json!("t"), 3, 1));
        diff.insert("icon".to_string(), meta(serde_json::to_value(&blob).unwrap(), 3, 1));
        let mut blobs = BTreeMap::new();
        blobs.insert("icon".to_string(), data.clone());

        assert!(directory.merge("g", diff, blobs, false).await.unwrap());
        let fetched = directory.get_blob("g", "icon").await.unwrap();
        assert_eq!(fetched.data, data);
        assert_eq!(fetched.meta, blob);
        volume.close().await.unwrap();
    }

    fn blob_diff(
        guid: &str,
        data: &[u8],
        mtime: i64,
    ) -> (BTreeMap<String, PropertyMeta>, BTreeMap<String, Vec<u8>>) {
        let blob = BlobRef {
            digest: hex::encode(Sha1::digest(data)),
            size: data.len() as u64,
            mime_type: "image/png".into(),
            url: None,
        };
        let mut diff = BTreeMap::new();
        diff.insert("guid".to_string(), meta(json!(guid), mtime, 1));
        diff.insert("icon".to_string(), meta(serde_json::to_value(&blob).unwrap(), mtime, 1));
        let mut blobs = BTreeMap::new();
        blobs.insert("icon".to_string(), data.to_vec());
        (diff, blobs)
    }

    #[tokio::test]
    async fn test_merge_new_document_with_blob_is_created() {
        let temp_dir = TempDir::new().unwrap();
        let volume = open(&temp_dir, 256);
        let directory = volume.directory("context").unwrap();
        let mut events = volume.subscribe(EventFilter::default());

        let (diff, blobs) = blob_diff("g", b"first", 10);
        assert!(directory.merge("g", diff, blobs, false).await.unwrap());
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, EventKind::Create);
        assert_eq!(event.guid.as_deref(), Some("g"));

        // A losing payload never reaches the disk.
        let (diff, blobs) = blob_diff("g", b"stale", 5);
        assert!(!directory.merge("g", diff, blobs, false).await.unwrap());
        assert_eq!(directory.get_blob("g", "icon").await.unwrap().data, b"first");
        volume.close().await.unwrap();
    }
}
