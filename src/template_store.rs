//! Per-agent template cache
//!
//! Maps `(agent, domain, template ID)` to the last template the agent
//! announced. Decode workers read and write it concurrently; it is dumped to
//! disk on shutdown and reloaded on startup so data sets decode before the
//! agent re-sends its templates.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use flowmirror_common::{TemplateCache, TemplateRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{FlowmirrorError, Result};

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TemplateKey {
    pub agent: String,
    pub domain: u32,
    pub template_id: u16,
}

impl TemplateKey {
    pub fn new(agent: &str, domain: u32, template_id: u16) -> Self {
        Self {
            agent: agent.to_string(),
            domain,
            template_id,
        }
    }
}

/// One persisted template
#[derive(Debug, Serialize, Deserialize)]
struct TemplateEntry {
    agent: String,
    domain: u32,
    template: TemplateRecord,
}

/// Thread-safe template cache shared by the decode workers of one protocol
#[derive(Clone)]
pub struct TemplateStore {
    inner: Arc<DashMap<TemplateKey, Arc<TemplateRecord>>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Look up a template
    pub fn get(&self, agent: &str, domain: u32, template_id: u16) -> Option<Arc<TemplateRecord>> {
        self.inner
            .get(&TemplateKey::new(agent, domain, template_id))
            .map(|r| Arc::clone(r.value()))
    }

    /// Insert or replace a template; agents re-send IDs with new layouts after a reload
    pub fn put(&self, agent: &str, domain: u32, template: TemplateRecord) {
        let key = TemplateKey::new(agent, domain, template.template_id);
        self.inner.insert(key, Arc::new(template));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All entries, ordered by key
    pub fn entries(&self) -> Vec<(TemplateKey, Arc<TemplateRecord>)> {
        let mut entries: Vec<_> = self
            .inner
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(r.value())))
            .collect();
        entries.sort_by(|(a, _), (b, _)| {
            (&a.agent, a.domain, a.template_id).cmp(&(&b.agent, b.domain, b.template_id))
        });
        entries
    }

    /// Write every template to `path` as JSON
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let entries: Vec<TemplateEntry> = self
            .entries()
            .into_iter()
            .map(|(key, template)| TemplateEntry {
                agent: key.agent,
                domain: key.domain,
                template: (*template).clone(),
            })
            .collect();
        let json = serde_json::to_vec_pretty(&entries)?;
        fs::write(path, json)?;
        info!("Dumped {} templates to {}", entries.len(), path.display());
        Ok(())
    }

    /// Load templates from `path`, keeping any template already learned live.
    ///
    /// A missing file loads nothing. Returns the number of templates inserted.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No template cache at {}, starting empty", path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<TemplateEntry> = serde_json::from_slice(&data).map_err(|e| {
            FlowmirrorError::TemplateStoreError(format!("{}: {}", path.display(), e))
        })?;

        let mut loaded = 0;
        for entry in entries {
            let key = TemplateKey::new(&entry.agent, entry.domain, entry.template.template_id);
            self.inner.entry(key).or_insert_with(|| {
                loaded += 1;
                Arc::new(entry.template)
            });
        }
        debug!("Loaded {} templates from {}", loaded, path.display());
        Ok(loaded)
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCache for TemplateStore {
    fn get(&self, agent: &str, domain: u32, template_id: u16) -> Option<Arc<TemplateRecord>> {
        TemplateStore::get(self, agent, domain, template_id)
    }

    fn put(&self, agent: &str, domain: u32, template: TemplateRecord) {
        TemplateStore::put(self, agent, domain, template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmirror_common::FieldSpecifier;

    fn template(id: u16, fields: usize) -> TemplateRecord {
        TemplateRecord::new(
            id,
            (0..fields).map(|i| FieldSpecifier::new(i as u16 + 1, 4)).collect(),
        )
    }

    #[test]
    fn test_put_and_get() {
        let store = TemplateStore::new();
        store.put("10.0.0.1", 0, template(256, 2));

        let found = store.get("10.0.0.1", 0, 256).expect("Should find template");
        assert_eq!(found.fields.len(), 2);
        assert!(store.get("10.0.0.1", 1, 256).is_none());
        assert!(store.get("10.0.0.2", 0, 256).is_none());
    }

    #[test]
    fn test_put_overwrites() {
        let store = TemplateStore::new();
        store.put("10.0.0.1", 0, template(256, 2));
        store.put("10.0.0.1", 0, template(256, 5));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("10.0.0.1", 0, 256).unwrap().fields.len(), 5);
    }

    #[test]
    fn test_dump_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");

        let store = TemplateStore::new();
        store.put("10.0.0.1", 0, template(256, 2));
        store.put("10.0.0.2", 7, template(300, 3));
        store.dump(&path).unwrap();

        let restored = TemplateStore::new();
        assert_eq!(restored.load(&path).unwrap(), 2);
        assert_eq!(restored.entries().len(), 2);
        assert_eq!(restored.get("10.0.0.2", 7, 300).unwrap().fields.len(), 3);
    }

    #[test]
    fn test_load_keeps_live_templates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");

        let old = TemplateStore::new();
        old.put("10.0.0.1", 0, template(256, 2));
        old.dump(&path).unwrap();

        let store = TemplateStore::new();
        store.put("10.0.0.1", 0, template(256, 6));
        assert_eq!(store.load(&path).unwrap(), 0);
        assert_eq!(store.get("10.0.0.1", 0, 256).unwrap().fields.len(), 6);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new();
        assert_eq!(store.load(dir.path().join("absent.json")).unwrap(), 0);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, b"{not json").unwrap();
        assert!(matches!(
            store.load(&bad),
            Err(FlowmirrorError::TemplateStoreError(_))
        ));
    }
}
