use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

use crate::store::{EndpointInfo, SeriesEndpoint};

/// One known endpoint: a name for warnings and logs, the client handle, and
/// the advertisement from its last `Info` poll.
#[derive(Clone)]
pub struct EndpointEntry {
    pub name: String,
    pub endpoint: Arc<dyn SeriesEndpoint>,
    pub info: EndpointInfo,
}

/// Where the fan-out learns which endpoints currently exist. The orchestrator
/// depends on nothing else; discovery (static file, DNS, whatever) sits
/// behind this.
pub trait EndpointRegistry: Send + Sync + 'static {
    /// Current entries, sorted by name so dispatch ordinals are stable
    /// between calls with the same membership.
    fn endpoints(&self) -> Vec<EndpointEntry>;
}

type EntryMap = papaya::HashMap<String, EndpointEntry, ahash::RandomState>;

/// A registry fed by explicit register/deregister calls. Reads never block;
/// `refresh` re-polls every member's `Info` and keeps the old advertisement
/// when a poll fails.
#[derive(Default)]
pub struct StaticRegistry {
    entries: EntryMap,
}

impl StaticRegistry {
    pub fn new() -> StaticRegistry {
        StaticRegistry {
            entries: EntryMap::default(),
        }
    }

    /// Adds or replaces an endpoint. Until the first `refresh` the entry
    /// advertises an unbounded range, so it is never pruned by mistake.
    pub fn register(&self, name: impl Into<String>, endpoint: Arc<dyn SeriesEndpoint>) {
        let name = name.into();
        let entry = EndpointEntry {
            name: name.clone(),
            endpoint,
            info: EndpointInfo::unbounded(),
        };
        self.entries.pin().insert(name, entry);
    }

    pub fn deregister(&self, name: &str) -> bool {
        self.entries.pin().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Polls `Info` on every member and stores the fresh advertisements.
    /// A member that fails the poll keeps its previous advertisement;
    /// over-advertising only costs a wasted call later, under-advertising
    /// would hide data.
    pub async fn refresh(&self) {
        let members: Vec<(String, Arc<dyn SeriesEndpoint>)> = self
            .entries
            .pin()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.endpoint.clone()))
            .collect();

        for (name, endpoint) in members {
            match endpoint.info().await {
                Ok(info) => {
                    let map = self.entries.pin();
                    let Some(current) = map.get(&name) else {
                        continue; // deregistered while we were polling
                    };
                    if advert_fingerprint(&current.info) != advert_fingerprint(&info) {
                        tracing::debug!(
                            "endpoint {} now advertises {} label sets over {}..{}",
                            name,
                            info.label_sets.len(),
                            info.min_time,
                            info.max_time
                        );
                    }
                    let mut entry = current.clone();
                    entry.info = info;
                    map.insert(name.clone(), entry);
                }
                Err(err) => {
                    tracing::warn!("info poll of endpoint {} failed: {}", name, err);
                }
            }
        }
    }
}

impl EndpointRegistry for StaticRegistry {
    fn endpoints(&self) -> Vec<EndpointEntry> {
        let mut entries: Vec<EndpointEntry> =
            self.entries.pin().iter().map(|(_, e)| e.clone()).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Collapses an advertisement to one number so refresh can log changes
/// without diffing label sets.
fn advert_fingerprint(info: &EndpointInfo) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(&info.min_time.to_le_bytes());
    hasher.update(&info.max_time.to_le_bytes());
    for set in &info.label_sets {
        hasher.update(&set.signature().to_le_bytes());
    }
    hasher.digest()
}
