//! Shared fakes for sync integration tests
//!
//! `MemoryRemoteStore` keeps objects in a map keyed by their path below the
//! remote root and issues counter fingerprints (`v1`, `v2`, ...).
//! `MemoryMaterializer` keeps the local tree in memory and reports its own
//! mutations as watcher events, the way a real host does, so suppression is
//! exercised end to end.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hydrasync_core::config::{Config, ConfigBuilder};
use hydrasync_core::domain::{
    ByteRange, ChangeEvent, ChangeKind, Fingerprint, ItemAttributes, ItemKind, ItemMetadata,
    LocalEntry, LockRecord, LockToken, OperationId, PinState, PlaceholderBlob, RemoteDescriptor,
    RemoteId, RemoteLocator, RemoteNotification, SyncPath,
};
use hydrasync_core::ports::{IMaterializer, IRemoteStore, RemoteResult, RemoteStoreError};
use hydrasync_sync::outbound::OutboundSync;
use hydrasync_sync::walker::{ReconcileWalker, WalkReport};
use hydrasync_sync::SyncContext;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const LOCAL_ROOT: &str = "/sync";
pub const REMOTE_ROOT: &str = "https://store.test/root/";
pub const TEST_OWNER: &str = "hydrasync-test";

pub fn config() -> ConfigBuilder {
    ConfigBuilder::new()
        .local_root(PathBuf::from(LOCAL_ROOT))
        .remote_root(REMOTE_ROOT)
        .suppression_grace_ms(200)
}

pub fn local(rel: &str) -> SyncPath {
    SyncPath::new(Path::new(LOCAL_ROOT).join(rel)).unwrap()
}

// ============================================================================
// Remote store
// ============================================================================

#[derive(Debug, Clone)]
struct RemoteNode {
    name: String,
    kind: ItemKind,
    content: Vec<u8>,
    version: u64,
    modified_at: DateTime<Utc>,
    id: u64,
    lock: Option<LockRecord>,
}

pub struct MemoryRemoteStore {
    root: RemoteLocator,
    nodes: Mutex<BTreeMap<String, RemoteNode>>,
    subscribers: Mutex<Vec<mpsc::Sender<RemoteNotification>>>,
    next_id: AtomicU64,
    mutations: AtomicUsize,
    writes: AtomicUsize,
    list_calls: AtomicUsize,
    list_gate: tokio::sync::Mutex<()>,
    lock_calls: AtomicUsize,
    lock_gate: tokio::sync::Mutex<()>,
    auth_expired: AtomicBool,
    push_disabled: AtomicBool,
    withhold_fingerprints: AtomicBool,
    break_get_after_write: AtomicBool,
    get_broken: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let store = Self {
            root: RemoteLocator::parse(REMOTE_ROOT).unwrap(),
            nodes: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            mutations: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            list_gate: tokio::sync::Mutex::new(()),
            lock_calls: AtomicUsize::new(0),
            lock_gate: tokio::sync::Mutex::new(()),
            auth_expired: AtomicBool::new(false),
            push_disabled: AtomicBool::new(false),
            withhold_fingerprints: AtomicBool::new(false),
            break_get_after_write: AtomicBool::new(false),
            get_broken: AtomicBool::new(false),
        };
        store.insert("", ItemKind::Folder, Vec::new());
        store
    }

    pub fn locator(&self, rel: &str, kind: ItemKind) -> RemoteLocator {
        if rel.is_empty() {
            return self.root.clone();
        }
        let suffix = match kind {
            ItemKind::Folder => format!("{rel}/"),
            ItemKind::File => rel.to_string(),
        };
        RemoteLocator::from_url(self.root.as_url().join(&suffix).unwrap()).unwrap()
    }

    // --- seeding, not observable through notifications ---

    pub fn seed_folder(&self, rel: &str) {
        self.insert(rel, ItemKind::Folder, Vec::new());
    }

    pub fn seed_file(&self, rel: &str, content: &[u8]) {
        self.insert(rel, ItemKind::File, content.to_vec());
    }

    // --- another client's edits, notified without correlation ---

    pub fn external_write(&self, rel: &str, content: &[u8]) -> Fingerprint {
        let fp = {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.get_mut(rel).expect("external write to a missing file");
            node.content = content.to_vec();
            node.version += 1;
            node.modified_at = Utc::now();
            fingerprint_of(node)
        };
        self.publish(ChangeKind::Updated, self.locator(rel, ItemKind::File), None, None);
        fp
    }

    pub fn external_create_file(&self, rel: &str, content: &[u8]) {
        self.insert(rel, ItemKind::File, content.to_vec());
        self.publish(ChangeKind::Created, self.locator(rel, ItemKind::File), None, None);
    }

    pub fn external_delete(&self, rel: &str) {
        let kind = self.remove_subtree(rel).expect("external delete of a missing item");
        self.publish(ChangeKind::Deleted, self.locator(rel, kind), None, None);
    }

    pub fn external_lock(&self, rel: &str, owner: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(rel).expect("external lock on a missing file");
        node.lock = Some(LockRecord::new(LockToken::new(format!("ext-{rel}")), owner, true));
    }

    /// Publish a notification as if a mutation happened
    pub fn notify_changed(&self, rel: &str, kind: ItemKind) {
        self.publish(ChangeKind::Updated, self.locator(rel, kind), None, None);
    }

    // --- failure injection ---

    pub fn expire_session(&self) {
        self.auth_expired.store(true, Ordering::SeqCst);
    }

    pub fn disable_push(&self) {
        self.push_disabled.store(true, Ordering::SeqCst);
    }

    /// Writes and creates stop returning the new fingerprint
    pub fn withhold_fingerprints(&self) {
        self.withhold_fingerprints.store(true, Ordering::SeqCst);
    }

    /// `get` fails as unavailable once the next write or create succeeds
    pub fn break_get_after_write(&self) {
        self.break_get_after_write.store(true, Ordering::SeqCst);
    }

    /// Hold list calls until the guard is dropped
    pub async fn pause_listing(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.list_gate.lock().await
    }

    /// Hold lock calls until the guard is dropped
    pub async fn pause_locking(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock_gate.lock().await
    }

    // --- inspection ---

    pub fn exists(&self, rel: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(rel)
    }

    pub fn content(&self, rel: &str) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(rel).map(|n| n.content.clone())
    }

    pub fn fingerprint(&self, rel: &str) -> Option<Fingerprint> {
        self.nodes.lock().unwrap().get(rel).map(fingerprint_of)
    }

    pub fn lock_owner(&self, rel: &str) -> Option<String> {
        self.nodes
            .lock()
            .unwrap()
            .get(rel)
            .and_then(|n| n.lock.as_ref().map(|l| l.owner().to_string()))
    }

    /// Creates, writes, deletes and moves issued through the port
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn lock_calls(&self) -> usize {
        self.lock_calls.load(Ordering::SeqCst)
    }

    // --- internals ---

    fn insert(&self, rel: &str, kind: ItemKind, content: Vec<u8>) {
        let name = rel.rsplit('/').next().unwrap_or_default().to_string();
        let node = RemoteNode {
            name,
            kind,
            content,
            version: 1,
            modified_at: Utc::now(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            lock: None,
        };
        self.nodes.lock().unwrap().insert(rel.to_string(), node);
    }

    fn remove_subtree(&self, rel: &str) -> Option<ItemKind> {
        let mut nodes = self.nodes.lock().unwrap();
        let kind = nodes.remove(rel)?.kind;
        let prefix = format!("{rel}/");
        nodes.retain(|key, _| !key.starts_with(&prefix));
        Some(kind)
    }

    fn publish(
        &self,
        kind: ChangeKind,
        locator: RemoteLocator,
        new_locator: Option<RemoteLocator>,
        correlation: Option<OperationId>,
    ) {
        let mut notification = RemoteNotification::new(kind, locator);
        notification.new_locator = new_locator;
        notification.correlation = correlation;
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.try_send(notification.clone()).is_ok() || !tx.is_closed());
    }

    /// What a successful write or create hands back
    fn written(&self, fp: Option<Fingerprint>) -> Option<Fingerprint> {
        if self.break_get_after_write.swap(false, Ordering::SeqCst) {
            self.get_broken.store(true, Ordering::SeqCst);
        }
        fp.filter(|_| !self.withhold_fingerprints.load(Ordering::SeqCst))
    }

    fn check_session(&self) -> RemoteResult<()> {
        if self.auth_expired.load(Ordering::SeqCst) {
            return Err(RemoteStoreError::AuthenticationRequired);
        }
        Ok(())
    }

    /// Map key of `locator`, whose kind must match the stored node
    fn key_of(&self, locator: &RemoteLocator) -> RemoteResult<String> {
        let rel = locator
            .as_url()
            .path()
            .strip_prefix(self.root.as_url().path())
            .ok_or_else(|| RemoteStoreError::NotFound(locator.clone()))?
            .trim_end_matches('/')
            .to_string();
        Ok(rel)
    }

    fn existing(&self, locator: &RemoteLocator) -> RemoteResult<(String, RemoteNode)> {
        let key = self.key_of(locator)?;
        let nodes = self.nodes.lock().unwrap();
        match nodes.get(&key) {
            Some(node) if (node.kind == ItemKind::Folder) == locator.is_folder() => {
                Ok((key, node.clone()))
            }
            _ => Err(RemoteStoreError::NotFound(locator.clone())),
        }
    }

    fn descriptor(node: &RemoteNode) -> RemoteDescriptor {
        RemoteDescriptor {
            name: node.name.clone(),
            kind: node.kind,
            size: node.content.len() as u64,
            created_at: node.modified_at,
            modified_at: node.modified_at,
            accessed_at: node.modified_at,
            attributes: ItemAttributes::default(),
            fingerprint: Some(fingerprint_of(node)),
            remote_id: RemoteId::new(format!("id-{}", node.id)).unwrap(),
            lock: node.lock.clone(),
        }
    }
}

fn fingerprint_of(node: &RemoteNode) -> Fingerprint {
    Fingerprint::new(format!("v{}", node.version)).unwrap()
}

fn parent_key(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    Some(key.rsplit_once('/').map_or("", |(parent, _)| parent))
}

#[async_trait]
impl IRemoteStore for MemoryRemoteStore {
    async fn list(
        &self,
        folder: &RemoteLocator,
        _pattern: Option<&str>,
    ) -> RemoteResult<Vec<RemoteDescriptor>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        drop(self.list_gate.lock().await);
        self.check_session()?;

        let (key, node) = self.existing(folder)?;
        if node.kind != ItemKind::Folder {
            return Err(RemoteStoreError::NotFound(folder.clone()));
        }
        let nodes = self.nodes.lock().unwrap();
        Ok(nodes
            .iter()
            .filter(|(k, _)| parent_key(k) == Some(key.as_str()))
            .map(|(_, n)| Self::descriptor(n))
            .collect())
    }

    async fn get(&self, locator: &RemoteLocator) -> RemoteResult<RemoteDescriptor> {
        self.check_session()?;
        if self.get_broken.load(Ordering::SeqCst) {
            return Err(RemoteStoreError::Unavailable("metadata service down".into()));
        }
        let (_, node) = self.existing(locator)?;
        Ok(Self::descriptor(&node))
    }

    async fn read(&self, locator: &RemoteLocator, range: ByteRange) -> RemoteResult<Vec<u8>> {
        self.check_session()?;
        let (_, node) = self.existing(locator)?;
        let (start, end) = range.bounds(node.content.len());
        Ok(node.content[start..end].to_vec())
    }

    async fn write(
        &self,
        locator: &RemoteLocator,
        content: &[u8],
        _metadata: &ItemMetadata,
        expected: Option<&Fingerprint>,
        correlation: OperationId,
    ) -> RemoteResult<Option<Fingerprint>> {
        self.check_session()?;
        let (key, _) = self.existing(locator)?;
        let fp = {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(&key)
                .ok_or_else(|| RemoteStoreError::NotFound(locator.clone()))?;
            let current = fingerprint_of(node);
            if expected.is_some_and(|e| *e != current) {
                return Err(RemoteStoreError::PreconditionFailed {
                    locator: locator.clone(),
                    actual: Some(current),
                });
            }
            node.content = content.to_vec();
            node.version += 1;
            node.modified_at = Utc::now();
            fingerprint_of(node)
        };
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeKind::Updated, locator.clone(), None, Some(correlation));
        Ok(self.written(Some(fp)))
    }

    async fn create(
        &self,
        locator: &RemoteLocator,
        metadata: &ItemMetadata,
        content: Option<&[u8]>,
        correlation: OperationId,
    ) -> RemoteResult<Option<Fingerprint>> {
        self.check_session()?;
        let key = self.key_of(locator)?;
        {
            let nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get(&key) {
                return Err(RemoteStoreError::PreconditionFailed {
                    locator: locator.clone(),
                    actual: Some(fingerprint_of(node)),
                });
            }
            let parent = parent_key(&key).unwrap_or_default();
            if !nodes.get(parent).is_some_and(|n| n.kind == ItemKind::Folder) {
                return Err(RemoteStoreError::NotFound(locator.clone()));
            }
        }

        let body = match metadata.kind {
            ItemKind::File => content.unwrap_or_default().to_vec(),
            ItemKind::Folder => Vec::new(),
        };
        self.insert(&key, metadata.kind, body);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeKind::Created, locator.clone(), None, Some(correlation));
        Ok(self.written(self.fingerprint(&key)))
    }

    async fn delete(&self, locator: &RemoteLocator, correlation: OperationId) -> RemoteResult<()> {
        self.check_session()?;
        let (key, _) = self.existing(locator)?;
        self.remove_subtree(&key);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeKind::Deleted, locator.clone(), None, Some(correlation));
        Ok(())
    }

    async fn move_item(
        &self,
        from: &RemoteLocator,
        to: &RemoteLocator,
        correlation: OperationId,
    ) -> RemoteResult<()> {
        self.check_session()?;
        let (from_key, _) = self.existing(from)?;
        let to_key = self.key_of(to)?;
        {
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&to_key) {
                return Err(RemoteStoreError::PreconditionFailed {
                    locator: to.clone(),
                    actual: nodes.get(&to_key).map(fingerprint_of),
                });
            }
            let prefix = format!("{from_key}/");
            let moved: Vec<String> = nodes
                .keys()
                .filter(|k| **k == from_key || k.starts_with(&prefix))
                .cloned()
                .collect();
            for key in moved {
                if let Some(mut node) = nodes.remove(&key) {
                    let new_key = format!("{to_key}{}", &key[from_key.len()..]);
                    if key == from_key {
                        node.name = to_key.rsplit('/').next().unwrap_or_default().to_string();
                    }
                    nodes.insert(new_key, node);
                }
            }
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeKind::Moved, from.clone(), Some(to.clone()), Some(correlation));
        Ok(())
    }

    async fn lock(&self, locator: &RemoteLocator) -> RemoteResult<LockRecord> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        drop(self.lock_gate.lock().await);
        self.check_session()?;
        let (key, _) = self.existing(locator)?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&key)
            .ok_or_else(|| RemoteStoreError::NotFound(locator.clone()))?;
        if let Some(held) = node.lock.as_ref().filter(|l| !l.is_expired()) {
            return Err(RemoteStoreError::Locked {
                locator: locator.clone(),
                owner: held.owner().to_string(),
            });
        }
        let token = LockToken::new(format!("lock-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let record = LockRecord::new(token, TEST_OWNER, true);
        node.lock = Some(record.clone());
        Ok(record)
    }

    async fn unlock(&self, locator: &RemoteLocator, token: &LockToken) -> RemoteResult<()> {
        self.check_session()?;
        let (key, _) = self.existing(locator)?;
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(&key) {
            if node.lock.as_ref().is_some_and(|l| l.token() == token) {
                node.lock = None;
            }
        }
        Ok(())
    }

    async fn subscribe_changes(&self) -> RemoteResult<mpsc::Receiver<RemoteNotification>> {
        self.check_session()?;
        if self.push_disabled.load(Ordering::SeqCst) {
            return Err(RemoteStoreError::Unavailable("push channel not supported".into()));
        }
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

// ============================================================================
// Materializer
// ============================================================================

#[derive(Debug, Clone)]
struct LocalNode {
    kind: ItemKind,
    content: Vec<u8>,
    size: u64,
    is_placeholder: bool,
    in_sync: bool,
    hydrated: bool,
    modified_at: DateTime<Utc>,
    blob: Vec<u8>,
    pin: PinState,
}

impl LocalNode {
    fn user_folder() -> Self {
        Self {
            kind: ItemKind::Folder,
            content: Vec::new(),
            size: 0,
            is_placeholder: false,
            in_sync: false,
            hydrated: true,
            modified_at: Utc::now(),
            blob: Vec::new(),
            pin: PinState::Unspecified,
        }
    }
}

pub struct MemoryMaterializer {
    root: PathBuf,
    nodes: Mutex<BTreeMap<PathBuf, LocalNode>>,
    events: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    source: Arc<MemoryRemoteStore>,
}

impl MemoryMaterializer {
    pub fn new(source: Arc<MemoryRemoteStore>) -> Self {
        let root = PathBuf::from(LOCAL_ROOT);
        let mut nodes = BTreeMap::new();
        let mut root_node = LocalNode::user_folder();
        root_node.in_sync = true;
        nodes.insert(root.clone(), root_node);
        Self {
            root,
            nodes: Mutex::new(nodes),
            events: Mutex::new(None),
            source,
        }
    }

    /// Start reporting changes; earlier changes are not replayed
    pub fn events(&self) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel(1024);
        *self.events.lock().unwrap() = Some(tx);
        rx
    }

    // --- the user's edits ---

    pub fn user_write(&self, rel: &str, content: &[u8]) {
        let path = self.abs(rel);
        let kind = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(&path) {
                Some(node) => {
                    node.content = content.to_vec();
                    node.size = content.len() as u64;
                    node.hydrated = true;
                    node.in_sync = false;
                    node.modified_at = Utc::now();
                    ChangeKind::Updated
                }
                None => {
                    nodes.insert(
                        path.clone(),
                        LocalNode {
                            kind: ItemKind::File,
                            content: content.to_vec(),
                            size: content.len() as u64,
                            ..LocalNode::user_folder()
                        },
                    );
                    ChangeKind::Created
                }
            }
        };
        self.emit(ChangeEvent::local(kind, path));
    }

    pub fn user_create_folder(&self, rel: &str) {
        let path = self.abs(rel);
        self.nodes
            .lock()
            .unwrap()
            .insert(path.clone(), LocalNode::user_folder());
        self.emit(ChangeEvent::local(ChangeKind::Created, path));
    }

    pub fn user_delete(&self, rel: &str) {
        let path = self.abs(rel);
        self.remove_subtree(&path);
        self.emit(ChangeEvent::local(ChangeKind::Deleted, path));
    }

    pub fn user_rename(&self, from: &str, to: &str) {
        let (from, to) = (self.abs(from), self.abs(to));
        {
            let mut nodes = self.nodes.lock().unwrap();
            let moved: Vec<PathBuf> = nodes.keys().filter(|k| k.starts_with(&from)).cloned().collect();
            for key in moved {
                if let Some(node) = nodes.remove(&key) {
                    let suffix = key.strip_prefix(&from).unwrap_or(Path::new(""));
                    let target = if suffix.as_os_str().is_empty() {
                        to.clone()
                    } else {
                        to.join(suffix)
                    };
                    nodes.insert(target, node);
                }
            }
        }
        self.emit(ChangeEvent::local_move(from, to));
    }

    pub fn set_pin(&self, rel: &str, pin: PinState) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&self.abs(rel)) {
            node.pin = pin;
        }
    }

    // --- inspection ---

    pub fn exists(&self, rel: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(&self.abs(rel))
    }

    pub fn content(&self, rel: &str) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(&self.abs(rel)).map(|n| n.content.clone())
    }

    pub fn is_in_sync(&self, rel: &str) -> bool {
        self.nodes.lock().unwrap().get(&self.abs(rel)).is_some_and(|n| n.in_sync)
    }

    pub fn is_hydrated(&self, rel: &str) -> bool {
        self.nodes.lock().unwrap().get(&self.abs(rel)).is_some_and(|n| n.hydrated)
    }

    pub fn is_placeholder_item(&self, rel: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(&self.abs(rel))
            .is_some_and(|n| n.is_placeholder)
    }

    pub fn blob(&self, rel: &str) -> PlaceholderBlob {
        let bytes = self
            .nodes
            .lock()
            .unwrap()
            .get(&self.abs(rel))
            .map(|n| n.blob.clone())
            .unwrap_or_default();
        PlaceholderBlob::decode(&bytes).unwrap()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    // --- internals ---

    fn abs(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn emit(&self, event: ChangeEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.try_send(event);
        }
    }

    fn remove_subtree(&self, path: &Path) {
        self.nodes.lock().unwrap().retain(|k, _| !k.starts_with(path));
    }

    fn entry(path: &Path, node: &LocalNode) -> anyhow::Result<LocalEntry> {
        Ok(LocalEntry {
            path: SyncPath::new(path)?,
            kind: node.kind,
            is_placeholder: node.is_placeholder,
            in_sync: node.in_sync,
            hydrated: node.hydrated,
            size: node.size,
            modified_at: Some(node.modified_at),
        })
    }

    fn with_node<T>(&self, path: &SyncPath, f: impl FnOnce(&mut LocalNode) -> T) -> anyhow::Result<T> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(path.as_path())
            .ok_or_else(|| anyhow::anyhow!("no such item: {path}"))?;
        Ok(f(node))
    }

    fn remote_rel(&self, path: &SyncPath) -> anyhow::Result<String> {
        Ok(path.as_path().strip_prefix(&self.root)?.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl IMaterializer for MemoryMaterializer {
    async fn is_offline(&self, path: &SyncPath) -> anyhow::Result<bool> {
        self.with_node(path, |n| n.kind == ItemKind::Folder && !n.hydrated)
    }

    async fn is_placeholder(&self, path: &SyncPath) -> anyhow::Result<bool> {
        self.with_node(path, |n| n.is_placeholder)
    }

    async fn convert_to_placeholder(&self, path: &SyncPath, blob: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(blob.len() <= PlaceholderBlob::MAX_SIZE, "blob too large");
        self.with_node(path, |n| {
            n.is_placeholder = true;
            n.blob = blob.to_vec();
        })
    }

    async fn hydrate(&self, path: &SyncPath, _range: ByteRange) -> anyhow::Result<()> {
        let kind = self.with_node(path, |n| n.kind)?;
        if kind == ItemKind::Folder {
            return self.with_node(path, |n| n.hydrated = true);
        }
        let content = self
            .source
            .content(&self.remote_rel(path)?)
            .ok_or_else(|| anyhow::anyhow!("no remote content for {path}"))?;
        self.with_node(path, |n| {
            n.size = content.len() as u64;
            n.content = content;
            n.hydrated = true;
        })?;
        self.emit(ChangeEvent::local(ChangeKind::Updated, path.as_path()));
        Ok(())
    }

    async fn dehydrate(&self, path: &SyncPath, _range: ByteRange) -> anyhow::Result<()> {
        self.with_node(path, |n| {
            n.content.clear();
            n.hydrated = false;
        })?;
        self.emit(ChangeEvent::local(ChangeKind::Updated, path.as_path()));
        Ok(())
    }

    async fn get_custom_blob(&self, path: &SyncPath) -> anyhow::Result<Vec<u8>> {
        self.with_node(path, |n| n.blob.clone())
    }

    async fn set_custom_blob(&self, path: &SyncPath, blob: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(blob.len() <= PlaceholderBlob::MAX_SIZE, "blob too large");
        self.with_node(path, |n| n.blob = blob.to_vec())
    }

    async fn list_children(&self, folder: &SyncPath) -> anyhow::Result<Vec<LocalEntry>> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter(|(k, _)| k.parent() == Some(folder.as_path()))
            .map(|(k, n)| Self::entry(k, n))
            .collect()
    }

    async fn stat(&self, path: &SyncPath) -> anyhow::Result<Option<LocalEntry>> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(path.as_path())
            .map(|n| Self::entry(path.as_path(), n))
            .transpose()
    }

    async fn create_placeholder(
        &self,
        parent: &SyncPath,
        descriptor: &RemoteDescriptor,
        blob: &[u8],
    ) -> anyhow::Result<SyncPath> {
        let path = parent.join(&descriptor.name)?;
        {
            let mut nodes = self.nodes.lock().unwrap();
            anyhow::ensure!(nodes.contains_key(parent.as_path()), "parent missing: {parent}");
            anyhow::ensure!(!nodes.contains_key(path.as_path()), "already exists: {path}");
            nodes.insert(
                path.as_path().to_path_buf(),
                LocalNode {
                    kind: descriptor.kind,
                    content: Vec::new(),
                    size: descriptor.size,
                    is_placeholder: true,
                    in_sync: false,
                    hydrated: false,
                    modified_at: descriptor.modified_at,
                    blob: blob.to_vec(),
                    pin: PinState::Unspecified,
                },
            );
        }
        self.emit(ChangeEvent::local(ChangeKind::Created, path.as_path()));
        Ok(path)
    }

    async fn update_placeholder(
        &self,
        path: &SyncPath,
        descriptor: &RemoteDescriptor,
        content: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        self.with_node(path, |n| {
            n.size = descriptor.size;
            n.modified_at = descriptor.modified_at;
            match content {
                Some(body) => {
                    n.content = body.to_vec();
                    n.hydrated = true;
                }
                None if n.kind == ItemKind::File => {
                    n.content.clear();
                    n.hydrated = false;
                }
                None => {}
            }
        })?;
        self.emit(ChangeEvent::local(ChangeKind::Updated, path.as_path()));
        Ok(())
    }

    async fn read_content(&self, path: &SyncPath) -> anyhow::Result<Vec<u8>> {
        self.with_node(path, |n| n.content.clone())
    }

    async fn delete(&self, path: &SyncPath) -> anyhow::Result<()> {
        self.remove_subtree(path.as_path());
        self.emit(ChangeEvent::local(ChangeKind::Deleted, path.as_path()));
        Ok(())
    }

    async fn set_in_sync(&self, path: &SyncPath, in_sync: bool) -> anyhow::Result<()> {
        self.with_node(path, |n| n.in_sync = in_sync)
    }

    async fn pin_state(&self, path: &SyncPath) -> anyhow::Result<PinState> {
        self.with_node(path, |n| n.pin)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A context over the two fakes, with the walker and outbound actions
pub struct Harness {
    pub remote: Arc<MemoryRemoteStore>,
    pub local: Arc<MemoryMaterializer>,
    pub ctx: Arc<SyncContext>,
    pub outbound: Arc<OutboundSync>,
    pub walker: ReconcileWalker,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config().build())
    }

    pub fn with_config(config: Config) -> Self {
        let remote = Arc::new(MemoryRemoteStore::new());
        let local = Arc::new(MemoryMaterializer::new(remote.clone()));
        let ctx = Arc::new(SyncContext::new(&config, remote.clone(), local.clone()).unwrap());
        let outbound = Arc::new(OutboundSync::new(ctx.clone()));
        let walker = ReconcileWalker::new(ctx.clone(), outbound.clone());
        Self {
            remote,
            local,
            ctx,
            outbound,
            walker,
        }
    }

    /// Full walk from the root
    pub async fn walk(&self) -> WalkReport {
        self.walker
            .walk(vec![local("")], &CancellationToken::new())
            .await
            .unwrap()
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

pub fn fp(value: &str) -> Fingerprint {
    Fingerprint::new(value).unwrap()
}
