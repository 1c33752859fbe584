use crate::socket::Socket;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A named set of (uid, socket) pairs used for one-to-many delivery.
/// Membership mutation takes the write lock; broadcast works on a snapshot
/// so a slow peer never holds the group locked.
pub struct Group {
    members: RwLock<FxHashMap<u32, Arc<Socket>>>,
}

impl Group {
    fn new() -> Group {
        Group { members: RwLock::new(FxHashMap::default()) }
    }

    pub async fn add(&self, uid: u32, socket: Arc<Socket>) {
        self.members.write().await.insert(uid, socket);
    }

    /// Removes the uid only while it still maps to this very socket. A
    /// re-login may already have replaced the entry, and the evicted
    /// session must not tear the new one out of the group.
    pub async fn remove_if_same(&self, uid: u32, socket: &Arc<Socket>) {
        let mut members = self.members.write().await;
        if let Some(current) = members.get(&uid) {
            if Arc::ptr_eq(current, socket) {
                members.remove(&uid);
            }
        }
    }

    pub async fn get(&self, uid: u32) -> Option<Arc<Socket>> {
        self.members.read().await.get(&uid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn snapshot(&self) -> Vec<(u32, Arc<Socket>)> {
        self.members
            .read()
            .await
            .iter()
            .map(|(uid, s)| (*uid, s.clone()))
            .collect()
    }
}

/// Groups are created lazily on first insertion and never deleted; an empty
/// group broadcasts to nobody, which is indistinguishable from an absent one.
#[derive(Default)]
pub struct GroupManager {
    groups: RwLock<FxHashMap<String, Arc<Group>>>,
}

impl GroupManager {
    pub fn new() -> GroupManager {
        GroupManager::default()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().await.get(name).cloned()
    }

    async fn must_get(&self, name: &str) -> Arc<Group> {
        if let Some(group) = self.get(name).await {
            return group;
        }
        let mut groups = self.groups.write().await;
        groups
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Group::new()))
            .clone()
    }

    pub async fn add_to(&self, name: &str, uid: u32, socket: Arc<Socket>) {
        self.must_get(name).await.add(uid, socket).await;
    }

    pub async fn remove_from(&self, name: &str, uid: u32, socket: &Arc<Socket>) {
        if let Some(group) = self.get(name).await {
            group.remove_if_same(uid, socket).await;
        }
    }

    /// A disconnecting socket leaves every group it is in, wherever handlers
    /// may have put it.
    pub async fn remove_everywhere(&self, uid: u32, socket: &Arc<Socket>) {
        let groups: Vec<Arc<Group>> = self.groups.read().await.values().cloned().collect();
        for group in groups {
            group.remove_if_same(uid, socket).await;
        }
    }

    pub async fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
