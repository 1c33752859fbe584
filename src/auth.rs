use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identity established by the handshake and stamped immutably on the
/// socket. The zero value means "anonymous"; uid 0 is never routable to a
/// peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: u32,
    pub name: String,
    pub role: String,
}

impl UserInfo {
    pub fn new(uid: u32, name: impl Into<String>, role: impl Into<String>) -> UserInfo {
        UserInfo { uid, name: name.into(), role: role.into() }
    }

    pub fn is_anonymous(&self) -> bool {
        self.uid == 0
    }
}

/// Token verification seam. The router does not inspect token shape - a
/// production deployment plugs in an RSA/JWT verifier here, tests plug in
/// one of the implementations below. Verification may do crypto work but is
/// expected to return well within the handshake timeout.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Auth: Send + Sync + 'static {
    async fn token_auth(&self, token: &[u8]) -> anyhow::Result<UserInfo>;
}

/// Admits every token and hands out sequential uids. For demos and tests.
#[derive(Default)]
pub struct FakeAuth {
    counter: AtomicU32,
}

#[async_trait]
impl Auth for FakeAuth {
    async fn token_auth(&self, _token: &[u8]) -> anyhow::Result<UserInfo> {
        let uid = self.next_uid();
        Ok(UserInfo::new(uid, format!("user-{}", uid), "user"))
    }
}

impl FakeAuth {
    fn next_uid(&self) -> u32 {
        let mut uid = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if uid == 0 {
            uid = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        }
        uid
    }
}

/// Table-backed verifier: a fixed token -> identity mapping. Deterministic
/// stand-in for the out-of-scope JWT verifier behind the same trait.
#[derive(Default)]
pub struct StaticTokenAuth {
    tokens: FxHashMap<Vec<u8>, UserInfo>,
}

impl StaticTokenAuth {
    pub fn new() -> StaticTokenAuth {
        StaticTokenAuth::default()
    }

    pub fn with_user(mut self, token: impl Into<Vec<u8>>, user: UserInfo) -> StaticTokenAuth {
        self.tokens.insert(token.into(), user);
        self
    }
}

#[async_trait]
impl Auth for StaticTokenAuth {
    async fn token_auth(&self, token: &[u8]) -> anyhow::Result<UserInfo> {
        match self.tokens.get(token) {
            Some(user) => Ok(user.clone()),
            None => bail!("invalid token"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_auth_sequential_uids() {
        let auth = FakeAuth::default();
        let a = auth.token_auth(b"whatever").await.unwrap();
        let b = auth.token_auth(b"").await.unwrap();
        assert_eq!(a.uid, 1);
        assert_eq!(b.uid, 2);
        assert_eq!(a.name, "user-1");
        assert_eq!(a.role, "user");
    }

    #[tokio::test]
    async fn test_static_token_auth() {
        let auth = StaticTokenAuth::new()
            .with_user("token-a", UserInfo::new(111, "alice", "admin"));

        let user = auth.token_auth(b"token-a").await.unwrap();
        assert_eq!(user, UserInfo::new(111, "alice", "admin"));
        assert!(auth.token_auth(b"token-b").await.is_err());
    }

    #[test]
    fn test_anonymous() {
        assert!(UserInfo::default().is_anonymous());
        assert!(!UserInfo::new(1, "n", "r").is_anonymous());
    }
}
