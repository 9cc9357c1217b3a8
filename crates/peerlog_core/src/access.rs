//! Write access policies.

use crate::log::Entry;
use async_trait::async_trait;
use std::collections::HashSet;

/// Decides whether an entry may enter a log.
///
/// Consulted for every local append (before anything is written) and for
/// every entry received from a peer.
#[async_trait]
pub trait AccessController: Send + Sync {
    /// Returns true if `entry` may be appended.
    async fn can_append(&self, entry: &Entry) -> bool;
}

#[async_trait]
impl<F> AccessController for F
where
    F: Fn(&Entry) -> bool + Send + Sync,
{
    async fn can_append(&self, entry: &Entry) -> bool {
        self(entry)
    }
}

/// Wildcard that grants write access to every identity.
pub const ANY_WRITER: &str = "*";

/// Allows writes from a fixed set of identity ids.
#[derive(Debug, Clone, Default)]
pub struct WriteAccess {
    write: HashSet<String>,
}

impl WriteAccess {
    /// Allows the given identity ids. An id of `"*"` allows everyone.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            write: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Allows every identity.
    pub fn anyone() -> Self {
        Self::new([ANY_WRITER])
    }

    /// Returns true if `identity_id` may write.
    pub fn allows(&self, identity_id: &str) -> bool {
        self.write.contains(ANY_WRITER) || self.write.contains(identity_id)
    }
}

#[async_trait]
impl AccessController for WriteAccess {
    async fn can_append(&self, entry: &Entry) -> bool {
        self.allows(&entry.identity().id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identities;
    use crate::log::{Clock, Operation};
    use ciborium::Value;

    async fn entry_by(name: &str) -> (Entry, String) {
        let identities = Identities::new();
        let identity = identities.create_identity(name).await.unwrap();
        let entry = Entry::create(
            &identities,
            &identity,
            "log",
            Operation::add(Value::Null),
            Vec::new(),
            Clock::new(identity.public_key.to_hex(), 1),
        )
        .await
        .unwrap();
        (entry, identity.id)
    }

    #[tokio::test]
    async fn write_list() {
        let (entry, id) = entry_by("userA").await;

        assert!(WriteAccess::new([id.clone()]).can_append(&entry).await);
        assert!(!WriteAccess::new(["someone-else"]).can_append(&entry).await);
        assert!(!WriteAccess::default().can_append(&entry).await);
        assert!(WriteAccess::anyone().can_append(&entry).await);
    }

    #[tokio::test]
    async fn closure_controller() {
        let (entry, id) = entry_by("userA").await;
        let only_a = move |e: &Entry| e.identity().id == id;
        let deny_all = |_: &Entry| false;

        assert!(only_a.can_append(&entry).await);
        assert!(!deny_all.can_append(&entry).await);
    }
}
