//! Append-only event log store.

use crate::config::QueryOptions;
use crate::database::{Database, DatabaseOptions};
use crate::error::CoreResult;
use crate::feed::Subscription;
use crate::log::{OpKind, Operation};
use ciborium::Value;
use futures_util::stream::{BoxStream, StreamExt};

/// An immutable, append-only list of values.
///
/// Each [`add`](Self::add) records one `ADD` operation; reading yields the
/// values newest first.
#[derive(Debug)]
pub struct EventStore {
    db: Database,
}

impl EventStore {
    /// Store type name.
    pub const TYPE: &'static str = "events";

    /// Opens an event store.
    pub async fn open(options: DatabaseOptions) -> CoreResult<Self> {
        Ok(Self {
            db: Database::open(options).await?,
        })
    }

    /// Store type, always `"events"`.
    pub fn kind(&self) -> &'static str {
        Self::TYPE
    }

    /// The underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Address.
    pub fn address(&self) -> &str {
        self.db.address()
    }

    /// Subscribes to database events.
    pub fn events(&self) -> Subscription {
        self.db.events()
    }

    /// Appends `value`, returning the entry hash.
    pub async fn add(&self, value: impl Into<Value>) -> CoreResult<String> {
        self.db.add(Operation::add(value)).await
    }

    /// Returns the value recorded by entry `hash`.
    pub async fn get(&self, hash: &str) -> CoreResult<Option<Value>> {
        Ok(self.db.get(hash).await?.map(|entry| entry.payload().value.clone()))
    }

    /// Streams values newest first. Entries that are not `ADD` operations
    /// are skipped.
    pub fn iterator(&self, options: QueryOptions) -> BoxStream<'_, CoreResult<Value>> {
        self.db
            .iterator(QueryOptions::new())
            .filter_map(|entry| async move {
                match entry {
                    Ok(entry) if entry.payload().op == OpKind::Add => {
                        Some(Ok(entry.payload().value.clone()))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                }
            })
            .take(options.amount.unwrap_or(usize::MAX))
            .boxed()
    }

    /// Collects every value, newest first.
    pub async fn all(&self) -> CoreResult<Vec<Value>> {
        let mut values = self.iterator(QueryOptions::new());
        let mut all = Vec::new();
        while let Some(value) = values.next().await {
            all.push(value?);
        }
        Ok(all)
    }

    /// Closes the store.
    pub async fn close(&self) -> CoreResult<()> {
        self.db.close().await
    }

    /// Deletes all persisted data.
    pub async fn destroy(&self) -> CoreResult<()> {
        self.db.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identities;
    use crate::sync::LoopbackNetwork;
    use futures_util::TryStreamExt;
    use std::sync::Arc;

    async fn open_store() -> EventStore {
        let identities = Arc::new(Identities::new());
        let identity = identities.create_identity("userA").await.unwrap();
        EventStore::open(DatabaseOptions::new(
            "events-test",
            identity,
            identities,
            Arc::new(LoopbackNetwork::new().peer()),
        ))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn add_get_all() {
        let store = open_store().await;
        assert_eq!(store.kind(), "events");

        let hash = store.add(Value::Text("hello".into())).await.unwrap();
        store.add(Value::Bool(true)).await.unwrap();
        store.add(Value::Integer(12345.into())).await.unwrap();

        assert_eq!(store.get(&hash).await.unwrap(), Some(Value::Text("hello".into())));
        assert_eq!(
            store.all().await.unwrap(),
            vec![
                Value::Integer(12345.into()),
                Value::Bool(true),
                Value::Text("hello".into()),
            ]
        );
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn iterator_amount() {
        let store = open_store().await;
        for i in 0..4 {
            store.add(Value::Integer(i.into())).await.unwrap();
        }

        let values: Vec<Value> = store
            .iterator(QueryOptions::new().amount(2))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(values, vec![Value::Integer(3.into()), Value::Integer(2.into())]);

        let none: Vec<Value> = store
            .iterator(QueryOptions::new().amount(0))
            .try_collect()
            .await
            .unwrap();
        assert!(none.is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_add_operations_are_skipped() {
        let store = open_store().await;
        store.add(Value::Text("kept".into())).await.unwrap();
        store
            .database()
            .add(Operation::put("k", Value::Null))
            .await
            .unwrap();

        assert_eq!(store.all().await.unwrap(), vec![Value::Text("kept".into())]);
        store.close().await.unwrap();
    }
}
