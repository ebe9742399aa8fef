//! Persisted form of a queue.

use deferq_store::KeyValueStore;
use serde::{Deserialize, Serialize};

use crate::{Job, SchedulerError};

/// Everything persisted for one queue, stored under the queue id.
///
/// Encoded as `{"list": [job, ...]}` in queue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub list: Vec<Job>,
}

impl Snapshot {
    pub fn new(list: Vec<Job>) -> Self {
        Self { list }
    }

    pub fn encode(&self) -> Result<String, SchedulerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, SchedulerError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read and decode the snapshot for `queue_id`, if one is stored.
    ///
    /// Does not open the queue, so nothing is reconciled or executed.
    pub async fn load(
        store: &dyn KeyValueStore,
        queue_id: &str,
    ) -> Result<Option<Self>, SchedulerError> {
        match store.read(queue_id).await? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and write the snapshot under `queue_id`.
    pub async fn save(
        &self,
        store: &dyn KeyValueStore,
        queue_id: &str,
    ) -> Result<(), SchedulerError> {
        store.write(queue_id, &self.encode()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DueBehavior;
    use chrono::DateTime;
    use deferq_store::MemoryStore;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_empty_snapshot_encoding() {
        assert_eq!(Snapshot::default().encode().unwrap(), r#"{"list":[]}"#);
    }

    #[test]
    fn test_decode_preserves_order() {
        let raw = json!({
            "list": [
                {"id": "b", "time": 2000, "due_behavior": "execute"},
                {"id": "a", "time": 1000, "due_behavior": "ignore", "data": {"n": 1}},
            ]
        })
        .to_string();

        let snapshot = Snapshot::decode(&raw).unwrap();
        let ids: Vec<_> = snapshot.list.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(snapshot.list[1].payload.as_ref().unwrap()["n"], 1);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Snapshot::decode("{\"list\": [{\"id\": 5}]}"),
            Err(SchedulerError::Snapshot(_))
        ));
        assert!(Snapshot::decode("not json").is_err());
    }

    #[tokio::test]
    async fn test_load_and_save() {
        let store = MemoryStore::new();
        assert!(Snapshot::load(&store, "q").await.unwrap().is_none());

        let snapshot = Snapshot::new(vec![Job::new(
            "j1",
            DateTime::from_timestamp_millis(5_000).unwrap(),
        )]);
        snapshot.save(&store, "q").await.unwrap();

        assert_eq!(Snapshot::load(&store, "q").await.unwrap(), Some(snapshot));
    }

    fn arb_payload() -> impl Strategy<Value = Option<crate::Payload>> {
        proptest::option::of(
            prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..4).prop_map(|m| {
                m.into_iter()
                    .map(|(k, v)| (k, json!(v)))
                    .collect::<crate::Payload>()
            }),
        )
    }

    fn arb_job() -> impl Strategy<Value = Job> {
        (
            "[a-zA-Z0-9_-]{1,16}",
            0i64..4_000_000_000_000,
            arb_payload(),
            any::<bool>(),
        )
            .prop_map(|(id, millis, payload, execute)| Job {
                id,
                due_time: DateTime::from_timestamp_millis(millis).unwrap(),
                payload,
                due_behavior: if execute {
                    DueBehavior::Execute
                } else {
                    DueBehavior::Ignore
                },
            })
    }

    proptest! {
        // Decoding an encoded snapshot yields the same ordered job list
        #[test]
        fn snapshot_roundtrip(list in prop::collection::vec(arb_job(), 0..20)) {
            let snapshot = Snapshot::new(list);
            let decoded = Snapshot::decode(&snapshot.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, snapshot);
        }
    }
}
