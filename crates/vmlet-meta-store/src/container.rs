//! Container records and the sandbox back-reference.

use crate::error::{MetaStoreError, MetaStoreResult};
use crate::record::{
    FieldReader, Fields, container_field, decode_container, delete_record, encode_container,
    encode_int, encode_state, put_field, read_fields, record_exists, record_ids, sandbox_field,
    write_fields,
};
use crate::store::{MetaStore, open_existing, open_readable};
use crate::tables::{self, FieldKey, FieldValue};
use crate::types::{ContainerInfo, ContainerSpec, ContainerState};
use redb::{ReadOnlyTable, WriteTransaction};
use std::sync::Arc;
use tracing::debug;

impl MetaStore {
    /// Create or replace the container record and point its sandbox at it.
    ///
    /// Any previous record under `container_id` is dropped first, so fields
    /// such as `startedAt` do not survive a replacement. The state always
    /// starts as `CREATED`.
    pub fn set_container(&self, container_id: &str, spec: &ContainerSpec) -> MetaStoreResult<()> {
        let fields = encode_container(spec, self.now_nanos()?)?;

        self.update(|txn| {
            let mut containers = open_existing(txn, tables::VIRTUALIZATION)?;
            let mut sandboxes = open_existing(txn, tables::SANDBOX)?;
            if !record_exists(&sandboxes, &spec.sandbox_id)? {
                return Err(MetaStoreError::SandboxNotFound(spec.sandbox_id.clone()));
            }

            delete_record(&mut containers, container_id)?;
            write_fields(&mut containers, container_id, &fields)?;
            put_field(
                &mut sandboxes,
                &spec.sandbox_id,
                sandbox_field::CONTAINER_ID,
                container_id.as_bytes(),
            )
        })?;

        debug!(
            "Stored container '{}' in sandbox '{}'",
            container_id, spec.sandbox_id
        );
        Ok(())
    }

    /// Record the container start time. A missing container is not an error.
    pub fn update_started_at(&self, container_id: &str, started_at: i64) -> MetaStoreResult<()> {
        self.update_field(
            container_id,
            container_field::STARTED_AT,
            &encode_int(started_at),
        )
    }

    /// Overwrite the container state. Any transition is accepted, and a
    /// missing container is not an error.
    pub fn update_state(&self, container_id: &str, state: ContainerState) -> MetaStoreResult<()> {
        self.update_field(container_id, container_field::STATE, &encode_state(state))
    }

    fn update_field(&self, container_id: &str, field: &str, value: &[u8]) -> MetaStoreResult<()> {
        let updated = self.update(|txn| {
            let mut containers = open_existing(txn, tables::VIRTUALIZATION)?;
            if !record_exists(&containers, container_id)? {
                return Ok(false);
            }
            put_field(&mut containers, container_id, field, value)?;
            Ok(true)
        })?;

        if !updated {
            debug!(
                "Container '{}' is gone, skipping update of '{}'",
                container_id, field
            );
        }
        Ok(())
    }

    /// Load a container joined with its sandbox's annotations.
    ///
    /// Returns `None` if the container record does not exist.
    pub fn get_container_info(&self, container_id: &str) -> MetaStoreResult<Option<ContainerInfo>> {
        self.view(|txn| {
            let containers = open_readable(txn, tables::VIRTUALIZATION)?;
            let Some(fields) = read_fields(&containers, container_id)? else {
                return Ok(None);
            };
            let sandboxes = open_readable(txn, tables::SANDBOX)?;
            assemble(&sandboxes, container_id, &fields).map(Some)
        })
    }

    /// Every container record, in id order, from one snapshot.
    pub fn list_containers(&self) -> MetaStoreResult<Vec<ContainerInfo>> {
        self.view(|txn| {
            let containers = open_readable(txn, tables::VIRTUALIZATION)?;
            let ids = record_ids(&containers)?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let sandboxes = open_readable(txn, tables::SANDBOX)?;
            let mut result = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(fields) = read_fields(&containers, id)? {
                    result.push(assemble(&sandboxes, id, &fields)?);
                }
            }
            Ok(result)
        })
    }

    /// Clear the sandbox back-reference and delete the container record as
    /// one change, through the batched commit path.
    pub fn remove_container(&self, container_id: &str) -> MetaStoreResult<()> {
        let id = container_id.to_string();
        self.batch(Arc::new(move |txn: &WriteTransaction| {
            remove_container_in(txn, &id)
        }))?;

        debug!("Removed container '{}'", container_id);
        Ok(())
    }
}

fn remove_container_in(txn: &WriteTransaction, container_id: &str) -> MetaStoreResult<()> {
    let mut containers = open_existing(txn, tables::VIRTUALIZATION)?;
    let fields = read_fields(&containers, container_id)?
        .ok_or_else(|| MetaStoreError::ContainerNotFound(container_id.to_string()))?;
    let sandbox_id = FieldReader::new(container_id, &fields).string(container_field::SANDBOX_ID)?;

    let mut sandboxes = open_existing(txn, tables::SANDBOX)?;
    if !record_exists(&sandboxes, &sandbox_id)? {
        return Err(MetaStoreError::SandboxNotFound(sandbox_id));
    }

    put_field(&mut sandboxes, &sandbox_id, sandbox_field::CONTAINER_ID, b"")?;
    delete_record(&mut containers, container_id)?;
    Ok(())
}

/// Decode a container and attach its sandbox's annotations.
fn assemble(
    sandboxes: &ReadOnlyTable<FieldKey, FieldValue>,
    container_id: &str,
    fields: &Fields,
) -> MetaStoreResult<ContainerInfo> {
    let sandbox_id = FieldReader::new(container_id, fields).string(container_field::SANDBOX_ID)?;
    let sandbox = read_fields(sandboxes, &sandbox_id)?
        .ok_or_else(|| MetaStoreError::SandboxNotFound(sandbox_id.clone()))?;
    let sandbox_annotations =
        FieldReader::new(&sandbox_id, &sandbox).map(sandbox_field::ANNOTATIONS)?;
    decode_container(container_id, fields, sandbox_annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{START_SECS, open_store};
    use crate::types::PodSandboxConfig;
    use chrono::Duration;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn spec(sandbox_id: &str) -> ContainerSpec {
        ContainerSpec {
            name: "web".into(),
            sandbox_id: sandbox_id.into(),
            image: "cirros".into(),
            root_image_volume_name: "c1-root".into(),
            labels: labels(&[("app", "web")]),
            annotations: labels(&[("note", "first")]),
            attempt: 2,
        }
    }

    /// Store with both collections and sandbox "s1" carrying `{"k": "v"}`
    fn seeded(dir: &TempDir) -> (MetaStore, Arc<crate::FakeClock>) {
        let (store, clock) = open_store(dir);
        store.ensure_schema().unwrap();
        store.ensure_sandbox_schema().unwrap();
        store
            .set_pod_sandbox(
                "s1",
                &PodSandboxConfig {
                    name: "pod".into(),
                    annotations: labels(&[("k", "v")]),
                    ..Default::default()
                },
            )
            .unwrap();
        (store, clock)
    }

    fn back_reference(store: &MetaStore, sandbox_id: &str) -> String {
        store.get_pod_sandbox(sandbox_id).unwrap().unwrap().container_id
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        store.set_container("c1", &spec("s1")).unwrap();
        let info = store.get_container_info("c1").unwrap().unwrap();

        assert_eq!(info.id, "c1");
        assert_eq!(info.name, "web");
        assert_eq!(info.sandbox_id, "s1");
        assert_eq!(info.image, "cirros");
        assert_eq!(info.root_image_volume_name, "c1-root");
        assert_eq!(info.labels, labels(&[("app", "web")]));
        assert_eq!(info.annotations, labels(&[("note", "first")]));
        assert_eq!(info.sandbox_annotations, labels(&[("k", "v")]));
        assert_eq!(info.state, ContainerState::Created);
        assert_eq!(info.created_at, START_SECS * 1_000_000_000);
        assert_eq!(info.started_at, None);
        assert_eq!(info.attempt, 2);
    }

    #[test]
    fn test_create_and_remove_maintain_back_reference() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        store.set_container("c1", &spec("s1")).unwrap();
        assert_eq!(back_reference(&store, "s1"), "c1");

        store.remove_container("c1").unwrap();
        assert_eq!(back_reference(&store, "s1"), "");
        assert!(store.get_container_info("c1").unwrap().is_none());
        // The sandbox itself is kept
        assert_eq!(store.list_pod_sandboxes().unwrap().len(), 1);
    }

    fn raw_fields(store: &MetaStore, table: tables::RecordTable, id: &str) -> Option<Fields> {
        store
            .view(|txn| {
                let records = open_readable(txn, table)?;
                read_fields(&records, id)
            })
            .unwrap()
    }

    #[test]
    fn test_busybox_create_then_remove() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        store
            .set_container(
                "c1",
                &ContainerSpec {
                    sandbox_id: "s1".into(),
                    image: "busybox".into(),
                    attempt: 0,
                    ..Default::default()
                },
            )
            .unwrap();

        let info = store.get_container_info("c1").unwrap().unwrap();
        assert_eq!(info.state, ContainerState::Created);
        assert_eq!(info.attempt, 0);
        assert_eq!(info.sandbox_id, "s1");
        assert_eq!(info.image, "busybox");
        assert!(info.labels.is_empty());
        assert!(info.annotations.is_empty());
        assert_eq!(back_reference(&store, "s1"), "c1");

        let fields = raw_fields(&store, tables::VIRTUALIZATION, "c1").unwrap();
        assert_eq!(fields[container_field::LABELS], b"{}");
        assert_eq!(fields[container_field::ANNOTATIONS], b"{}");
        assert_eq!(fields[container_field::ATTEMPT], b"0");
        assert_eq!(fields[container_field::STATE], [0u8]);

        store.remove_container("c1").unwrap();
        assert!(store.get_container_info("c1").unwrap().is_none());
        assert!(raw_fields(&store, tables::VIRTUALIZATION, "c1").is_none());

        // The back-reference is blanked, not deleted
        let sandbox = raw_fields(&store, tables::SANDBOX, "s1").unwrap();
        assert_eq!(sandbox.get(sandbox_field::CONTAINER_ID).map(Vec::as_slice), Some(&b""[..]));
    }

    #[test]
    fn test_set_container_missing_sandbox_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        let err = store.set_container("c1", &spec("nope")).unwrap_err();
        assert!(matches!(err, MetaStoreError::SandboxNotFound(ref id) if id == "nope"));
        assert!(store.get_container_info("c1").unwrap().is_none());
        assert!(store.list_containers().unwrap().is_empty());
        assert_eq!(back_reference(&store, "s1"), "");
    }

    #[test]
    fn test_operations_require_schema() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open_store(&dir);

        assert!(matches!(
            store.set_container("c1", &spec("s1")),
            Err(MetaStoreError::SchemaMissing(_))
        ));
        assert!(matches!(
            store.update_state("c1", ContainerState::Running),
            Err(MetaStoreError::SchemaMissing(_))
        ));
        assert!(matches!(
            store.get_container_info("c1"),
            Err(MetaStoreError::SchemaMissing(_))
        ));
        assert!(matches!(
            store.remove_container("c1"),
            Err(MetaStoreError::SchemaMissing(_))
        ));

        // Container collection present, sandbox collection absent
        store.ensure_schema().unwrap();
        let err = store.set_container("c1", &spec("s1")).unwrap_err();
        assert!(matches!(err, MetaStoreError::SchemaMissing(ref t) if t == "sandbox"));
    }

    #[test]
    fn test_ensure_schema_keeps_records() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        store.set_container("c1", &spec("s1")).unwrap();
        store.ensure_schema().unwrap();
        store.ensure_sandbox_schema().unwrap();
        assert!(store.get_container_info("c1").unwrap().is_some());
    }

    #[test]
    fn test_soft_updates_on_missing_container() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        store.update_state("ghost", ContainerState::Running).unwrap();
        store.update_started_at("ghost", 42).unwrap();
        assert!(store.get_container_info("ghost").unwrap().is_none());
        assert!(store.list_containers().unwrap().is_empty());
    }

    #[test]
    fn test_state_and_start_time_updates() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);
        store.set_container("c1", &spec("s1")).unwrap();

        store.update_state("c1", ContainerState::Running).unwrap();
        store.update_started_at("c1", 1234).unwrap();
        let info = store.get_container_info("c1").unwrap().unwrap();
        assert_eq!(info.state, ContainerState::Running);
        assert_eq!(info.started_at, Some(1234));

        // No predecessor validation
        store.update_state("c1", ContainerState::Created).unwrap();
        store.update_state("c1", ContainerState::Unknown).unwrap();
        let info = store.get_container_info("c1").unwrap().unwrap();
        assert_eq!(info.state, ContainerState::Unknown);
    }

    #[test]
    fn test_set_container_replaces_record() {
        let dir = TempDir::new().unwrap();
        let (store, clock) = seeded(&dir);

        store.set_container("c1", &spec("s1")).unwrap();
        store.update_state("c1", ContainerState::Exited).unwrap();
        store.update_started_at("c1", 99).unwrap();

        clock.advance(Duration::seconds(10));
        let mut replacement = spec("s1");
        replacement.name = "db".into();
        replacement.labels = HashMap::new();
        store.set_container("c1", &replacement).unwrap();

        let info = store.get_container_info("c1").unwrap().unwrap();
        assert_eq!(info.name, "db");
        assert!(info.labels.is_empty());
        assert_eq!(info.state, ContainerState::Created);
        assert_eq!(info.started_at, None);
        assert_eq!(info.created_at, (START_SECS + 10) * 1_000_000_000);
    }

    #[test]
    fn test_remove_missing_container_is_hard_failure() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);

        let err = store.remove_container("ghost").unwrap_err();
        assert!(matches!(err, MetaStoreError::ContainerNotFound(ref id) if id == "ghost"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_with_vanished_sandbox_fails() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);
        store.set_container("c1", &spec("s1")).unwrap();

        // Drop the sandbox record behind the container's back
        store
            .update(|txn| {
                let mut sandboxes = open_existing(txn, tables::SANDBOX)?;
                delete_record(&mut sandboxes, "s1")?;
                Ok(())
            })
            .unwrap();

        let err = store.remove_container("c1").unwrap_err();
        assert!(matches!(err, MetaStoreError::SandboxNotFound(ref id) if id == "s1"));
        let err = store.get_container_info("c1").unwrap_err();
        assert!(matches!(err, MetaStoreError::SandboxNotFound(_)));
    }

    #[test]
    fn test_corrupt_field_is_reported() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);
        store.set_container("c1", &spec("s1")).unwrap();

        store
            .update(|txn| {
                let mut containers = open_existing(txn, tables::VIRTUALIZATION)?;
                put_field(&mut containers, "c1", container_field::LABELS, b"{not json")
            })
            .unwrap();

        let err = store.get_container_info("c1").unwrap_err();
        assert!(matches!(err, MetaStoreError::Corrupt { ref field, .. } if field == "labels"));
        assert!(err.is_operational_alert());
    }

    #[test]
    fn test_list_containers_in_id_order() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);
        store
            .set_pod_sandbox("s2", &PodSandboxConfig::default())
            .unwrap();

        store.set_container("c2", &spec("s2")).unwrap();
        store.set_container("c1", &spec("s1")).unwrap();

        let ids: Vec<String> = store
            .list_containers()
            .unwrap()
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(ids, ["c1", "c2"]);
    }

    #[test]
    fn test_concurrent_removals_are_batched_atomically() {
        let dir = TempDir::new().unwrap();
        let (store, _) = seeded(&dir);
        let ids: Vec<String> = (0..8).map(|i| format!("s{i}")).collect();
        for id in &ids {
            store
                .set_pod_sandbox(id, &PodSandboxConfig::default())
                .unwrap();
            store.set_container(&format!("c-{id}"), &spec(id)).unwrap();
        }

        std::thread::scope(|s| {
            for id in &ids {
                let store = &store;
                s.spawn(move || store.remove_container(&format!("c-{id}")).unwrap());
            }
            // A removal of an unknown container in the same window fails alone
            let store = &store;
            s.spawn(move || {
                assert!(store.remove_container("ghost").unwrap_err().is_not_found());
            });
        });

        assert!(store.list_containers().unwrap().is_empty());
        for id in &ids {
            assert_eq!(back_reference(&store, id), "");
        }
    }
}
