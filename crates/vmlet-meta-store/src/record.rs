//! Field layout and value encoding for stored records.
//!
//! This is the only place that knows how record attributes map to raw
//! bytes. Integers are decimal strings, the container state is a single
//! byte and string maps are JSON objects.

use crate::error::{MetaStoreError, MetaStoreResult};
use crate::tables::{FieldKey, FieldValue};
use crate::types::{ContainerInfo, ContainerSpec, ContainerState, PodSandboxConfig, SandboxInfo};
use redb::{ReadableTable, Table};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::str::FromStr;

/// Container record field names
pub(crate) mod container_field {
    pub const NAME: &str = "name";
    pub const CREATED_AT: &str = "createdAt";
    pub const STARTED_AT: &str = "startedAt";
    pub const SANDBOX_ID: &str = "sandboxId";
    pub const IMAGE: &str = "image";
    pub const ROOT_IMAGE_VOLUME_NAME: &str = "rootImageVolumeName";
    pub const LABELS: &str = "labels";
    pub const ANNOTATIONS: &str = "annotations";
    pub const STATE: &str = "state";
    pub const ATTEMPT: &str = "attempt";
}

/// Sandbox record field names
pub(crate) mod sandbox_field {
    pub const NAME: &str = "name";
    pub const UID: &str = "uid";
    pub const NAMESPACE: &str = "namespace";
    pub const ATTEMPT: &str = "attempt";
    pub const CREATED_AT: &str = "createdAt";
    pub const LABELS: &str = "labels";
    pub const ANNOTATIONS: &str = "annotations";
    pub const CONTAINER_ID: &str = "ContainerID";
}

/// All stored fields of one record, by field name
pub(crate) type Fields = BTreeMap<String, Vec<u8>>;

/// Encoded fields ready to be written
pub(crate) type EncodedFields = Vec<(&'static str, Vec<u8>)>;

// ---- Encoding ----

pub(crate) fn encode_int(value: impl Display) -> Vec<u8> {
    value.to_string().into_bytes()
}

pub(crate) fn encode_state(state: ContainerState) -> Vec<u8> {
    vec![u8::from(state)]
}

fn encode_map(field: &str, map: &HashMap<String, String>) -> MetaStoreResult<Vec<u8>> {
    serde_json::to_vec(map).map_err(|e| MetaStoreError::Encode {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn encode_container(spec: &ContainerSpec, created_at: i64) -> MetaStoreResult<EncodedFields> {
    use container_field as f;
    Ok(vec![
        (f::NAME, spec.name.clone().into_bytes()),
        (f::CREATED_AT, encode_int(created_at)),
        (f::SANDBOX_ID, spec.sandbox_id.clone().into_bytes()),
        (f::IMAGE, spec.image.clone().into_bytes()),
        (
            f::ROOT_IMAGE_VOLUME_NAME,
            spec.root_image_volume_name.clone().into_bytes(),
        ),
        (f::LABELS, encode_map(f::LABELS, &spec.labels)?),
        (f::ANNOTATIONS, encode_map(f::ANNOTATIONS, &spec.annotations)?),
        (f::STATE, encode_state(ContainerState::Created)),
        (f::ATTEMPT, encode_int(spec.attempt)),
    ])
}

pub(crate) fn encode_sandbox(
    config: &PodSandboxConfig,
    created_at: i64,
    container_id: &str,
) -> MetaStoreResult<EncodedFields> {
    use sandbox_field as f;
    Ok(vec![
        (f::NAME, config.name.clone().into_bytes()),
        (f::UID, config.uid.clone().into_bytes()),
        (f::NAMESPACE, config.namespace.clone().into_bytes()),
        (f::ATTEMPT, encode_int(config.attempt)),
        (f::CREATED_AT, encode_int(created_at)),
        (f::LABELS, encode_map(f::LABELS, &config.labels)?),
        (f::ANNOTATIONS, encode_map(f::ANNOTATIONS, &config.annotations)?),
        (f::CONTAINER_ID, container_id.as_bytes().to_vec()),
    ])
}

// ---- Decoding ----

/// Typed access to the fields of one stored record
pub(crate) struct FieldReader<'a> {
    record: &'a str,
    fields: &'a Fields,
}

impl<'a> FieldReader<'a> {
    pub(crate) const fn new(record: &'a str, fields: &'a Fields) -> Self {
        Self { record, fields }
    }

    fn bytes(&self, field: &str) -> MetaStoreResult<&'a [u8]> {
        self.fields
            .get(field)
            .map(Vec::as_slice)
            .ok_or_else(|| MetaStoreError::corrupt(self.record, field, "field is missing"))
    }

    pub(crate) fn string(&self, field: &str) -> MetaStoreResult<String> {
        let bytes = self.bytes(field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MetaStoreError::corrupt(self.record, field, e))
    }

    fn parse<T>(&self, field: &str, bytes: &[u8]) -> MetaStoreResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MetaStoreError::corrupt(self.record, field, e))?;
        text.parse::<T>()
            .map_err(|e| MetaStoreError::corrupt(self.record, field, format!("'{text}': {e}")))
    }

    pub(crate) fn int<T>(&self, field: &str) -> MetaStoreResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let bytes = self.bytes(field)?;
        self.parse(field, bytes)
    }

    pub(crate) fn optional_int<T>(&self, field: &str) -> MetaStoreResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.fields
            .get(field)
            .map(|bytes| self.parse(field, bytes))
            .transpose()
    }

    /// Decode a JSON object of strings. A stored `null` reads as an empty map.
    pub(crate) fn map(&self, field: &str) -> MetaStoreResult<HashMap<String, String>> {
        let bytes = self.bytes(field)?;
        let map: Option<HashMap<String, String>> = serde_json::from_slice(bytes)
            .map_err(|e| MetaStoreError::corrupt(self.record, field, e))?;
        Ok(map.unwrap_or_default())
    }

    pub(crate) fn state(&self, field: &str) -> MetaStoreResult<ContainerState> {
        match self.bytes(field)? {
            [code] => ContainerState::try_from(*code).map_err(|code| {
                MetaStoreError::corrupt(self.record, field, format!("unknown state code {code}"))
            }),
            other => Err(MetaStoreError::corrupt(
                self.record,
                field,
                format!("expected one byte, found {}", other.len()),
            )),
        }
    }
}

pub(crate) fn decode_container(
    container_id: &str,
    fields: &Fields,
    sandbox_annotations: HashMap<String, String>,
) -> MetaStoreResult<ContainerInfo> {
    use container_field as f;
    let reader = FieldReader::new(container_id, fields);
    Ok(ContainerInfo {
        id: container_id.to_string(),
        name: reader.string(f::NAME)?,
        sandbox_id: reader.string(f::SANDBOX_ID)?,
        image: reader.string(f::IMAGE)?,
        root_image_volume_name: reader.string(f::ROOT_IMAGE_VOLUME_NAME)?,
        labels: reader.map(f::LABELS)?,
        annotations: reader.map(f::ANNOTATIONS)?,
        sandbox_annotations,
        state: reader.state(f::STATE)?,
        created_at: reader.int(f::CREATED_AT)?,
        started_at: reader.optional_int(f::STARTED_AT)?,
        attempt: reader.optional_int(f::ATTEMPT)?.unwrap_or(0),
    })
}

pub(crate) fn decode_sandbox(sandbox_id: &str, fields: &Fields) -> MetaStoreResult<SandboxInfo> {
    use sandbox_field as f;
    let reader = FieldReader::new(sandbox_id, fields);
    Ok(SandboxInfo {
        id: sandbox_id.to_string(),
        name: reader.string(f::NAME)?,
        uid: reader.string(f::UID)?,
        namespace: reader.string(f::NAMESPACE)?,
        attempt: reader.optional_int(f::ATTEMPT)?.unwrap_or(0),
        created_at: reader.optional_int(f::CREATED_AT)?.unwrap_or(0),
        labels: reader.map(f::LABELS)?,
        annotations: reader.map(f::ANNOTATIONS)?,
        container_id: reader.string(f::CONTAINER_ID)?,
    })
}

// ---- Table access ----

/// Read every field of `id`, or `None` if the record has no fields.
pub(crate) fn read_fields<T>(table: &T, id: &str) -> MetaStoreResult<Option<Fields>>
where
    T: ReadableTable<FieldKey, FieldValue>,
{
    let mut fields = Fields::new();
    for entry in table.range((id, "")..)? {
        let (key, value) = entry?;
        let (owner, field) = key.value();
        if owner != id {
            break;
        }
        fields.insert(field.to_string(), value.value().to_vec());
    }
    Ok((!fields.is_empty()).then_some(fields))
}

/// Whether `id` has at least one stored field
pub(crate) fn record_exists<T>(table: &T, id: &str) -> MetaStoreResult<bool>
where
    T: ReadableTable<FieldKey, FieldValue>,
{
    match table.range((id, "")..)?.next() {
        Some(entry) => {
            let (key, _) = entry?;
            Ok(key.value().0 == id)
        }
        None => Ok(false),
    }
}

/// Distinct record ids in key order
pub(crate) fn record_ids<T>(table: &T) -> MetaStoreResult<Vec<String>>
where
    T: ReadableTable<FieldKey, FieldValue>,
{
    let mut ids: Vec<String> = Vec::new();
    for entry in table.iter()? {
        let (key, _) = entry?;
        let (owner, _) = key.value();
        if ids.last().is_none_or(|last| last != owner) {
            ids.push(owner.to_string());
        }
    }
    Ok(ids)
}

pub(crate) fn put_field(
    table: &mut Table<'_, FieldKey, FieldValue>,
    id: &str,
    field: &str,
    value: &[u8],
) -> MetaStoreResult<()> {
    table.insert((id, field), value)?;
    Ok(())
}

pub(crate) fn write_fields(
    table: &mut Table<'_, FieldKey, FieldValue>,
    id: &str,
    fields: &EncodedFields,
) -> MetaStoreResult<()> {
    for (field, value) in fields {
        put_field(table, id, field, value)?;
    }
    Ok(())
}

/// Delete every field of `id`. Returns whether anything was removed.
pub(crate) fn delete_record(
    table: &mut Table<'_, FieldKey, FieldValue>,
    id: &str,
) -> MetaStoreResult<bool> {
    let names: Vec<String> = read_fields(&*table, id)?
        .map(|fields| fields.into_keys().collect())
        .unwrap_or_default();
    for name in &names {
        table.remove((id, name.as_str()))?;
    }
    Ok(!names.is_empty())
}
