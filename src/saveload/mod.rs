//! World snapshots.
//!
//! The wire format is deliberately fixed rather than self-describing: a
//! `HRTH` magic, a format version, then one section per serializable
//! component type carrying `(entity_bits, payload)` records. Payloads are
//! whatever the type's registered serialize hook produced, so the container
//! never interprets them. Round-trip is guaranteed only for the component
//! types registered (with hooks) on the receiving world; entity ids are
//! remapped on load, component values survive exactly.

use std::collections::HashMap;

use log::debug;

use crate::{
    error::{BoxedErr, SnapshotError},
    world::{Entity, World},
};

const MAGIC: &[u8; 4] = b"HRTH";
const VERSION: u16 = 1;

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self.at.checked_add(n).ok_or(SnapshotError::Truncated)?;
        if end > self.bytes.len() {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, SnapshotError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, SnapshotError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl World {
    /// Encodes every serializable component of every live entity.
    pub fn serialize_world(&self) -> Result<Vec<u8>, SnapshotError> {
        let sections: Vec<_> = self
            .component_registry()
            .iter()
            .filter(|info| info.is_serializable())
            .map(|info| (info.id, info.name, info.rust_id, info.serialize))
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(sections.len() as u32).to_le_bytes());

        for (comp_id, name, rust_id, hooks) in sections {
            let (ser, _) = hooks.expect("section list is filtered to serializable types");
            let mut records: Vec<(Entity, Vec<u8>)> = Vec::new();
            let mut failure: Option<BoxedErr> = None;
            if let Some(cell) = self.cell_by_type(rust_id) {
                cell.for_each_erased(&mut |entity, value| {
                    if failure.is_some() {
                        return;
                    }
                    match ser(value) {
                        Ok(bytes) => records.push((entity, bytes)),
                        Err(err) => failure = Some(err),
                    }
                });
            }
            if let Some(err) = failure {
                return Err(SnapshotError::Payload(err));
            }

            out.extend_from_slice(&comp_id.0.to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(records.len() as u32).to_le_bytes());
            for (entity, payload) in records {
                out.extend_from_slice(&entity.to_bits().to_le_bytes());
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(&payload);
            }
        }
        debug!("serialized world snapshot: {} bytes", out.len());
        Ok(out)
    }

    /// Decodes a snapshot into this world, creating a fresh entity for
    /// every distinct entity id in the stream.
    ///
    /// Every section's component type must be registered here with
    /// serialization hooks; unknown sections are an error rather than
    /// silently skipped.
    pub fn deserialize_world(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = r.u16()?;
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let mut remap: HashMap<u64, Entity> = HashMap::new();
        let section_count = r.u32()?;
        for _ in 0..section_count {
            let _stored_id = r.u32()?;
            let name_len = r.u16()? as usize;
            let name = std::str::from_utf8(r.take(name_len)?)
                .map_err(|_| SnapshotError::Truncated)?;

            // Types are matched by recorded name; the numeric id is not
            // trusted across registration orders.
            let comp_id = self
                .component_registry()
                .id_by_name(name)
                .ok_or_else(|| SnapshotError::UnknownComponentType(name.to_string()))?;
            let info = self
                .component_registry()
                .info(comp_id)
                .expect("id_by_name returned an unknown id");
            let (_, de) = info
                .serialize
                .ok_or(SnapshotError::NotSerializable(info.name))?;
            let rust_id = info.rust_id;
            let cell = self
                .cell_by_type(rust_id)
                .ok_or(SnapshotError::NotSerializable(info.name))?
                .clone();
            let validate = info.validate_fn;

            let record_count = r.u32()?;
            for _ in 0..record_count {
                let bits = r.u64()?;
                Entity::from_bits(bits).ok_or(SnapshotError::BadEntityId(bits))?;
                let payload_len = r.u32()? as usize;
                let payload = r.take(payload_len)?;

                let value = de(payload).map_err(SnapshotError::Payload)?;
                validate(value.as_ref()).map_err(SnapshotError::Payload)?;

                let entity = *remap.entry(bits).or_insert_with(|| self.create_entity());
                cell.insert_erased(entity, value)
                    .map_err(|e| SnapshotError::Payload(BoxedErr::new(e)))?;
            }
        }
        debug!(
            "deserialized world snapshot: {} sections, {} entities",
            section_count,
            remap.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Component;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }
    impl Component for Pos {}

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Label(String);
    impl Component for Label {}

    #[derive(Clone, Debug)]
    struct Transient;
    impl Component for Transient {}

    fn world() -> World {
        let mut world = World::new();
        world.register_serializable::<Pos>();
        world.register_serializable::<Label>();
        world.register::<Transient>();
        world
    }

    #[test]
    fn round_trip_preserves_component_content() {
        let src = world();
        let a = src.create_entity();
        src.add_component(a, Pos { x: 1.0, y: 2.0 }).unwrap();
        src.add_component(a, Label("hero".into())).unwrap();
        let b = src.create_entity();
        src.add_component(b, Pos { x: -4.0, y: 0.5 }).unwrap();
        // Not serializable; must simply be absent from the snapshot.
        src.add_component(b, Transient).unwrap();

        let bytes = src.serialize_world().unwrap();

        let dst = world();
        dst.deserialize_world(&bytes).unwrap();

        assert_eq!(dst.read_store::<Pos>().unwrap().len(), 2);
        assert_eq!(dst.read_store::<Label>().unwrap().len(), 1);
        assert_eq!(dst.read_store::<Transient>().unwrap().len(), 0);

        // Component values survive; the Pos/Label pairing does too.
        let labelled: Vec<Entity> = dst.query().with::<Label>().execute();
        assert_eq!(labelled.len(), 1);
        assert_eq!(
            dst.get_component::<Pos>(labelled[0]),
            Some(Pos { x: 1.0, y: 2.0 })
        );
        assert_eq!(
            dst.get_component::<Label>(labelled[0]),
            Some(Label("hero".into()))
        );
    }

    #[test]
    fn snapshot_into_nonempty_world_adds_fresh_entities() {
        let src = world();
        let a = src.create_entity();
        src.add_component(a, Pos { x: 9.0, y: 9.0 }).unwrap();
        let bytes = src.serialize_world().unwrap();

        let dst = world();
        let existing = dst.create_entity();
        dst.add_component(existing, Pos { x: 0.0, y: 0.0 }).unwrap();

        dst.deserialize_world(&bytes).unwrap();
        assert_eq!(dst.read_store::<Pos>().unwrap().len(), 2);
        assert_eq!(
            dst.get_component::<Pos>(existing),
            Some(Pos { x: 0.0, y: 0.0 })
        );
    }

    #[test]
    fn bad_magic_and_truncation_are_rejected() {
        let dst = world();
        assert!(matches!(
            dst.deserialize_world(b"NOPE\x01\x00\x00\x00\x00\x00"),
            Err(SnapshotError::BadMagic)
        ));

        let src = world();
        let e = src.create_entity();
        src.add_component(e, Pos { x: 1.0, y: 1.0 }).unwrap();
        let bytes = src.serialize_world().unwrap();
        assert!(matches!(
            dst.deserialize_world(&bytes[..bytes.len() - 3]),
            Err(SnapshotError::Truncated)
        ));
    }

    #[test]
    fn unknown_section_type_is_an_error() {
        let src = world();
        let e = src.create_entity();
        src.add_component(e, Pos { x: 1.0, y: 1.0 }).unwrap();
        let bytes = src.serialize_world().unwrap();

        // A world that never registered Pos cannot accept the snapshot.
        let dst = World::new();
        assert!(matches!(
            dst.deserialize_world(&bytes),
            Err(SnapshotError::UnknownComponentType(_))
        ));
    }

    #[test]
    fn empty_world_round_trips() {
        let src = world();
        let bytes = src.serialize_world().unwrap();
        let dst = world();
        dst.deserialize_world(&bytes).unwrap();
        assert_eq!(dst.entity_count(), 0);
    }
}
