//! In-memory catalog of delta and image layers
//!
//! Mirrors the `delta_layers` and `image_layers` tables. Mutations are staged
//! into a batch first and applied to the catalog only after that batch
//! commits, so the catalog never shows a layer the substrate does not hold.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::blob::{stage_delete_blob, BlobKind};
use super::coverage;
use super::meta::{DeltaLayerMeta, ImageLayerMeta, LayerId};
use crate::record::Sequence;
use crate::substrate::meta::{self, NEXT_LAYER_ID};
use crate::substrate::{StorageHandle, StoreResult, Table, WriteBatch};

#[derive(Debug, Default)]
pub struct LayerCatalog {
    deltas: BTreeMap<LayerId, DeltaLayerMeta>,
    images: BTreeMap<(Sequence, LayerId), ImageLayerMeta>,
    next_id: u64,
    /// Upper bound on the span of every delta layer in the coverage index
    widest: u64,
}

impl LayerCatalog {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Load both metadata tables.
    pub fn load(storage: &StorageHandle) -> StoreResult<Self> {
        let mut catalog = Self::new();
        for (_, value) in storage.range(Table::DeltaLayers, &[], None)? {
            let meta = DeltaLayerMeta::decode(&value)?;
            catalog.insert_delta(meta);
        }
        for (_, value) in storage.range(Table::ImageLayers, &[], None)? {
            let meta = ImageLayerMeta::decode(&value)?;
            catalog.images.insert((meta.sequence, meta.image_id), meta);
        }

        // Concurrent writers persist the counter in commit order, so the
        // stored value can trail the highest id actually in use.
        let persisted = meta::get_u64(storage, NEXT_LAYER_ID)?.unwrap_or(1);
        let highest = catalog
            .deltas
            .keys()
            .copied()
            .chain(catalog.images.values().map(|m| m.image_id))
            .map(|id| id.value() + 1)
            .max()
            .unwrap_or(1);
        catalog.next_id = persisted.max(highest);
        Ok(catalog)
    }

    /// Reserve a fresh layer id and stage the counter.
    pub fn allocate_id(&mut self, batch: &mut WriteBatch) -> LayerId {
        let id = LayerId::new(self.next_id);
        self.next_id += 1;
        meta::put_u64(batch, NEXT_LAYER_ID, self.next_id);
        id
    }

    /// Reserve an id whose counter update rides on a later batch.
    pub fn reserve_id(&mut self) -> LayerId {
        let id = LayerId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn stage_counter(&self, batch: &mut WriteBatch) {
        meta::put_u64(batch, NEXT_LAYER_ID, self.next_id);
    }

    /// Bound to pass to `coverage::candidates`.
    pub fn widest_span(&self) -> u64 {
        self.widest
    }

    /// Stage a delta layer's metadata and coverage rows.
    pub fn stage_delta(&self, batch: &mut WriteBatch, meta: &DeltaLayerMeta) -> StoreResult<()> {
        batch.put(Table::DeltaLayers, meta.row_key(), meta.encode()?);
        coverage::stage_insert(batch, meta.layer_id, meta.range);
        Ok(())
    }

    /// Stage physical removal of a delta layer: metadata, coverage, content.
    pub fn stage_remove_delta(&self, batch: &mut WriteBatch, meta: &DeltaLayerMeta) {
        batch.delete(Table::DeltaLayers, meta.row_key());
        coverage::stage_remove(batch, meta.layer_id, meta.range);
        stage_delete_blob(batch, BlobKind::Delta, meta.layer_id);
    }

    pub fn stage_image(&self, batch: &mut WriteBatch, meta: &ImageLayerMeta) -> StoreResult<()> {
        batch.put(Table::ImageLayers, meta.row_key(), meta.encode()?);
        Ok(())
    }

    pub fn stage_remove_image(&self, batch: &mut WriteBatch, meta: &ImageLayerMeta) {
        batch.delete(Table::ImageLayers, meta.row_key());
        stage_delete_blob(batch, BlobKind::Image, meta.image_id);
    }

    pub fn insert_delta(&mut self, meta: DeltaLayerMeta) {
        self.widest = self.widest.max(coverage::span(meta.range));
        self.deltas.insert(meta.layer_id, meta);
    }

    pub fn remove_delta(&mut self, id: LayerId) -> Option<DeltaLayerMeta> {
        self.deltas.remove(&id)
    }

    pub fn insert_image(&mut self, meta: ImageLayerMeta) {
        self.images.insert((meta.sequence, meta.image_id), meta);
    }

    pub fn remove_image(&mut self, meta: &ImageLayerMeta) {
        self.images.remove(&(meta.sequence, meta.image_id));
    }

    pub fn delta(&self, id: LayerId) -> Option<&DeltaLayerMeta> {
        self.deltas.get(&id)
    }

    pub fn deltas(&self) -> impl Iterator<Item = &DeltaLayerMeta> {
        self.deltas.values()
    }

    pub fn delta_count(&self) -> usize {
        self.deltas.len()
    }

    /// Newest image with sequence <= `seq`.
    pub fn image_at_or_before(&self, seq: Sequence) -> Option<&ImageLayerMeta> {
        self.images
            .range(..=(seq, LayerId::new(u64::MAX)))
            .next_back()
            .map(|(_, m)| m)
    }

    /// Oldest image with sequence > `seq`.
    pub fn image_after(&self, seq: Sequence) -> Option<&ImageLayerMeta> {
        self.images
            .range((Bound::Excluded((seq, LayerId::new(u64::MAX))), Bound::Unbounded))
            .next()
            .map(|(_, m)| m)
    }

    pub fn latest_image(&self) -> Option<&ImageLayerMeta> {
        self.images.values().next_back()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageLayerMeta> {
        self.images.values()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// True if a blob with this kind and id is referenced by metadata.
    pub fn references(&self, kind: BlobKind, id: LayerId) -> bool {
        match kind {
            BlobKind::Delta => self.deltas.contains_key(&id),
            BlobKind::Image => self.images.values().any(|m| m.image_id == id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MembershipFilter;
    use chrono::Utc;

    fn image(seq: u64, id: u64) -> ImageLayerMeta {
        ImageLayerMeta {
            image_id: LayerId::new(id),
            sequence: Sequence::new(seq),
            key_count: 0,
            byte_size: 0,
            filter: MembershipFilter::build(Vec::<&[u8]>::new(), 0.01, 4),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_image_lookup() {
        let mut catalog = LayerCatalog::new();
        catalog.insert_image(image(10, 1));
        catalog.insert_image(image(20, 2));

        assert!(catalog.image_at_or_before(Sequence::new(9)).is_none());
        assert_eq!(catalog.image_at_or_before(Sequence::new(10)).unwrap().image_id, LayerId::new(1));
        assert_eq!(catalog.image_at_or_before(Sequence::new(25)).unwrap().image_id, LayerId::new(2));
        assert_eq!(catalog.image_after(Sequence::new(10)).unwrap().image_id, LayerId::new(2));
        assert!(catalog.image_after(Sequence::new(20)).is_none());
    }

    #[test]
    fn test_load_recovers_id_counter() {
        let storage = StorageHandle::in_memory();
        let mut catalog = LayerCatalog::new();
        let mut batch = WriteBatch::new();
        let meta = image(10, 41);
        catalog.stage_image(&mut batch, &meta).unwrap();
        storage.commit(&batch).unwrap();

        let loaded = LayerCatalog::load(&storage).unwrap();
        assert_eq!(loaded.image_count(), 1);
        let mut batch = WriteBatch::new();
        let mut loaded = loaded;
        assert_eq!(loaded.allocate_id(&mut batch), LayerId::new(42));
    }
}
