//! Image layer manager
//!
//! An image is a full-state checkpoint: every live key with its latest
//! record as of one sequence. Images bound reconstruction cost, since a
//! reader starts from the nearest image instead of the first delta.
//!
//! # Algorithm
//!
//! 1. Acquire the maintenance lock
//! 2. Flush the buffer, so the image sequence is fully layered
//! 3. Materialize state at `flushed_through` from the previous image and
//!    the newer deltas
//! 4. Write the image blob
//! 5. Commit the image metadata row
//!
//! A crash before step 5 leaves an orphan blob that recovery removes.
//! Older images are retired by reclamation, never here.

use crate::engine::Core;
use crate::errors::VaultResult;
use crate::filter::MembershipFilter;
use crate::layer::{flush, write_blob, BlobKind, ImageLayerMeta, LayerId};
use crate::observability::{log_event_with_fields, Event};
use crate::reconstruct::{materialize, CancelToken};
use crate::record::{ChangeRecord, Sequence};
use crate::substrate::WriteBatch;

use chrono::Utc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    pub image_id: LayerId,
    pub sequence: Sequence,
    pub key_count: u64,
    pub byte_size: u64,
}

/// Has the watermark moved far enough past the latest image?
pub(crate) fn image_due(core: &Core) -> VaultResult<bool> {
    let interval = core.config.image_interval_sequences;
    if interval == 0 {
        return Ok(false);
    }
    let watermark = core.watermark()?;
    let latest = core
        .layers()?
        .latest_image()
        .map_or(Sequence::ZERO, |image| image.sequence);
    Ok(watermark.value().saturating_sub(latest.value()) >= interval)
}

/// Checkpoint the current state. `None` when there is nothing new to image.
pub(crate) fn create_image(core: &Core) -> VaultResult<Option<ImageReport>> {
    let _maintenance = core.lock_maintenance()?;
    flush(core)?;

    let at = core.flushed_through();
    if at == Sequence::ZERO {
        return Ok(None);
    }
    if let Some(latest) = core.layers()?.latest_image() {
        if latest.sequence >= at {
            return Ok(None);
        }
    }

    let winners = materialize(core, at, None, &CancelToken::new())?;
    let records: Vec<ChangeRecord> = winners.into_values().collect();
    let filter = MembershipFilter::build(
        records.iter().map(|r| r.key.as_slice()),
        core.config.filter_false_positive_rate,
        core.config.filter_prefix_len,
    );

    let image_id = core.layers_mut()?.reserve_id();
    let byte_size = write_blob(&core.storage, BlobKind::Image, image_id, &records)?;
    let meta = ImageLayerMeta {
        image_id,
        sequence: at,
        key_count: records.len() as u64,
        byte_size,
        filter,
        created_at: Utc::now(),
    };

    {
        let mut layers = core.layers_mut()?;
        let mut batch = WriteBatch::new();
        layers.stage_image(&mut batch, &meta)?;
        layers.stage_counter(&mut batch);
        core.storage.commit(&batch)?;
        layers.insert_image(meta.clone());
    }

    core.metrics.increment_images_created();
    log_event_with_fields(
        Event::ImageCreated,
        &[
            ("image_id", &image_id.to_string()),
            ("sequence", &at.to_string()),
            ("keys", &meta.key_count.to_string()),
            ("bytes", &byte_size.to_string()),
        ],
    );
    Ok(Some(ImageReport {
        image_id,
        sequence: at,
        key_count: meta.key_count,
        byte_size,
    }))
}
