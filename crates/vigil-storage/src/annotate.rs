use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use vigil_core::{Determination, ItemKey, ValidationError};

use crate::{AnnotationPatch, MergingStore, StoreError, UpdateResult};

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no item stored under {0}")]
    NotFound(ItemKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates reviewer input and writes it as a partial update.
#[derive(Debug, Clone)]
pub struct AnnotationUpdater {
    store: Arc<MergingStore>,
}

impl AnnotationUpdater {
    pub fn new(store: Arc<MergingStore>) -> Self {
        Self { store }
    }

    /// `None` leaves a field as stored; an empty string clears it. The
    /// determination is checked before anything is written.
    pub async fn set_annotation(
        &self,
        key: &ItemKey,
        comment: Option<String>,
        determination: Option<&str>,
    ) -> Result<(), AnnotateError> {
        let determination = determination
            .map(str::parse::<Determination>)
            .transpose()?;
        let patch = AnnotationPatch {
            comment,
            determination,
        };
        match self.store.update_annotation(key, &patch).await? {
            UpdateResult::Applied => {
                info!(
                    table = self.store.table_name(),
                    %key,
                    determination = determination.map(Determination::as_str),
                    "annotation updated"
                );
                Ok(())
            }
            UpdateResult::Missing => Err(AnnotateError::NotFound(key.clone())),
        }
    }
}
