//! Lease primitive.
//!
//! A lease assigns a document to exactly one process. Acquiring picks the
//! first unleased document matching a filter under a deterministic order
//! and stamps the holder in the same write transaction, so two concurrent
//! callers can never be handed the same document. Releasing clears the
//! holder only if it is still the caller.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::query::{SortField, SortOrder, compare_docs};
use crate::store::{Leasable, StateStore, load_doc, store_doc};

impl StateStore {
    /// Lease the first unleased document matching `pred`. `None` means
    /// nothing was available, which is not an error.
    pub(crate) fn lease<D, S>(
        &self,
        pred: impl Fn(&D) -> bool,
        sort: Option<S>,
        order: SortOrder,
        process_id: &str,
    ) -> StateResult<Option<D>>
    where
        D: Leasable,
        S: SortField<D>,
    {
        let leased = self.find_and_modify(
            |doc: &D| doc.holder().is_none() && pred(doc),
            |a, b| compare_docs(sort, order, a, b),
            |doc| doc.set_holder(Some(process_id.to_string())),
        )?;
        if let Some(doc) = &leased {
            debug!(kind = D::KIND, key = doc.key(), process = %process_id, "lease acquired");
        }
        Ok(leased)
    }

    /// Clear the lease on `key` if `process_id` holds it.
    pub(crate) fn release<D: Leasable>(&self, key: &str, process_id: &str) -> StateResult<()> {
        let released = self.write(|txn| {
            let Some(mut doc) = load_doc::<D>(txn, key)? else {
                return Ok(false);
            };
            if doc.holder() != Some(process_id) {
                return Ok(false);
            }
            doc.set_holder(None);
            store_doc(txn, &doc)?;
            Ok(true)
        })?;
        if !released {
            return Err(StateError::NotFound(format!(
                "{} {key} leased by {process_id}",
                D::KIND
            )));
        }
        debug!(kind = D::KIND, %key, process = %process_id, "lease released");
        Ok(())
    }

    /// Clear every lease `process_id` holds on documents of type `D`, except
    /// documents that must stay put after their holder dies.
    pub fn release_leases_held_by<D: Leasable>(&self, process_id: &str) -> StateResult<usize> {
        self.update_all(
            |doc: &D| doc.holder() == Some(process_id) && doc.releasable_on_death(),
            |doc| doc.set_holder(None),
        )
    }
}
