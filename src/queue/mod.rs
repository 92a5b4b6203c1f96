//! Process queue
//!
//! Ordered, duplicate-free list of file ids awaiting dependency resolution,
//! persisted in the catalog so it survives restarts. Each entry may carry
//! the version component to bump on the outputs it triggers.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use thiserror::Error;

use dbflow_model::{FileId, ProductId, VersionPart};

use crate::catalog::{resolve_file, Catalog, CatalogError, FileSelector, QueueEntry};

/// Default number of entries written per catalog transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue index {index} out of range for length {len}")]
    IndexOutOfRange { index: isize, len: usize },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue operations over a catalog.
///
/// In dry-run mode every mutating call computes and returns its result
/// without writing.
pub struct ProcessQueue<'a> {
    catalog: &'a dyn Catalog,
    dry_run: bool,
    batch_size: usize,
}

impl<'a> ProcessQueue<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self {
            catalog,
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Validate and append files.
    ///
    /// Unknown ids or names and files already queued (including repeats in
    /// `selectors`) are dropped. Returns the ids actually added, in order.
    pub fn push(
        &self,
        selectors: &[FileSelector],
        bump: Option<VersionPart>,
    ) -> QueueResult<Vec<FileId>> {
        self.push_batched(selectors, bump, self.batch_size)
    }

    /// [`push`](Self::push) with an explicit write batch size.
    pub fn push_batched(
        &self,
        selectors: &[FileSelector],
        bump: Option<VersionPart>,
        batch_size: usize,
    ) -> QueueResult<Vec<FileId>> {
        let mut seen: HashSet<FileId> = self.get_all()?.into_iter().collect();
        let mut added = Vec::new();

        for selector in selectors {
            match resolve_file(self.catalog, selector)? {
                Some(file) => {
                    if seen.insert(file.file_id) {
                        added.push(file.file_id);
                    }
                }
                None => tracing::debug!(file = %selector, "not in catalog, not queued"),
            }
        }

        self.append(&added, bump, batch_size)?;
        Ok(added)
    }

    /// Append ids without checking they exist. Already-queued ids are still
    /// skipped. Returns how many were added.
    pub fn rawadd(&self, ids: &[FileId], bump: Option<VersionPart>) -> QueueResult<usize> {
        let mut seen: HashSet<FileId> = self.get_all()?.into_iter().collect();
        let fresh: Vec<FileId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        self.append(&fresh, bump, self.batch_size)?;
        Ok(fresh.len())
    }

    fn append(&self, ids: &[FileId], bump: Option<VersionPart>, batch_size: usize) -> QueueResult<()> {
        if self.dry_run || ids.is_empty() {
            return Ok(());
        }
        for chunk in ids.chunks(batch_size.max(1)) {
            let entries: Vec<QueueEntry> =
                chunk.iter().map(|id| QueueEntry::new(*id, bump)).collect();
            self.catalog.queue_append(&entries)?;
        }
        tracing::debug!(count = ids.len(), ?bump, "queued files");
        Ok(())
    }

    /// Remove and return the id at `index` (negative counts from the end).
    pub fn pop(&self, index: isize) -> QueueResult<FileId> {
        Ok(self.pop_entry(index)?.file_id)
    }

    /// Remove and return the entry at `index`, version bump included.
    pub fn pop_entry(&self, index: isize) -> QueueResult<QueueEntry> {
        let entry = self.get_entry(index)?;
        if !self.dry_run {
            self.catalog.queue_delete(&[entry.file_id])?;
        }
        Ok(entry)
    }

    /// The id at `index` without removing it.
    pub fn get(&self, index: isize) -> QueueResult<FileId> {
        Ok(self.get_entry(index)?.file_id)
    }

    pub fn get_entry(&self, index: isize) -> QueueResult<QueueEntry> {
        let entries = self.catalog.queue_entries()?;
        let len = entries.len();
        let resolved = if index < 0 {
            len as isize + index
        } else {
            index
        };
        if resolved < 0 || resolved as usize >= len {
            return Err(QueueError::IndexOutOfRange { index, len });
        }
        Ok(entries[resolved as usize])
    }

    pub fn get_all(&self) -> QueueResult<Vec<FileId>> {
        Ok(self
            .catalog
            .queue_entries()?
            .into_iter()
            .map(|e| e.file_id)
            .collect())
    }

    pub fn get_all_with_bump(&self) -> QueueResult<Vec<QueueEntry>> {
        Ok(self.catalog.queue_entries()?)
    }

    /// Remove entries by id or filename. Returns how many were removed.
    pub fn remove(&self, selectors: &[FileSelector]) -> QueueResult<usize> {
        let mut ids = HashSet::new();
        for selector in selectors {
            match selector {
                // ids need not exist in the catalog: rawadd may have queued them
                FileSelector::Id(id) => {
                    ids.insert(*id);
                }
                FileSelector::Name(_) => {
                    if let Some(file) = resolve_file(self.catalog, selector)? {
                        ids.insert(file.file_id);
                    }
                }
            }
        }

        let doomed: Vec<FileId> = self
            .get_all()?
            .into_iter()
            .filter(|id| ids.contains(id))
            .collect();
        if !self.dry_run && !doomed.is_empty() {
            self.catalog.queue_delete(&doomed)?;
        }
        Ok(doomed.len())
    }

    /// Collapse entries for the same product, date and keyword to the one
    /// queued first. Entries for files missing from the catalog are kept.
    pub fn clean(&self) -> QueueResult<usize> {
        let mut survivors: HashMap<(ProductId, NaiveDate, Option<String>), FileId> =
            HashMap::new();
        let mut doomed = Vec::new();

        for id in self.get_all()? {
            let Some(file) = self.catalog.file(id)? else {
                continue;
            };
            let key = (file.product_id, file.utc_file_date, file.process_keyword);
            if survivors.contains_key(&key) {
                doomed.push(id);
            } else {
                survivors.insert(key, id);
            }
        }

        if !self.dry_run && !doomed.is_empty() {
            self.catalog.queue_delete(&doomed)?;
        }
        tracing::debug!(removed = doomed.len(), "cleaned process queue");
        Ok(doomed.len())
    }

    /// Empty the queue. Returns how many entries were dropped.
    pub fn flush(&self) -> QueueResult<usize> {
        if self.dry_run {
            return self.len();
        }
        Ok(self.catalog.queue_clear()?)
    }

    pub fn len(&self) -> QueueResult<usize> {
        Ok(self.catalog.queue_entries()?.len())
    }

    pub fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{add_file, catalog, date, product};
    use crate::catalog::SqliteCatalog;
    use dbflow_model::Version;

    struct Fixture {
        catalog: SqliteCatalog,
        ids: Vec<FileId>,
    }

    /// Catalog with files a1, a2 (same product and date), b1 (next day).
    fn fixture() -> Fixture {
        let catalog = catalog("/data");
        let product = product(&catalog, "p", 0.0);
        let ids = vec![
            add_file(&catalog, product, "a1.dat", date(2013, 9, 1), Version::new(1, 0, 0)).file_id,
            add_file(&catalog, product, "a2.dat", date(2013, 9, 1), Version::new(1, 1, 0)).file_id,
            add_file(&catalog, product, "b1.dat", date(2013, 9, 2), Version::new(1, 0, 0)).file_id,
        ];
        Fixture { catalog, ids }
    }

    fn sel(ids: &[FileId]) -> Vec<FileSelector> {
        ids.iter().map(|id| FileSelector::Id(*id)).collect()
    }

    #[test]
    fn test_push_filters_unknown_and_duplicates() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        let (a1, a2) = (fx.ids[0], fx.ids[1]);

        let added = queue.push(&sel(&[a1, 9999, a1, a2]), None).unwrap();
        assert_eq!(added, vec![a1, a2]);

        let again = queue.push(&sel(&[a2, a1]), None).unwrap();
        assert!(again.is_empty());
        assert_eq!(queue.get_all().unwrap(), vec![a1, a2]);
    }

    #[test]
    fn test_push_by_name_records_bump() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        let added = queue
            .push(&["b1.dat".into(), "missing.dat".into()], Some(VersionPart::Quality))
            .unwrap();
        assert_eq!(added, vec![fx.ids[2]]);
        assert_eq!(
            queue.get_all_with_bump().unwrap(),
            vec![QueueEntry::new(fx.ids[2], Some(VersionPart::Quality))]
        );
    }

    #[test]
    fn test_push_batched_writes_everything() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        let added = queue.push_batched(&sel(&fx.ids), None, 1).unwrap();
        assert_eq!(added.len(), 3);
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn test_rawadd_skips_validation_not_dedup() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        assert_eq!(queue.rawadd(&[9999, 9999, fx.ids[0]], None).unwrap(), 2);
        assert_eq!(queue.rawadd(&[9999], None).unwrap(), 0);
        assert_eq!(queue.get_all().unwrap(), vec![9999, fx.ids[0]]);
    }

    #[test]
    fn test_pop_and_get_indexing() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        queue.rawadd(&[10, 20, 30], None).unwrap();

        assert_eq!(queue.get(0).unwrap(), 10);
        assert_eq!(queue.get(-1).unwrap(), 30);
        assert!(matches!(
            queue.get(3),
            Err(QueueError::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert!(queue.get(-4).is_err());

        assert_eq!(queue.pop(-1).unwrap(), 30);
        assert_eq!(queue.pop(0).unwrap(), 10);
        assert_eq!(queue.get_all().unwrap(), vec![20]);
    }

    #[test]
    fn test_pop_empty_fails() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        assert!(matches!(
            queue.pop(0),
            Err(QueueError::IndexOutOfRange { len: 0, .. })
        ));
    }

    #[test]
    fn test_remove_mixed_selectors_preserves_order() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        queue.rawadd(&[fx.ids[0], 77, fx.ids[1], fx.ids[2]], None).unwrap();

        let removed = queue
            .remove(&[FileSelector::Id(77), "a2.dat".into(), "nope.dat".into()])
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.get_all().unwrap(), vec![fx.ids[0], fx.ids[2]]);
    }

    #[test]
    fn test_clean_keeps_first_per_product_date() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        queue
            .rawadd(&[fx.ids[1], 555, fx.ids[0], fx.ids[2]], None)
            .unwrap();

        assert_eq!(queue.clean().unwrap(), 1);
        assert_eq!(queue.get_all().unwrap(), vec![fx.ids[1], 555, fx.ids[2]]);
    }

    #[test]
    fn test_clean_keeps_keyword_series_apart() {
        let fx = fixture();
        let product = fx.catalog.file(fx.ids[0]).unwrap().unwrap().product_id;
        let mut burst = crate::catalog::testing::describe(
            product,
            "a_burst.dat",
            date(2013, 9, 1),
            Version::new(1, 0, 0),
        );
        burst.process_keyword = Some("burst".into());
        let burst = fx
            .catalog
            .insert_file(&crate::catalog::NewFile::from(burst), &mut |_| Ok(()))
            .unwrap()
            .file_id;

        let queue = ProcessQueue::new(&fx.catalog);
        queue.rawadd(&[fx.ids[0], burst, fx.ids[1]], None).unwrap();
        assert_eq!(queue.clean().unwrap(), 1);
        assert_eq!(queue.get_all().unwrap(), vec![fx.ids[0], burst]);
    }

    #[test]
    fn test_flush() {
        let fx = fixture();
        let queue = ProcessQueue::new(&fx.catalog);
        queue.rawadd(&fx.ids, None).unwrap();
        assert_eq!(queue.flush().unwrap(), 3);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let fx = fixture();
        let live = ProcessQueue::new(&fx.catalog);
        live.rawadd(&[fx.ids[0]], None).unwrap();

        let dry = ProcessQueue::new(&fx.catalog).with_dry_run(true);
        assert_eq!(dry.push(&sel(&fx.ids), None).unwrap(), vec![fx.ids[1], fx.ids[2]]);
        assert_eq!(dry.rawadd(&[42], None).unwrap(), 1);
        assert_eq!(dry.pop(0).unwrap(), fx.ids[0]);
        assert_eq!(dry.flush().unwrap(), 1);

        assert_eq!(live.get_all().unwrap(), vec![fx.ids[0]]);
    }
}
