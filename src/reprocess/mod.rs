//! Reprocessing triggers
//!
//! Bulk re-enqueueing of cataloged files so the next cycle rebuilds what
//! depends on them, optionally with a version bump on the new outputs.
//! Selections only ever include newest-version files and go straight to
//! [`ProcessQueue::rawadd`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dbflow_model::{CodeId, DateRange, FileId, InstrumentId, ProductId, VersionPart};

use crate::catalog::{Catalog, CatalogError, CatalogRef, FileFilter};
use crate::queue::{ProcessQueue, QueueError};

#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type ReprocessResult<T> = Result<T, ReprocessError>;

/// Which files go on the queue for a selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessScope {
    /// The selected files themselves; their children get rebuilt.
    #[default]
    Selected,
    /// The parents of the selected files; the selected files get rebuilt.
    Parents,
}

pub struct Reprocessor<'a> {
    catalog: &'a dyn Catalog,
    queue: &'a ProcessQueue<'a>,
    scope: ReprocessScope,
}

impl<'a> Reprocessor<'a> {
    pub fn new(catalog: &'a dyn Catalog, queue: &'a ProcessQueue<'a>) -> Self {
        Self {
            catalog,
            queue,
            scope: ReprocessScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: ReprocessScope) -> Self {
        self.scope = scope;
        self
    }

    /// Files produced by `code`.
    pub fn by_code(
        &self,
        code: &CatalogRef,
        range: DateRange,
        bump: Option<VersionPart>,
    ) -> ReprocessResult<usize> {
        let code = self.code_id(code)?;
        self.enqueue(
            &FileFilter {
                code: Some(code),
                range,
                ..Self::newest()
            },
            bump,
        )
    }

    /// Files of `product`.
    pub fn by_product(
        &self,
        product: &CatalogRef,
        range: DateRange,
        bump: Option<VersionPart>,
    ) -> ReprocessResult<usize> {
        let product = self.product_id(product)?;
        self.by_product_id(product, range, bump)
    }

    fn by_product_id(
        &self,
        product: ProductId,
        range: DateRange,
        bump: Option<VersionPart>,
    ) -> ReprocessResult<usize> {
        self.enqueue(
            &FileFilter {
                product: Some(product),
                range,
                ..Self::newest()
            },
            bump,
        )
    }

    /// Files of every product of `instrument`, optionally one level only.
    pub fn by_instrument(
        &self,
        instrument: &CatalogRef,
        level: Option<f64>,
        range: DateRange,
        bump: Option<VersionPart>,
    ) -> ReprocessResult<usize> {
        let instrument = self.instrument_id(instrument)?;
        let mut total = 0;
        for product in self.catalog.instrument_products(instrument, level)? {
            total += self.by_product_id(product.product_id, range, bump)?;
        }
        Ok(total)
    }

    /// Files of any product in `range`, optionally one level only.
    pub fn by_date(
        &self,
        range: DateRange,
        level: Option<f64>,
        bump: Option<VersionPart>,
    ) -> ReprocessResult<usize> {
        self.enqueue(
            &FileFilter {
                level,
                range,
                ..Self::newest()
            },
            bump,
        )
    }

    /// Every newest file. Never bumps versions: this is a pure re-run.
    pub fn all(&self) -> ReprocessResult<usize> {
        self.enqueue(&Self::newest(), None)
    }

    fn newest() -> FileFilter {
        FileFilter {
            newest_only: true,
            ..Default::default()
        }
    }

    fn enqueue(&self, filter: &FileFilter, bump: Option<VersionPart>) -> ReprocessResult<usize> {
        let selected: Vec<FileId> = self
            .catalog
            .select_files(filter)?
            .into_iter()
            .map(|f| f.file_id)
            .collect();

        let ids = match self.scope {
            ReprocessScope::Selected => selected,
            ReprocessScope::Parents => {
                let mut parents = Vec::new();
                for id in selected {
                    for parent in self.catalog.file_parents(id)? {
                        if !parents.contains(&parent) {
                            parents.push(parent);
                        }
                    }
                }
                parents
            }
        };

        let added = self.queue.rawadd(&ids, bump)?;
        tracing::info!(
            selected = ids.len(),
            added,
            scope = ?self.scope,
            ?bump,
            "reprocessing queued"
        );
        Ok(added)
    }

    fn code_id(&self, code: &CatalogRef) -> ReprocessResult<CodeId> {
        let found = match code {
            CatalogRef::Id(id) => self.catalog.code(*id)?,
            CatalogRef::Name(name) => self.catalog.code_by_name(name)?,
        };
        found
            .map(|c| c.code_id)
            .ok_or_else(|| CatalogError::not_found("code", code).into())
    }

    fn product_id(&self, product: &CatalogRef) -> ReprocessResult<ProductId> {
        let found = match product {
            CatalogRef::Id(id) => self.catalog.product(*id)?,
            CatalogRef::Name(name) => self.catalog.product_by_name(name)?,
        };
        found
            .map(|p| p.product_id)
            .ok_or_else(|| CatalogError::not_found("product", product).into())
    }

    fn instrument_id(&self, instrument: &CatalogRef) -> ReprocessResult<InstrumentId> {
        let found = match instrument {
            CatalogRef::Id(id) => self.catalog.instrument(*id)?,
            CatalogRef::Name(name) => self.catalog.instrument_by_name(name)?,
        };
        found
            .map(|i| i.instrument_id)
            .ok_or_else(|| CatalogError::not_found("instrument", instrument).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::{add_file, catalog, date, describe, product};
    use crate::catalog::{NewCode, NewFile, NewProcess, SqliteCatalog};
    use dbflow_model::{Timebase, Version};

    fn seeded() -> (SqliteCatalog, ProductId, ProductId) {
        let catalog = catalog("/data");
        let l0 = product(&catalog, "l0", 0.0);
        let l1 = product(&catalog, "l1", 1.0);
        add_file(&catalog, l0, "l0_20200101_v1.0.0.dat", date(2020, 1, 1), Version::default());
        add_file(&catalog, l0, "l0_20200102_v1.0.0.dat", date(2020, 1, 2), Version::default());
        // superseded, never selected
        add_file(&catalog, l0, "l0_20200103_v1.0.0.dat", date(2020, 1, 3), Version::default());
        add_file(&catalog, l0, "l0_20200103_v1.1.0.dat", date(2020, 1, 3), Version::new(1, 1, 0));
        add_file(&catalog, l1, "l1_20200101_v1.0.0.dat", date(2020, 1, 1), Version::default());
        (catalog, l0, l1)
    }

    #[test]
    fn test_by_product_newest_only() {
        let (catalog, _, _) = seeded();
        let queue = ProcessQueue::new(&catalog);
        let reprocessor = Reprocessor::new(&catalog, &queue);

        let added = reprocessor
            .by_product(&CatalogRef::Name("l0".into()), DateRange::unbounded(), Some(VersionPart::Quality))
            .unwrap();
        assert_eq!(added, 3);
        assert!(queue
            .get_all_with_bump()
            .unwrap()
            .iter()
            .all(|e| e.version_bump == Some(VersionPart::Quality)));
    }

    #[test]
    fn test_by_product_date_bounds_inclusive() {
        let (catalog, l0, _) = seeded();
        let queue = ProcessQueue::new(&catalog);
        let reprocessor = Reprocessor::new(&catalog, &queue);

        let range = DateRange::new(Some(date(2020, 1, 2)), Some(date(2020, 1, 3))).unwrap();
        assert_eq!(reprocessor.by_product(&CatalogRef::Id(l0), range, None).unwrap(), 2);
    }

    #[test]
    fn test_by_instrument_sums_products_and_filters_level() {
        let (catalog, _, _) = seeded();
        let queue = ProcessQueue::new(&catalog);
        let reprocessor = Reprocessor::new(&catalog, &queue);
        let inst = CatalogRef::Name("inst".into());

        assert_eq!(
            reprocessor.by_instrument(&inst, Some(1.0), DateRange::unbounded(), None).unwrap(),
            1
        );
        assert_eq!(
            reprocessor.by_instrument(&inst, None, DateRange::unbounded(), None).unwrap(),
            3
        );
        assert_eq!(queue.len().unwrap(), 4);
    }

    #[test]
    fn test_by_date_and_all() {
        let (catalog, _, _) = seeded();
        let queue = ProcessQueue::new(&catalog);
        let reprocessor = Reprocessor::new(&catalog, &queue);

        let day = DateRange::new(Some(date(2020, 1, 1)), Some(date(2020, 1, 1))).unwrap();
        assert_eq!(reprocessor.by_date(day, None, None).unwrap(), 2);
        // already queued entries are not counted again
        assert_eq!(reprocessor.all().unwrap(), 2);
        assert!(queue.get_all_with_bump().unwrap().iter().all(|e| e.version_bump.is_none()));
    }

    #[test]
    fn test_by_code_and_parent_scope() {
        let (catalog, _, l1) = seeded();
        let process = catalog
            .add_process(&NewProcess {
                name: "l1".into(),
                output_product: l1,
                timebase: Timebase::File,
                extra_params: None,
                inputs: vec![],
            })
            .unwrap();
        let code = catalog
            .add_code(&NewCode {
                process_id: process,
                filename: "l1.sh".into(),
                relative_path: "codes".into(),
                start: date(2000, 1, 1),
                stop: date(2100, 1, 1),
                code_version: Version::default(),
                output_version: Version::default(),
                active: true,
            })
            .unwrap();
        let parent = catalog.file_by_name("l0_20200102_v1.0.0.dat").unwrap().unwrap();
        let mut built = NewFile::from(describe(l1, "l1_20200102_v1.0.0.dat", date(2020, 1, 2), Version::default()));
        built.parents = vec![parent.file_id];
        built.code = Some(code);
        catalog.insert_file(&built, &mut |_| Ok(())).unwrap();

        let queue = ProcessQueue::new(&catalog);
        let by_name = CatalogRef::Name("l1.sh".into());
        let parents = Reprocessor::new(&catalog, &queue).with_scope(ReprocessScope::Parents);
        assert_eq!(parents.by_code(&by_name, DateRange::unbounded(), None).unwrap(), 1);
        assert_eq!(queue.get_all().unwrap(), vec![parent.file_id]);

        let selected = Reprocessor::new(&catalog, &queue);
        assert_eq!(selected.by_code(&CatalogRef::Id(code), DateRange::unbounded(), None).unwrap(), 1);
    }

    #[test]
    fn test_unknown_reference() {
        let (catalog, _, _) = seeded();
        let queue = ProcessQueue::new(&catalog);
        let err = Reprocessor::new(&catalog, &queue)
            .by_product(&CatalogRef::Name("nope".into()), DateRange::unbounded(), None)
            .unwrap_err();
        assert!(matches!(err, ReprocessError::Catalog(CatalogError::NotFound { .. })));
    }
}
