//! Catalog builders for unit tests.

use chrono::{NaiveDate, NaiveDateTime};

use dbflow_inspector::{FileDescription, Inspection};
use dbflow_model::{ProductId, Version};

use super::{Catalog, FileRecord, MissionRecord, NewFile, NewProduct, SqliteCatalog};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// In-memory catalog with a mission rooted at `rootdir`.
pub fn catalog(rootdir: &str) -> SqliteCatalog {
    let catalog = SqliteCatalog::in_memory().unwrap();
    catalog
        .set_mission(&MissionRecord {
            mission_name: "testmission".into(),
            rootdir: rootdir.into(),
            incoming_dir: None,
            error_dir: None,
        })
        .unwrap();
    catalog
}

pub fn product(catalog: &SqliteCatalog, name: &str, level: f64) -> ProductId {
    let instrument = match catalog.instrument_by_name("inst").unwrap() {
        Some(inst) => inst.instrument_id,
        None => catalog.add_instrument("inst", "sat").unwrap(),
    };
    catalog
        .add_product(&NewProduct {
            name: name.into(),
            instrument_id: instrument,
            level,
            format: format!("{}_{{Y}}{{m}}{{d}}_v{{VERSION}}.dat", name),
            relative_path: name.into(),
        })
        .unwrap()
}

pub fn describe(product: ProductId, name: &str, day: NaiveDate, version: Version) -> FileDescription {
    let inspection = Inspection::for_day(day, version);
    FileDescription {
        filename: name.into(),
        product_id: product,
        data_level: 0.0,
        mission: "testmission".into(),
        utc_file_date: day,
        utc_start_time: inspection.utc_start_time,
        utc_stop_time: inspection.utc_stop_time,
        version,
        process_keyword: None,
        shasum: "f".repeat(64),
        file_create_date: NaiveDateTime::default(),
        exists_on_disk: true,
        quality_comment: None,
        caveats: None,
        release_number: None,
        verbose_provenance: None,
        inspector: "test".into(),
    }
}

pub fn add_file(
    catalog: &SqliteCatalog,
    product: ProductId,
    name: &str,
    day: NaiveDate,
    version: Version,
) -> FileRecord {
    catalog
        .insert_file(&NewFile::from(describe(product, name, day, version)), &mut |_| Ok(()))
        .unwrap()
}
