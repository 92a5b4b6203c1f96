//! Reference data loaded from a TOML seed file.
//!
//! Objects refer to each other by name; ids are assigned by the catalog as
//! the seed is applied.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

use dbflow_model::{Timebase, Version};

use super::{
    CatalogError, MissionRecord, NewCode, NewProcess, NewProduct, ProcessInput, SqliteCatalog,
};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse seed file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("seed refers to unknown {kind} '{name}'")]
    UnknownReference { kind: &'static str, name: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSeed {
    pub mission: MissionRecord,
    #[serde(default, rename = "instrument")]
    pub instruments: Vec<SeedInstrument>,
    #[serde(default, rename = "product")]
    pub products: Vec<SeedProduct>,
    #[serde(default, rename = "process")]
    pub processes: Vec<SeedProcess>,
    #[serde(default, rename = "code")]
    pub codes: Vec<SeedCode>,
    #[serde(default, rename = "inspector")]
    pub inspectors: Vec<SeedInspector>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedInstrument {
    pub name: String,
    pub satellite: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    pub name: String,
    pub instrument: String,
    pub level: f64,
    pub format: String,
    pub relative_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedInput {
    pub product: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProcess {
    pub name: String,
    pub output_product: String,
    pub timebase: Timebase,
    #[serde(default)]
    pub extra_params: Option<String>,
    #[serde(default)]
    pub inputs: Vec<SeedInput>,
    /// Processes that must not build at the same time
    #[serde(default)]
    pub related: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCode {
    pub process: String,
    pub filename: String,
    pub relative_path: String,
    pub start: NaiveDate,
    pub stop: NaiveDate,
    pub code_version: Version,
    pub output_version: Version,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedInspector {
    pub name: String,
    pub product: String,
    #[serde(default)]
    pub arguments: Option<String>,
}

fn default_active() -> bool {
    true
}

fn lookup(
    ids: &HashMap<String, i64>,
    kind: &'static str,
    name: &str,
) -> Result<i64, SeedError> {
    ids.get(name).copied().ok_or_else(|| SeedError::UnknownReference {
        kind,
        name: name.to_string(),
    })
}

impl CatalogSeed {
    pub fn from_toml_str(content: &str) -> Result<Self, SeedError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Insert everything into `catalog`.
    pub fn apply(&self, catalog: &SqliteCatalog) -> Result<(), SeedError> {
        catalog.set_mission(&self.mission)?;

        let mut instruments = HashMap::new();
        for inst in &self.instruments {
            let id = catalog.add_instrument(&inst.name, &inst.satellite)?;
            instruments.insert(inst.name.clone(), id);
        }

        let mut products = HashMap::new();
        for product in &self.products {
            let id = catalog.add_product(&NewProduct {
                name: product.name.clone(),
                instrument_id: lookup(&instruments, "instrument", &product.instrument)?,
                level: product.level,
                format: product.format.clone(),
                relative_path: product.relative_path.clone(),
            })?;
            products.insert(product.name.clone(), id);
        }

        let mut processes = HashMap::new();
        for process in &self.processes {
            let inputs = process
                .inputs
                .iter()
                .map(|input| {
                    Ok(ProcessInput {
                        product_id: lookup(&products, "product", &input.product)?,
                        optional: input.optional,
                    })
                })
                .collect::<Result<Vec<_>, SeedError>>()?;
            let id = catalog.add_process(&NewProcess {
                name: process.name.clone(),
                output_product: lookup(&products, "product", &process.output_product)?,
                timebase: process.timebase,
                extra_params: process.extra_params.clone(),
                inputs,
            })?;
            processes.insert(process.name.clone(), id);
        }
        for process in &self.processes {
            let id = lookup(&processes, "process", &process.name)?;
            for related in &process.related {
                catalog.add_related_process(id, lookup(&processes, "process", related)?)?;
            }
        }

        for code in &self.codes {
            catalog.add_code(&NewCode {
                process_id: lookup(&processes, "process", &code.process)?,
                filename: code.filename.clone(),
                relative_path: code.relative_path.clone(),
                start: code.start,
                stop: code.stop,
                code_version: code.code_version,
                output_version: code.output_version,
                active: code.active,
            })?;
        }

        for inspector in &self.inspectors {
            catalog.add_inspector(
                &inspector.name,
                lookup(&products, "product", &inspector.product)?,
                inspector.arguments.as_deref(),
            )?;
        }

        tracing::info!(
            mission = %self.mission.mission_name,
            products = self.products.len(),
            processes = self.processes.len(),
            "catalog seeded"
        );
        Ok(())
    }
}
