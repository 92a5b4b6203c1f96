//! Inspector registry and claim resolution.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::description::{FileDescription, ProductContext};
use crate::digest::file_digest;
use crate::kwargs::parse_kwargs;
use crate::template::TemplateInspector;
use crate::Inspector;

/// How many inspectors are consulted per file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPolicy {
    /// Stop at the first inspector that claims the file.
    #[default]
    FirstMatch,
    /// Run every inspector; more than one claim is an error.
    Exhaustive,
}

/// One active inspector registration from the catalog.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Registry key
    pub inspector: String,
    /// Raw argument string (`key=value ...`)
    pub args: Option<String>,
    /// The product this registration recognises
    pub product: ProductContext,
}

/// Errors surfaced by [`InspectorRegistry::classify`].
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("{path} claimed by more than one product: {}", products.join(", "))]
    Ambiguous { path: PathBuf, products: Vec<String> },

    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Inspectors known to this binary, keyed by registration name.
pub struct InspectorRegistry {
    inspectors: BTreeMap<String, Box<dyn Inspector>>,
    policy: ClaimPolicy,
}

impl InspectorRegistry {
    /// Registry name of the built-in template inspector.
    pub const TEMPLATE: &'static str = "template";

    /// An empty registry.
    pub fn new() -> Self {
        Self {
            inspectors: BTreeMap::new(),
            policy: ClaimPolicy::default(),
        }
    }

    /// A registry holding the built-in inspectors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Self::TEMPLATE, TemplateInspector);
        registry
    }

    pub fn with_policy(mut self, policy: ClaimPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ClaimPolicy {
        self.policy
    }

    /// Register an inspector, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, inspector: impl Inspector + 'static) {
        self.inspectors.insert(name.into(), Box::new(inspector));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inspectors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.inspectors.keys().map(String::as_str).collect()
    }

    /// Run the candidates against `path`.
    ///
    /// Returns `Ok(None)` when nothing claims the file. Inspector errors and
    /// incomplete inspections count as "no match". Under
    /// [`ClaimPolicy::Exhaustive`] more than one claim is an error.
    pub fn classify(
        &self,
        path: &Path,
        candidates: &[Candidate],
    ) -> Result<Option<FileDescription>, ClassifyError> {
        let io_err = |source| ClassifyError::Io {
            path: path.to_path_buf(),
            source,
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut claims: Vec<(String, &Candidate, crate::Inspection)> = Vec::new();

        for candidate in candidates {
            let Some(inspector) = self.inspectors.get(&candidate.inspector) else {
                tracing::warn!(
                    inspector = %candidate.inspector,
                    "inspector is active in the catalog but not registered"
                );
                continue;
            };

            let outcome = parse_kwargs(candidate.args.as_deref())
                .and_then(|kwargs| inspector.inspect(path, &candidate.product, &kwargs));

            match outcome {
                Ok(Some(inspection)) => {
                    tracing::debug!(
                        inspector = %candidate.inspector,
                        product = %candidate.product.product_name,
                        file = %filename,
                        "inspector claimed file"
                    );
                    claims.push((candidate.inspector.clone(), candidate, inspection));
                    if self.policy == ClaimPolicy::FirstMatch {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        inspector = %candidate.inspector,
                        file = %filename,
                        error = %e,
                        "inspector failed, treating as no match"
                    );
                }
            }
        }

        if claims.len() > 1 {
            return Err(ClassifyError::Ambiguous {
                path: path.to_path_buf(),
                products: claims
                    .iter()
                    .map(|(_, c, _)| c.product.product_name.clone())
                    .collect(),
            });
        }

        let Some((name, candidate, inspection)) = claims.pop() else {
            return Ok(None);
        };

        let shasum = file_digest(path).map_err(io_err)?;
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(io_err)?;
        let file_create_date = DateTime::<Local>::from(modified).naive_local();

        let description = FileDescription::populate(
            filename,
            &candidate.product,
            inspection,
            shasum,
            file_create_date,
            &name,
        );

        if let Err(field) = description.validate() {
            tracing::debug!(
                inspector = %name,
                file = %description.filename,
                field,
                "inspection incomplete, treating as no match"
            );
            return Ok(None);
        }

        Ok(Some(description))
    }
}

impl Default for InspectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
