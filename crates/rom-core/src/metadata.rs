//! Export and import of the model's metadata.
//!
//! A [`MetadataSnapshot`] holds everything layered over the bytes (anchors, run formats and
//! named lists) and nothing else; it is meant to be stored beside the buffer and re-applied
//! later. Anchored runs carry a CRC-32 of their bytes so a load can tell when the data under a
//! name changed since the export.

use crate::delta::ModelDelta;
use crate::error::{ModelError, Result};
use crate::model::RomModel;
use crate::runs::FormatDescriptor;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// An anchor and, when it names a run, the run's format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAnchor {
    /// Anchor name.
    pub name: String,
    /// Bound address.
    pub address: usize,
    /// Format of the run starting at the anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatDescriptor>,
    /// CRC-32 of the run's bytes at export time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u32>,
}

/// An unnamed formatted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRun {
    /// Start address.
    pub address: usize,
    /// Format to declare.
    pub format: FormatDescriptor,
}

/// A named list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredList {
    /// List name.
    pub name: String,
    /// Entries in order.
    pub entries: Vec<String>,
    /// CRC-32 of the entries.
    pub hash: u32,
}

/// Serializable metadata of a [`RomModel`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    /// Anchors in address order.
    pub anchors: Vec<StoredAnchor>,
    /// Runs without an anchor, in address order.
    pub runs: Vec<StoredRun>,
    /// Named lists in name order.
    pub lists: Vec<StoredList>,
}

/// A format that could not be re-declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    /// Address of the declaration.
    pub address: usize,
    /// Why it failed.
    pub error: ModelError,
}

/// Outcome of [`RomModel::load_metadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Anchors and lists whose hash no longer matches. Drifted anchors keep their name but
    /// lose their format.
    pub drifted: Vec<String>,
    /// Declarations that failed.
    pub rejected: Vec<Rejected>,
    /// Names that collided and were made unique, as `(stored, applied)`.
    pub renamed: Vec<(String, String)>,
}

impl LoadReport {
    /// Whether everything loaded as stored.
    pub fn is_clean(&self) -> bool {
        self.drifted.is_empty() && self.rejected.is_empty() && self.renamed.is_empty()
    }
}

fn list_hash(entries: &[String]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for entry in entries {
        hasher.update(entry.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

struct PendingFormat {
    address: usize,
    format: FormatDescriptor,
    /// Anchor name and expected hash for anchored runs.
    check: Option<(String, u32)>,
}

impl PendingFormat {
    fn order(&self) -> u8 {
        u8::from(self.format.is_matching()) + 2 * u8::from(self.format.stores_pointers())
    }
}

impl RomModel {
    /// Capture anchors, run formats and lists.
    pub fn export_metadata(&self) -> MetadataSnapshot {
        let anchors = self
            .anchors()
            .iter()
            .map(|(address, name)| {
                let run = self.run_exactly_at(address);
                let format = run.and_then(|run| run.format_descriptor());
                let hash = format
                    .as_ref()
                    .and(run)
                    .and_then(|run| self.bytes().get(run.start()..run.end()))
                    .map(crc32fast::hash);
                StoredAnchor {
                    name: name.to_string(),
                    address,
                    format,
                    hash,
                }
            })
            .collect();

        let runs = self
            .runs()
            .filter(|run| self.address_anchor_name(run.start()).is_none())
            .filter_map(|run| {
                Some(StoredRun {
                    address: run.start(),
                    format: run.format_descriptor()?,
                })
            })
            .collect();

        let lists = self
            .lists()
            .map(|(name, entries)| StoredList {
                name: name.to_string(),
                entries: entries.to_vec(),
                hash: list_hash(entries),
            })
            .collect();

        MetadataSnapshot {
            anchors,
            runs,
            lists,
        }
    }

    /// Replace all metadata with `snapshot`.
    ///
    /// Buffer bytes are left untouched and nothing is recorded for undo. Problems with
    /// individual entries are collected in the report rather than failing the load.
    pub fn load_metadata(&mut self, snapshot: &MetadataSnapshot) -> Result<LoadReport> {
        if self.is_reverting() {
            return Err(ModelError::Reentrancy {
                operation: "load metadata",
            });
        }

        self.reset_metadata();
        let mut scratch = ModelDelta::new();
        let mut report = LoadReport::default();

        for list in &snapshot.lists {
            if list_hash(&list.entries) != list.hash {
                warn!(name = %list.name, "stored list does not match its hash");
                report.drifted.push(list.name.clone());
            }
            if let Err(error) = self.set_list(&list.name, list.entries.clone(), &mut scratch) {
                report.rejected.push(Rejected { address: 0, error });
            }
        }

        let mut pending = Vec::new();
        for anchor in &snapshot.anchors {
            match self.set_anchor(anchor.address, &anchor.name, &mut scratch) {
                Ok(outcome) => {
                    if outcome.renamed {
                        report.renamed.push((anchor.name.clone(), outcome.name.clone()));
                    }
                    if let Some(format) = &anchor.format {
                        pending.push(PendingFormat {
                            address: anchor.address,
                            format: format.clone(),
                            check: anchor.hash.map(|hash| (outcome.name, hash)),
                        });
                    }
                }
                Err(error) => report.rejected.push(Rejected {
                    address: anchor.address,
                    error,
                }),
            }
        }
        pending.extend(snapshot.runs.iter().map(|run| PendingFormat {
            address: run.address,
            format: run.format.clone(),
            check: None,
        }));
        pending.sort_by_key(PendingFormat::order);

        // Matching tables may follow tables declared later in the list; retry until stable.
        loop {
            let before = pending.len();
            let mut failed = Vec::new();
            for format in pending {
                if let Err(error) = self.apply_stored_format(&format, &mut report, &mut scratch) {
                    failed.push((format, error));
                }
            }
            if failed.is_empty() || failed.len() == before {
                report
                    .rejected
                    .extend(failed.into_iter().map(|(format, error)| Rejected {
                        address: format.address,
                        error,
                    }));
                break;
            }
            pending = failed.into_iter().map(|(format, _)| format).collect();
        }

        info!(
            anchors = self.anchors().len(),
            runs = self.run_count(),
            lists = snapshot.lists.len(),
            drifted = report.drifted.len(),
            rejected = report.rejected.len(),
            "metadata loaded"
        );
        Ok(report)
    }

    fn apply_stored_format(
        &mut self,
        pending: &PendingFormat,
        report: &mut LoadReport,
        scratch: &mut ModelDelta,
    ) -> Result<()> {
        if let Some((name, expected)) = &pending.check {
            let run = self.build_run(pending.address, &pending.format)?;
            let actual = self
                .bytes()
                .get(run.start()..run.end())
                .map(crc32fast::hash);
            if actual != Some(*expected) {
                warn!(name = %name, address = pending.address, "anchored data changed since export");
                report.drifted.push(name.clone());
                return Ok(());
            }
        }
        self.declare_run(pending.address, pending.format.clone(), scratch)
    }
}
