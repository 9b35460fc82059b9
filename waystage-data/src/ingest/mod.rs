//! Staging of OpenStreetMap PBF extracts.
//!
//! Elements are read sequentially so the file's node, way, relation order
//! reaches the writer unchanged; the id codec relies on that order to
//! rewrite member references.
use std::path::{Path, PathBuf};

use log::info;
use osmpbf::{Element, ElementReader};
use thiserror::Error;

use crate::writer::{StagingWriteError, StagingWriter};

mod convert;

/// Raw element counts of one staged extract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OsmStageReport {
    /// Nodes read, including dense-node entries.
    pub nodes: u64,
    /// Ways read.
    pub ways: u64,
    /// Relations read.
    pub relations: u64,
}

impl OsmStageReport {
    fn record(&mut self, element: &Element<'_>) {
        match element {
            Element::Node(_) | Element::DenseNode(_) => self.nodes += 1,
            Element::Way(_) => self.ways += 1,
            Element::Relation(_) => self.relations += 1,
        }
    }
}

/// Errors returned when staging an OSM PBF file.
#[derive(Debug, Error)]
pub enum OsmStageError {
    #[error("failed to open OSM PBF file at {path:?}")]
    Open {
        #[source]
        source: osmpbf::Error,
        path: PathBuf,
    },
    #[error("failed to decode OSM PBF data at {path:?}")]
    Decode {
        #[source]
        source: osmpbf::Error,
        path: PathBuf,
    },
    #[error("failed to stage OSM PBF data from {path:?}")]
    Stage {
        #[source]
        source: StagingWriteError,
        path: PathBuf,
    },
}

/// Read an extract and hand every element to `writer`.
///
/// The first fatal writer error stops staging; elements after it are still
/// decoded but ignored.
///
/// # Examples
/// ```no_run
/// use std::path::Path;
/// use camino::Utf8Path;
/// use waystage_core::{RuleTable, StagingConfig};
/// use waystage_data::{StagingWriter, stage_osm_pbf};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut writer = StagingWriter::create(
///     Utf8Path::new("berlin.staging.db"),
///     StagingConfig::default(),
///     RuleTable::default(),
/// )?;
/// let report = stage_osm_pbf(Path::new("berlin.osm.pbf"), &mut writer)?;
/// println!("Staged {} ways", report.ways);
/// writer.finish()?;
/// # Ok(())
/// # }
/// ```
pub fn stage_osm_pbf(
    path: &Path,
    writer: &mut StagingWriter,
) -> Result<OsmStageReport, OsmStageError> {
    let reader = ElementReader::from_path(path).map_err(|source| OsmStageError::Open {
        source,
        path: path.to_path_buf(),
    })?;

    let mut report = OsmStageReport::default();
    let mut failure = None;
    reader
        .for_each(|element| {
            if failure.is_some() {
                return;
            }
            report.record(&element);
            if let Err(err) = writer.write(convert::to_entity(&element)) {
                failure = Some(err);
            }
        })
        .map_err(|source| OsmStageError::Decode {
            source,
            path: path.to_path_buf(),
        })?;

    if let Some(source) = failure {
        return Err(OsmStageError::Stage {
            source,
            path: path.to_path_buf(),
        });
    }
    info!(
        "read {} nodes, {} ways and {} relations from {}",
        report.nodes,
        report.ways,
        report.relations,
        path.display()
    );
    Ok(report)
}
