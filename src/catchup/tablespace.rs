//! Tablespace relocation mapping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catchup::inventory::dir_is_empty;
use crate::catchup::{CatchupConfig, CatchupMode};
use crate::session::SourceSession;
use crate::{Error, Result};

/// Operator-supplied source→destination tablespace directory pairs. Both
/// sides must be absolute; looking up an unmapped path returns it unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TablespaceMapping {
    pairs: BTreeMap<PathBuf, PathBuf>,
}

impl TablespaceMapping {
    pub fn new() -> TablespaceMapping {
        TablespaceMapping::default()
    }

    pub fn insert(&mut self, from: PathBuf, to: PathBuf) -> Result<()> {
        if !from.is_absolute() {
            return Err(Error::MappingNotAbsolute(from.display().to_string()).into());
        }
        if !to.is_absolute() {
            return Err(Error::MappingNotAbsolute(to.display().to_string()).into());
        }
        self.pairs.insert(from, to);
        Ok(())
    }

    /// Parse one `OLDDIR=NEWDIR` command-line pair.
    pub fn insert_pair(&mut self, pair: &str) -> Result<()> {
        let (from, to) = pair
            .split_once('=')
            .ok_or_else(|| Error::Cli(format!("malformed tablespace mapping: {pair:?}")))?;
        if from.is_empty() || to.is_empty() {
            return Err(Error::Cli(format!("malformed tablespace mapping: {pair:?}")).into());
        }
        self.insert(PathBuf::from(from), PathBuf::from(to))
    }

    /// Load a `{"/old": "/new", ...}` JSON file.
    pub fn load_file(path: &Path) -> Result<TablespaceMapping> {
        let contents = std::fs::read(path)?;
        let pairs: BTreeMap<PathBuf, PathBuf> = serde_json::from_slice(&contents)?;
        let mut mapping = TablespaceMapping::new();
        for (from, to) in pairs {
            mapping.insert(from, to)?;
        }
        Ok(mapping)
    }

    pub fn merge(&mut self, other: TablespaceMapping) {
        self.pairs.extend(other.pairs);
    }

    /// Destination for a source tablespace path; identity when unmapped.
    pub fn resolve<'a>(&'a self, source: &'a Path) -> &'a Path {
        self.pairs.get(source).map(PathBuf::as_path).unwrap_or(source)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Check every tablespace the source reports against the mapping.
///
/// An unmapped tablespace is fatal for a local catchup, where the copy would
/// land inside the source's own directory, and a warning for a remote one.
/// Full catchup additionally requires every mapped destination to be empty.
pub fn check_source_tablespaces(
    config: &CatchupConfig,
    session: &mut dyn SourceSession,
) -> Result<()> {
    let locations = session.tablespace_locations()?;
    for location in locations {
        let mapped = config.tablespace_mapping.resolve(&location);
        if mapped == location {
            if config.remote_source {
                warn!(
                    tablespace = %location.display(),
                    "source tablespace is not listed in the mapping"
                );
            } else {
                return Err(
                    Error::TablespaceNotMapped(location.display().to_string()).into(),
                );
            }
        }
        if !mapped.is_absolute() {
            return Err(Error::MappingNotAbsolute(mapped.display().to_string()).into());
        }
        if config.mode == CatchupMode::Full && !dir_is_empty(mapped)? {
            return Err(Error::MappedTablespaceNotEmpty(mapped.display().to_string()).into());
        }
    }
    Ok(())
}
