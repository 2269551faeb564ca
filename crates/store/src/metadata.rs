//! Resource metadata stored alongside the trace tables.
//!
//! The `metadata` table tags the file with its resource type, the format
//! version it was written in and the tool that produced it. Readers refuse
//! files whose format version is not compatible with [`FORMAT_VERSION`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, TraceError, VersionRelation};

/// Version of the persisted format understood by this crate.
pub const FORMAT_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Version of the writer implementation.
pub const WRITER_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
};

const CREATE_METADATA_TABLE: &str = "\
CREATE TABLE metadata(
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
) WITHOUT ROWID;
";

/// Kind of resource stored in a trace database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Block,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Block => "block",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "block" => Some(ResourceType::Block),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Versions are compatible when they share a major version; minor and
    /// patch may differ.
    pub fn is_compatible_with(&self, supported: &Version) -> bool {
        self.major == supported.major
    }

    pub(crate) fn relation_to(&self, supported: &Version) -> Option<VersionRelation> {
        match self.major.cmp(&supported.major) {
            Ordering::Less => Some(VersionRelation::Past),
            Ordering::Greater => Some(VersionRelation::Future),
            Ordering::Equal => None,
        }
    }
}

impl FromStr for Version {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        let mut components = s.split('.').map(|part| part.parse::<u32>());
        match (
            components.next(),
            components.next(),
            components.next(),
            components.next(),
        ) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => Ok(Version {
                major,
                minor,
                patch,
            }),
            _ => Err(TraceError::OpenFailed(format!(
                "invalid version string {s:?}"
            ))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The metadata header of a trace database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub resource_type: ResourceType,
    pub format_version: Version,
    pub writer_version: Version,
    pub tool_name: String,
    pub tool_version: Version,
    pub tool_info: String,
}

impl Metadata {
    pub(crate) fn write(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(CREATE_METADATA_TABLE)?;
        let mut stmt = conn.prepare("INSERT INTO metadata(key, value) VALUES (?1, ?2)")?;
        let entries = [
            ("resource_type", self.resource_type.to_string()),
            ("format_version", self.format_version.to_string()),
            ("writer_version", self.writer_version.to_string()),
            ("tool_name", self.tool_name.clone()),
            ("tool_version", self.tool_version.to_string()),
            ("tool_info", self.tool_info.clone()),
        ];
        for (key, value) in entries {
            stmt.execute((key, value))?;
        }
        Ok(())
    }

    pub(crate) fn read(conn: &Connection) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| TraceError::OpenFailed(err.to_string()))?
            .ok_or_else(|| TraceError::OpenFailed(format!("missing metadata entry {key:?}")))
        };

        let raw_type = get("resource_type")?;
        let resource_type = ResourceType::parse(&raw_type)
            .ok_or_else(|| TraceError::OpenFailed(format!("cannot open a resource of type {raw_type}")))?;

        Ok(Metadata {
            resource_type,
            format_version: get("format_version")?.parse()?,
            writer_version: get("writer_version")?.parse()?,
            tool_name: get("tool_name")?,
            tool_version: get("tool_version")?.parse()?,
            tool_info: get("tool_info")?,
        })
    }
}
