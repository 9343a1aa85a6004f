//! Error type shared by all fallible storage operations.
//!
//! Precondition violations (blit size mismatches, occupied section slots,
//! zone reassignment) are programmer errors and panic instead; see the
//! assertions at the call sites.

use std::fmt;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type MapResult<T> = Result<T, MapError>;

/// Errors that can occur while reading or writing world data.
#[derive(Debug)]
pub enum MapError {
    /// IO error (file not found, permissions, etc.)
    Io(std::io::Error),
    /// Malformed XML in a world or section file
    Xml(quick_xml::Error),
    /// Structurally valid XML with unusable content (bad numbers, missing
    /// attributes, wrong element nesting)
    Parse(String),
    /// A raster tile file that should exist could not be found
    MissingTileFile(PathBuf),
    /// A tile file's payload did not match the expected sample count
    TruncatedTileFile { path: PathBuf, expected: usize, found: usize },
    /// Property lookup failed through the whole ancestor chain
    MissingProperty(String),
    /// World file referenced a layer type tag with no registered parser
    UnknownLayerType(String),
    /// Named layer or zone not present in the world registries
    UnknownName(String),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Io(e) => write!(f, "IO error: {}", e),
            MapError::Xml(e) => write!(f, "XML error: {}", e),
            MapError::Parse(msg) => write!(f, "parse error: {}", msg),
            MapError::MissingTileFile(path) => {
                write!(f, "tile file not found: {}", path.display())
            }
            MapError::TruncatedTileFile { path, expected, found } => write!(
                f,
                "tile file {} holds {} samples, expected {}",
                path.display(),
                found,
                expected
            ),
            MapError::MissingProperty(name) => {
                write!(f, "property '{}' not found in any ancestor", name)
            }
            MapError::UnknownLayerType(tag) => {
                write!(f, "no parser registered for layer type '{}'", tag)
            }
            MapError::UnknownName(name) => write!(f, "unknown layer or zone '{}'", name),
        }
    }
}

impl std::error::Error for MapError {}

impl From<std::io::Error> for MapError {
    fn from(e: std::io::Error) -> Self {
        MapError::Io(e)
    }
}

impl From<quick_xml::Error> for MapError {
    fn from(e: quick_xml::Error) -> Self {
        MapError::Xml(e)
    }
}

impl From<quick_xml::events::attributes::AttrError> for MapError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        MapError::Parse(format!("bad attribute: {}", e))
    }
}
