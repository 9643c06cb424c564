//! Reading and writing the state file.
//!
//! The file is a single pretty-printed JSON document. It is never modified in
//! place: [`save`] writes a sibling temporary file and renames it over the
//! target, so a crash leaves either the old or the new version on disk.

use std::{
    fs::File,
    io::{self, BufReader, Write as _},
    path::Path,
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    database::Database,
    error::{DecodeError, Error, Result},
};

/// Load a state file. Returns `None` if it does not exist yet.
pub fn load(path: &Path) -> Result<Option<Database>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Read {
                path: path.to_owned(),
                source,
            })
        }
    };
    let db = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
        if source.is_io() {
            Error::Read {
                path: path.to_owned(),
                source: source.into(),
            }
        } else {
            Error::Parse {
                path: path.to_owned(),
                source,
            }
        }
    })?;
    Ok(Some(db))
}

/// Atomically replace the state file with `db`.
pub fn save(path: &Path, db: &Database) -> Result<()> {
    // We prettify to make it more human readable, and to get usable diffs
    // when the file is kept under version control.
    let mut bytes = serde_json::to_vec_pretty(db).map_err(Error::Serialize)?;
    bytes.push(b'\n');

    let write_err = |source| Error::Write {
        path: path.to_owned(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(&bytes).map_err(write_err)?;
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;

    // Make the rename itself durable
    #[cfg(unix)]
    {
        if let Err(e) = sync_directory(dir) {
            tracing::warn!(
                path = %path.display(),
                "Could not sync state directory after replacing the state file: {}",
                e
            );
        }
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Decode an opaque stored value into `T`, rejecting stored fields that `T`
/// does not know about.
///
/// Numbers are decoded from [`serde_json::Number`], which keeps integers and
/// floats apart, so a large `u64` id is never rounded through an `f64`.
///
/// Any stored member that the `Deserialize` impl of `T` skips is reported,
/// whatever its value, with its dotted path (`clusters.1.autoscale.mode`).
pub fn decode_typed<T>(value: &Value) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    let mut ignored = Vec::new();
    let decoded = serde_ignored::deserialize(value, |path| ignored.push(display_path(&path)))?;
    match ignored.into_iter().next() {
        Some(path) => Err(DecodeError::UnknownField { path }),
        None => Ok(decoded),
    }
}

/// Render an ignored path without the `?` segments serde_ignored inserts for
/// `Option` and newtype wrappers.
fn display_path(path: &serde_ignored::Path) -> String {
    path.to_string()
        .split('.')
        .filter(|segment| *segment != "?")
        .collect::<Vec<_>>()
        .join(".")
}
