//! `terranova state ...`: inspecting and repairing a state file by hand.

use std::{fmt::Write as _, path::Path};

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use terranova_state::{codec, Database, StateStore};

#[derive(Subcommand, Debug)]
pub(crate) enum Args {
    /// Print the state file as JSON
    Show,

    /// List the resources in the state, with their remote ids and status
    List,

    /// Print the lineage and serial of the state
    Info,

    /// Fail if any resource has an unconfirmed operation
    Check,

    /// Remove a resource from the state, without touching the remote object
    Forget {
        /// The section (resource type) of the resource
        section: String,
        /// The name of the resource within its section
        name: String,
    },
}

pub(crate) fn run(state_file: &Path, args: &Args) -> Result<String> {
    match args {
        Args::Show => show(state_file),
        Args::List => list(state_file),
        Args::Info => info(state_file),
        Args::Check => check(state_file),
        Args::Forget { section, name } => forget(state_file, section, name),
    }
}

/// Load a state file that must exist. Commands that only look at the state
/// should not mint a new lineage.
fn load_existing(state_file: &Path) -> Result<Database> {
    match codec::load(state_file)
        .with_context(|| format!("loading state file {}", state_file.display()))?
    {
        Some(db) => Ok(db),
        None => bail!("State file {} does not exist", state_file.display()),
    }
}

fn show(state_file: &Path) -> Result<String> {
    let db = load_existing(state_file)?;
    Ok(serde_json::to_string_pretty(&db)?)
}

fn list(state_file: &Path) -> Result<String> {
    let db = load_existing(state_file)?;
    let mut out = String::new();
    for (key, entry) in db.iter() {
        let id = if entry.remote_id.is_empty() {
            "-"
        } else {
            entry.remote_id.as_str()
        };
        writeln!(out, "{}\t{}\t{}", key, id, entry.status())?;
    }
    Ok(out)
}

fn info(state_file: &Path) -> Result<String> {
    let db = load_existing(state_file)?;
    let unreconciled = db.iter().filter(|(_, e)| e.is_unreconciled()).count();
    let mut out = String::new();
    writeln!(out, "lineage: {}", db.lineage)?;
    writeln!(out, "serial: {}", db.serial)?;
    writeln!(out, "resources: {}", db.len())?;
    writeln!(out, "unreconciled: {}", unreconciled)?;
    Ok(out)
}

fn check(state_file: &Path) -> Result<String> {
    let db = load_existing(state_file)?;
    let unreconciled: Vec<String> = db
        .iter()
        .filter(|(_, e)| e.is_unreconciled())
        .map(|(key, _)| key.to_string())
        .collect();
    if !unreconciled.is_empty() {
        for key in &unreconciled {
            tracing::error!(resource = %key, "Operation was started but never confirmed");
        }
        bail!(
            "{} resource(s) need to be reconciled with the remote system: {}",
            unreconciled.len(),
            unreconciled.join(", ")
        );
    }
    Ok(format!("{} resource(s), all applied\n", db.len()))
}

fn forget(state_file: &Path, section: &str, name: &str) -> Result<String> {
    // Refuse to create a state file just to remove nothing from it
    load_existing(state_file)?;
    let store = StateStore::open(state_file)
        .with_context(|| format!("opening state file {}", state_file.display()))?;
    match store
        .forget(section, name)
        .with_context(|| format!("removing {}.{} from the state", section, name))?
    {
        Some(entry) if entry.remote_id.is_empty() => Ok(format!("Forgot {}.{}\n", section, name)),
        Some(entry) => {
            tracing::warn!(
                remote_id = %entry.remote_id,
                "The remote object is no longer managed and has not been deleted"
            );
            Ok(format!(
                "Forgot {}.{} (remote id {})\n",
                section, name, entry.remote_id
            ))
        }
        None => bail!("Resource {}.{} is not in the state", section, name),
    }
}
