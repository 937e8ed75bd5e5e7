use crate::context::Context;
use crate::{cluster, plugin, teamrbac};
use anyhow::Result;
use std::collections::HashSet;
use std::str::FromStr;
use strum::IntoEnumIterator;

/// Every controller this binary knows how to run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "camelCase")]
pub enum ControllerKind {
    Bootstrap,
    ClusterCredential,
    Plugin,
    PluginPreset,
    TeamRoleBinding,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown controller {0:?}")]
    Unknown(String),
}

impl ControllerKind {
    pub async fn run(self, ctx: Context) -> Result<()> {
        match self {
            Self::Bootstrap => cluster::bootstrap::run(ctx).await,
            Self::ClusterCredential => cluster::credential::run(ctx).await,
            Self::Plugin => plugin::run(ctx).await,
            Self::PluginPreset => plugin::preset::run(ctx).await,
            Self::TeamRoleBinding => teamrbac::run(ctx).await,
        }
    }
}

/// Resolves `--controllers` entries: `*` enables everything, `name` enables
/// one controller and `-name` disables it, winning over `*`.
pub fn select(entries: &[String]) -> Result<Vec<ControllerKind>, RegistryError> {
    let mut all = false;
    let mut enabled = HashSet::new();
    let mut disabled = HashSet::new();

    for entry in entries.iter().map(|entry| entry.trim()) {
        match entry {
            "" => continue,
            "*" => all = true,
            _ => match entry.strip_prefix('-') {
                Some(name) => {
                    disabled.insert(parse(name)?);
                }
                None => {
                    enabled.insert(parse(entry)?);
                }
            },
        }
    }

    Ok(ControllerKind::iter()
        .filter(|kind| !disabled.contains(kind) && (all || enabled.contains(kind)))
        .collect())
}

fn parse(name: &str) -> Result<ControllerKind, RegistryError> {
    ControllerKind::from_str(name).map_err(|_| RegistryError::Unknown(name.to_owned()))
}
