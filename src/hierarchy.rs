use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::warn;

use crate::directory::{Directory, Entity, Level};
use crate::error::{Error, Result};

const LOOKUP_KEY_SEPARATOR: &str = "&";
const MAX_SEGMENTS: usize = 4;

static LEVEL_NAME: OnceLock<Regex> = OnceLock::new();

fn level_name_pattern() -> &'static Regex {
    LEVEL_NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap())
}

/// Framework-independent description of one addressing request: up to
/// four path segments (collection/experiment/dataset/channel), the
/// optional-level query overrides, and the pass-through metadata pair.
#[derive(Debug, Clone, Default)]
pub struct HierarchyQuery {
    pub segments: Vec<String>,
    pub channel: Option<String>,
    pub time: Option<String>,
    pub layer: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
}

/// A resolved hierarchy position. Levels are consecutively resolved
/// from the collection down; everything beyond the deepest resolved
/// level is absent.
#[derive(Debug, Clone, Default)]
pub struct HierarchyPath {
    levels: [Option<String>; 6],
    key: Option<String>,
    value: Option<String>,
}

impl HierarchyPath {
    fn set(&mut self, level: Level, name: String) {
        self.levels[level as usize] = Some(name);
    }

    fn level(&self, level: Level) -> Option<&str> {
        self.levels[level as usize].as_deref()
    }

    pub fn get_collection(&self) -> Option<&str> {
        self.level(Level::Collection)
    }

    pub fn get_experiment(&self) -> Option<&str> {
        self.level(Level::Experiment)
    }

    pub fn get_dataset(&self) -> Option<&str> {
        self.level(Level::Dataset)
    }

    pub fn get_channel(&self) -> Option<&str> {
        self.level(Level::Channel)
    }

    pub fn get_time(&self) -> Option<&str> {
        self.level(Level::Time)
    }

    pub fn get_layer(&self) -> Option<&str> {
        self.level(Level::Layer)
    }

    pub fn get_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn get_value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// The canonical metadata address: resolved level names from the
    /// collection down, joined with `&`, stopping at the first
    /// unresolved level. Empty when nothing resolved.
    pub fn lookup_key(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for name in &self.levels {
            match name {
                Some(name) => parts.push(name),
                None => break,
            }
        }
        parts.join(LOOKUP_KEY_SEPARATOR)
    }
}

/// Resolves a [`HierarchyQuery`] to a [`HierarchyPath`] against the
/// directory service.
///
/// The required levels (collection, experiment, dataset) resolve from
/// path segments; a missing segment halts resolution silently, a
/// segment naming a nonexistent node is `NotFound`. The optional
/// levels (channel, time, layer) resolve only up to the deepest
/// explicitly supplied one, filling gaps from each parent's configured
/// default child; an explicit name that does not exist under its
/// parent is `InvalidArgument`, while a missing or dangling default
/// halts silently with whatever resolved so far.
pub struct Resolver {
    directory: Arc<dyn Directory>,
}

impl Resolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub async fn resolve(&self, query: &HierarchyQuery) -> Result<HierarchyPath> {
        validate(query)?;

        let mut path = HierarchyPath {
            key: query.key.clone(),
            value: query.value.clone(),
            ..Default::default()
        };

        let mut parent: Option<Entity> = None;
        for (depth, level) in [Level::Collection, Level::Experiment, Level::Dataset]
            .into_iter()
            .enumerate()
        {
            let Some(name) = query.segments.get(depth) else {
                return Ok(path);
            };
            let entity = self
                .directory
                .resolve(level, name, parent.as_ref())
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("{} '{}' does not exist", level.as_str(), name))
                })?;
            path.set(level, entity.name.clone());
            parent = Some(entity);
        }

        let Some(mut parent) = parent else {
            return Ok(path);
        };

        // A fourth path segment names the channel and wins over the
        // query parameter.
        let explicit = [
            query.segments.get(MAX_SEGMENTS - 1).or(query.channel.as_ref()),
            query.time.as_ref(),
            query.layer.as_ref(),
        ];
        let Some(deepest) = explicit.iter().rposition(|name| name.is_some()) else {
            return Ok(path);
        };

        for (idx, level) in [Level::Channel, Level::Time, Level::Layer]
            .into_iter()
            .enumerate()
            .take(deepest + 1)
        {
            let entity = match explicit[idx] {
                Some(name) => self
                    .directory
                    .resolve(level, name, Some(&parent))
                    .await?
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "{} '{}' does not exist under '{}'",
                            level.as_str(),
                            name,
                            parent.name
                        ))
                    })?,
                None => {
                    let Some(default) =
                        self.directory.default_child(&parent, level).await?
                    else {
                        return Ok(path);
                    };
                    match self.directory.resolve(level, &default, Some(&parent)).await? {
                        Some(entity) => entity,
                        None => {
                            warn!(
                                "default {} '{}' of '{}' does not resolve",
                                level.as_str(),
                                default,
                                parent.name
                            );
                            return Ok(path);
                        }
                    }
                }
            };
            path.set(level, entity.name.clone());
            parent = entity;
        }

        Ok(path)
    }
}

fn validate(query: &HierarchyQuery) -> Result<()> {
    if query.segments.len() > MAX_SEGMENTS {
        return Err(Error::InvalidArgument(format!(
            "at most {} path levels are addressable",
            MAX_SEGMENTS
        )));
    }

    let names = query
        .segments
        .iter()
        .chain(query.channel.iter())
        .chain(query.time.iter())
        .chain(query.layer.iter());
    for name in names {
        if !level_name_pattern().is_match(name) {
            return Err(Error::InvalidArgument(format!(
                "invalid level name '{}'",
                name
            )));
        }
    }
    Ok(())
}
