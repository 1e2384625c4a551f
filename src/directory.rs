use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};

/// The six hierarchy levels, outermost first. The first three are
/// required path segments; the last three are optional and may be
/// filled from configured defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Collection,
    Experiment,
    Dataset,
    Channel,
    Time,
    Layer,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::Collection,
        Level::Experiment,
        Level::Dataset,
        Level::Channel,
        Level::Time,
        Level::Layer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Collection => "collection",
            Level::Experiment => "experiment",
            Level::Dataset => "dataset",
            Level::Channel => "channel",
            Level::Time => "time",
            Level::Layer => "layer",
        }
    }

    pub fn from_depth(depth: usize) -> Option<Level> {
        Level::ALL.get(depth).copied()
    }
}

/// A resolved node in the hierarchy. `path` is the directory's unique
/// id for the node (ancestor names joined with `/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub level: Level,
    pub name: String,
    pub path: String,
}

/// Name resolution against the resource hierarchy. The hierarchy
/// itself is owned elsewhere; this service only resolves names and
/// reads configured default children.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a node by name under a parent (`None` = a root-level
    /// collection). `Ok(None)` means no such node.
    async fn resolve(
        &self,
        level: Level,
        name: &str,
        parent: Option<&Entity>,
    ) -> Result<Option<Entity>>;

    /// The configured default child name of `entity` at `child_level`,
    /// if any. The returned name is not guaranteed to resolve.
    async fn default_child(&self, entity: &Entity, child_level: Level)
        -> Result<Option<String>>;
}

struct StoredEntity {
    level: Level,
    name: String,
    defaults: HashMap<Level, String>,
}

/// In-process directory for memory mode and tests, keyed by path.
#[derive(Default)]
pub struct MemoryDirectory {
    entities: HashMap<String, StoredEntity>,
}

#[derive(Debug, Deserialize)]
struct SeedNode {
    name: String,
    #[serde(default)]
    default_child: Option<String>,
    #[serde(default)]
    children: Vec<SeedNode>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node under `parent` (a path returned by a previous
    /// insert; `None` for a collection). Returns the new node's path.
    pub fn insert(&mut self, parent: Option<&str>, level: Level, name: &str) -> String {
        let path = match parent {
            Some(parent) => format!("{}/{}", parent, name),
            None => name.to_string(),
        };
        self.entities.insert(
            path.clone(),
            StoredEntity {
                level,
                name: name.to_string(),
                defaults: HashMap::new(),
            },
        );
        path
    }

    /// Configure the default child of the node at `path`.
    pub fn set_default(&mut self, path: &str, child_level: Level, child: &str) {
        if let Some(entity) = self.entities.get_mut(path) {
            entity.defaults.insert(child_level, child.to_string());
        }
    }

    /// Build a directory from a seed document: a JSON array of
    /// collections, each node `{name, default_child?, children?}`,
    /// levels implied by nesting depth.
    pub fn from_json(doc: &str) -> Result<Self> {
        let roots: Vec<SeedNode> = serde_json::from_str(doc)
            .map_err(|e| Error::Config(format!("invalid directory seed: {}", e)))?;

        let mut directory = Self::new();
        for root in &roots {
            directory.insert_seed(None, 0, root)?;
        }
        Ok(directory)
    }

    fn insert_seed(&mut self, parent: Option<&str>, depth: usize, node: &SeedNode) -> Result<()> {
        let level = Level::from_depth(depth).ok_or_else(|| {
            Error::Config(format!("directory seed nests deeper than {:?}", Level::Layer))
        })?;
        let path = self.insert(parent, level, &node.name);

        if let Some(default) = &node.default_child {
            let child_level = Level::from_depth(depth + 1).ok_or_else(|| {
                Error::Config(format!("'{}' cannot have a default child", node.name))
            })?;
            self.set_default(&path, child_level, default);
        }

        for child in &node.children {
            self.insert_seed(Some(&path), depth + 1, child)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn resolve(
        &self,
        level: Level,
        name: &str,
        parent: Option<&Entity>,
    ) -> Result<Option<Entity>> {
        let path = match parent {
            Some(parent) => format!("{}/{}", parent.path, name),
            None => name.to_string(),
        };
        Ok(self
            .entities
            .get(&path)
            .filter(|entity| entity.level == level)
            .map(|entity| Entity {
                level: entity.level,
                name: entity.name.clone(),
                path: path.clone(),
            }))
    }

    async fn default_child(
        &self,
        entity: &Entity,
        child_level: Level,
    ) -> Result<Option<String>> {
        Ok(self
            .entities
            .get(&entity.path)
            .and_then(|entity| entity.defaults.get(&child_level).cloned()))
    }
}
