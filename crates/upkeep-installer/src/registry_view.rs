//! Registry access behind a trait, with an in-memory tree and a JSON file-backed hive.
//!
//! Key and value names compare case-insensitively and keep the spelling they were created with.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use upkeep_core::{split_key_path, RegistryChange, RegistryRoot, RegistryValue};

use crate::error::RegistryAccessError;

/// Which registry view a change targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBitness {
    Native,
    Bit32,
}

impl RegistryBitness {
    pub fn for_change(change: &RegistryChange) -> Self {
        if change.is_32bit_view {
            Self::Bit32
        } else {
            Self::Native
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyListing {
    pub subkeys: Vec<String>,
    pub values: Vec<(Option<String>, RegistryValue)>,
}

pub trait RegistryView {
    fn bitness(&self) -> RegistryBitness;

    /// True when the key exists. The empty path names the root itself.
    fn open_key(&self, root: RegistryRoot, path: &str) -> Result<bool>;

    /// Creates the key and any missing ancestors.
    fn create_key(&mut self, root: RegistryRoot, path: &str) -> Result<()>;

    /// Deletes the key with all of its values and subkeys. Missing keys are not an error.
    fn delete_key(&mut self, root: RegistryRoot, path: &str) -> Result<()>;

    fn enumerate(&self, root: RegistryRoot, path: &str) -> Result<KeyListing>;

    fn get_value(
        &self,
        root: RegistryRoot,
        path: &str,
        name: Option<&str>,
    ) -> Result<Option<RegistryValue>>;

    /// Writes a value into an existing key.
    fn set_value(
        &mut self,
        root: RegistryRoot,
        path: &str,
        name: Option<&str>,
        value: &RegistryValue,
    ) -> Result<()>;

    /// Returns whether a value was removed.
    fn delete_value(&mut self, root: RegistryRoot, path: &str, name: Option<&str>) -> Result<bool>;
}

/// Hands out the view for each bitness and persists after mutations.
pub trait RegistryBackend: Send {
    fn view(&mut self, bitness: RegistryBitness) -> &mut dyn RegistryView;

    fn persist(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredValue {
    name: Option<String>,
    value: RegistryValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct KeyNode {
    name: String,
    #[serde(default)]
    values: BTreeMap<String, StoredValue>,
    #[serde(default)]
    subkeys: BTreeMap<String, KeyNode>,
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}

fn value_slot(name: Option<&str>) -> String {
    name.map(fold).unwrap_or_default()
}

fn key_display(root: RegistryRoot, path: &str) -> String {
    format!("{}\\{}", root.as_str(), path)
}

impl KeyNode {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn child(&self, segment: &str) -> Option<&KeyNode> {
        self.subkeys.get(&fold(segment))
    }
}

/// A single registry view held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegistryView {
    bitness: RegistryBitness,
    #[serde(default)]
    roots: BTreeMap<String, KeyNode>,
}

impl MemoryRegistryView {
    pub fn new(bitness: RegistryBitness) -> Self {
        Self {
            bitness,
            roots: BTreeMap::new(),
        }
    }

    fn node(&self, root: RegistryRoot, path: &str) -> Option<&KeyNode> {
        let mut node = self.roots.get(root.as_str())?;
        for segment in split_key_path(path) {
            node = node.child(segment)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, root: RegistryRoot, path: &str) -> Option<&mut KeyNode> {
        let mut node = self.roots.get_mut(root.as_str())?;
        for segment in split_key_path(path) {
            node = node.subkeys.get_mut(&fold(segment))?;
        }
        Some(node)
    }

    // An emptied root is dropped so snapshots compare equal to a never-touched view.
    fn prune_root(&mut self, root: RegistryRoot) {
        let empty = self
            .roots
            .get(root.as_str())
            .is_some_and(|node| node.values.is_empty() && node.subkeys.is_empty());
        if empty {
            self.roots.remove(root.as_str());
        }
    }

    fn existing_node_mut(&mut self, root: RegistryRoot, path: &str) -> Result<&mut KeyNode> {
        self.node_mut(root, path)
            .ok_or_else(|| RegistryAccessError::missing_key(key_display(root, path)).into())
    }
}

impl RegistryView for MemoryRegistryView {
    fn bitness(&self) -> RegistryBitness {
        self.bitness
    }

    fn open_key(&self, root: RegistryRoot, path: &str) -> Result<bool> {
        if split_key_path(path).is_empty() {
            return Ok(true);
        }
        Ok(self.node(root, path).is_some())
    }

    fn create_key(&mut self, root: RegistryRoot, path: &str) -> Result<()> {
        let mut node = self
            .roots
            .entry(root.as_str().to_string())
            .or_insert_with(|| KeyNode::named(root.as_str()));
        for segment in split_key_path(path) {
            node = node
                .subkeys
                .entry(fold(segment))
                .or_insert_with(|| KeyNode::named(segment));
        }
        Ok(())
    }

    fn delete_key(&mut self, root: RegistryRoot, path: &str) -> Result<()> {
        let segments = split_key_path(path);
        let Some((last, parents)) = segments.split_last() else {
            self.roots.remove(root.as_str());
            return Ok(());
        };
        if let Some(parent) = self.node_mut(root, &parents.join("\\")) {
            parent.subkeys.remove(&fold(last));
        }
        self.prune_root(root);
        Ok(())
    }

    fn enumerate(&self, root: RegistryRoot, path: &str) -> Result<KeyListing> {
        let Some(node) = self.node(root, path) else {
            if split_key_path(path).is_empty() {
                return Ok(KeyListing::default());
            }
            return Err(RegistryAccessError::missing_key(key_display(root, path)).into());
        };
        Ok(KeyListing {
            subkeys: node.subkeys.values().map(|child| child.name.clone()).collect(),
            values: node
                .values
                .values()
                .map(|stored| (stored.name.clone(), stored.value.clone()))
                .collect(),
        })
    }

    fn get_value(
        &self,
        root: RegistryRoot,
        path: &str,
        name: Option<&str>,
    ) -> Result<Option<RegistryValue>> {
        Ok(self
            .node(root, path)
            .and_then(|node| node.values.get(&value_slot(name)))
            .map(|stored| stored.value.clone()))
    }

    fn set_value(
        &mut self,
        root: RegistryRoot,
        path: &str,
        name: Option<&str>,
        value: &RegistryValue,
    ) -> Result<()> {
        if split_key_path(path).is_empty() {
            self.create_key(root, path)?;
        }
        let node = self.existing_node_mut(root, path)?;
        node.values.insert(
            value_slot(name),
            StoredValue {
                name: name.map(str::to_string),
                value: value.clone(),
            },
        );
        Ok(())
    }

    fn delete_value(&mut self, root: RegistryRoot, path: &str, name: Option<&str>) -> Result<bool> {
        let removed = self
            .node_mut(root, path)
            .map(|node| node.values.remove(&value_slot(name)).is_some())
            .unwrap_or(false);
        self.prune_root(root);
        Ok(removed)
    }
}

/// Native and 32-bit views kept in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegistry {
    native: MemoryRegistryView,
    wow32: MemoryRegistryView,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self {
            native: MemoryRegistryView::new(RegistryBitness::Native),
            wow32: MemoryRegistryView::new(RegistryBitness::Bit32),
        }
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view_ref(&self, bitness: RegistryBitness) -> &MemoryRegistryView {
        match bitness {
            RegistryBitness::Native => &self.native,
            RegistryBitness::Bit32 => &self.wow32,
        }
    }
}

impl RegistryBackend for MemoryRegistry {
    fn view(&mut self, bitness: RegistryBitness) -> &mut dyn RegistryView {
        match bitness {
            RegistryBitness::Native => &mut self.native,
            RegistryBitness::Bit32 => &mut self.wow32,
        }
    }
}

/// Registry stored as a JSON document, rewritten after every mutation.
#[derive(Debug)]
pub struct HiveRegistry {
    path: PathBuf,
    registry: MemoryRegistry,
}

impl HiveRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let registry = match fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse registry hive: {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MemoryRegistry::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read registry hive: {}", path.display()))
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            registry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> MemoryRegistry {
        self.registry.clone()
    }
}

impl RegistryBackend for HiveRegistry {
    fn view(&mut self, bitness: RegistryBitness) -> &mut dyn RegistryView {
        self.registry.view(bitness)
    }

    fn persist(&mut self) -> Result<()> {
        let raw = serde_json::to_vec_pretty(&self.registry)
            .context("failed to serialize registry hive")?;
        crate::fs_utils::write_atomic(&self.path, &raw)
            .with_context(|| format!("failed to write registry hive: {}", self.path.display()))
    }
}
