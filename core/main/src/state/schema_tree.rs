// Copyright 2023 Comcast Cable Communications Management, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use usp_sdk::log::{error, warn};
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::path_utils::{to_schema_path, INSTANCE_PLACEHOLDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    Bool,
    DateTime,
    Decimal,
    Base64,
    HexBinary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNodeType {
    Object {
        multi_instance: bool,
        writable: bool,
    },
    Param {
        writable: bool,
        param_type: ParamType,
    },
    Event {
        arg_names: Vec<String>,
    },
    Command {
        kind: CommandKind,
        input_arg_names: Vec<String>,
        output_arg_names: Vec<String>,
    },
}

/// One node of the supported data model. Object paths carry a trailing dot
/// and `{i}` placeholders (`Device.X.Z.{i}.`); parameters, events and
/// commands are keyed without a trailing dot (`Device.X.Z.{i}.Name`,
/// `Device.X.Run()`).
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub path: String,
    pub node_type: SchemaNodeType,
    /// Owning Service's group id; `None` for the Broker's internal schema.
    pub group_id: Option<usize>,
    /// Group to query when the instances of this table need refreshing.
    pub refresh_group: Option<usize>,
    pub unique_keys: Vec<String>,
    /// Ancestors materialized on demand; these never count as registered
    /// schema when checking for Register conflicts.
    pub implicit: bool,
}

impl SchemaNode {
    pub fn is_object(&self) -> bool {
        matches!(self.node_type, SchemaNodeType::Object { .. })
    }

    pub fn is_multi_instance(&self) -> bool {
        matches!(
            self.node_type,
            SchemaNodeType::Object {
                multi_instance: true,
                ..
            }
        )
    }

    pub fn is_param(&self) -> bool {
        matches!(self.node_type, SchemaNodeType::Param { .. })
    }

    pub fn is_command(&self) -> bool {
        matches!(self.node_type, SchemaNodeType::Command { .. })
    }

    pub fn is_vendor_param(&self) -> bool {
        self.is_param() && self.group_id.is_some()
    }
}

#[derive(Debug, Default)]
pub struct SchemaTree {
    nodes: BTreeMap<String, SchemaNode>,
    /// Instantiated object paths per table schema path. Entries are valid
    /// only for the message currently being processed; the gateway clears
    /// the cache at message boundaries.
    instances: HashMap<String, Vec<String>>,
}

fn object_key(path: &str) -> String {
    let mut key = to_schema_path(path);
    if !key.ends_with('.') {
        key.push('.');
    }
    key
}

impl SchemaTree {
    pub fn new() -> SchemaTree {
        let mut tree = SchemaTree::default();
        tree.nodes.insert(
            "Device.".to_string(),
            SchemaNode {
                path: "Device.".to_string(),
                node_type: SchemaNodeType::Object {
                    multi_instance: false,
                    writable: false,
                },
                group_id: None,
                refresh_group: None,
                unique_keys: Vec::new(),
                implicit: true,
            },
        );
        tree
    }

    fn ensure_parents(&mut self, key: &str) {
        let segments: Vec<&str> = key.trim_end_matches('.').split('.').collect();
        for k in 1..segments.len() {
            // A prefix immediately followed by {i} is covered by its table node
            if segments[k] == INSTANCE_PLACEHOLDER {
                continue;
            }
            let prefix = format!("{}.", segments[..k].join("."));
            if self.nodes.contains_key(&prefix) {
                continue;
            }
            let multi = segments[k - 1] == INSTANCE_PLACEHOLDER;
            self.nodes.insert(
                prefix.clone(),
                SchemaNode {
                    path: prefix,
                    node_type: SchemaNodeType::Object {
                        multi_instance: multi,
                        writable: false,
                    },
                    group_id: None,
                    refresh_group: None,
                    unique_keys: Vec::new(),
                    implicit: true,
                },
            );
        }
    }

    /// Registers a single-instance placeholder for a freshly accepted
    /// Register prefix. The real shape is discovered from the
    /// GetSupportedDM response.
    pub fn add_placeholder_object(&mut self, path: &str, group_id: usize) -> Result<(), UspError> {
        let key = object_key(path);
        if self.nodes.get(&key).map(|n| !n.implicit).unwrap_or(false) {
            return Err(UspError::PathAlreadyRegistered);
        }
        self.ensure_parents(&key);
        self.nodes.insert(
            key.clone(),
            SchemaNode {
                path: key,
                node_type: SchemaNodeType::Object {
                    multi_instance: false,
                    writable: false,
                },
                group_id: Some(group_id),
                refresh_group: None,
                unique_keys: Vec::new(),
                implicit: false,
            },
        );
        Ok(())
    }

    pub fn register_object(
        &mut self,
        group_id: Option<usize>,
        path: &str,
        multi_instance: bool,
        writable: bool,
    ) {
        let key = object_key(path);
        self.ensure_parents(&key);
        let refresh_group = self.nodes.get(&key).and_then(|n| n.refresh_group);
        self.nodes.insert(
            key.clone(),
            SchemaNode {
                path: key,
                node_type: SchemaNodeType::Object {
                    multi_instance,
                    writable,
                },
                group_id,
                refresh_group,
                unique_keys: Vec::new(),
                implicit: false,
            },
        );
    }

    pub fn register_param(
        &mut self,
        group_id: Option<usize>,
        path: &str,
        writable: bool,
        param_type: ParamType,
    ) {
        let key = to_schema_path(path);
        self.ensure_parents(&key);
        self.nodes.insert(
            key.clone(),
            SchemaNode {
                path: key,
                node_type: SchemaNodeType::Param {
                    writable,
                    param_type,
                },
                group_id,
                refresh_group: None,
                unique_keys: Vec::new(),
                implicit: false,
            },
        );
    }

    pub fn register_event(&mut self, group_id: Option<usize>, path: &str, arg_names: Vec<String>) {
        let key = to_schema_path(path);
        self.ensure_parents(&key);
        self.nodes.insert(
            key.clone(),
            SchemaNode {
                path: key,
                node_type: SchemaNodeType::Event { arg_names },
                group_id,
                refresh_group: None,
                unique_keys: Vec::new(),
                implicit: false,
            },
        );
    }

    pub fn register_command(
        &mut self,
        group_id: Option<usize>,
        path: &str,
        kind: CommandKind,
        input_arg_names: Vec<String>,
        output_arg_names: Vec<String>,
    ) {
        let key = to_schema_path(path);
        self.ensure_parents(&key);
        self.nodes.insert(
            key.clone(),
            SchemaNode {
                path: key,
                node_type: SchemaNodeType::Command {
                    kind,
                    input_arg_names,
                    output_arg_names,
                },
                group_id,
                refresh_group: None,
                unique_keys: Vec::new(),
                implicit: false,
            },
        );
    }

    pub fn set_refresh_group(&mut self, path: &str, group_id: usize) -> bool {
        let key = object_key(path);
        if let Some(node) = self.nodes.get_mut(&key) {
            node.refresh_group = Some(group_id);
            return true;
        }
        false
    }

    /// Records the unique keys of a table if none are registered yet,
    /// truncating to `max_keys`.
    pub fn register_unique_keys(&mut self, path: &str, keys: &[String], max_keys: usize) {
        let key = object_key(path);
        if let Some(node) = self.nodes.get_mut(&key) {
            if !node.is_multi_instance() {
                warn!(
                    "Ignoring unique keys for non multi-instance object {}",
                    node.path
                );
                return;
            }
            if node.unique_keys.is_empty() {
                let mut keys = keys.to_vec();
                if keys.len() > max_keys {
                    error!(
                        "Truncating unique keys registered for {} to {}",
                        node.path,
                        max_keys
                    );
                    keys.truncate(max_keys);
                }
                node.unique_keys = keys;
            }
        } else {
            warn!("Unique keys provided for unregistered path {}", path);
        }
    }

    /// Resolves an absolute (possibly instantiated) path to its schema node.
    pub fn get_node(&self, path: &str) -> Option<&SchemaNode> {
        let key = to_schema_path(path);
        if let Some(node) = self.nodes.get(&key) {
            return Some(node);
        }
        if let Some(node) = self.nodes.get(&format!("{}.", key)) {
            return Some(node);
        }
        // A partial path names its table, keyed with the {i} placeholder
        if key.ends_with('.') {
            self.nodes.get(&format!("{}{{i}}.", key))
        } else {
            self.nodes.get(&format!("{}.{{i}}.", key))
        }
    }

    /// True when the path is part of the registered schema (placeholders
    /// included, materialized ancestors excluded).
    pub fn exists_in_schema(&self, path: &str) -> bool {
        self.get_node(path).map(|n| !n.implicit).unwrap_or(false)
    }

    pub fn remove_subtree(&mut self, prefix: &str) {
        let key = object_key(prefix);
        let doomed: Vec<String> = self
            .nodes
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(&key))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            self.nodes.remove(&k);
        }
        self.instances.retain(|k, _| !k.starts_with(&key));
    }

    /// Direct children of an object node: child objects, parameters,
    /// events and commands exactly one level below.
    pub fn children_of(&self, parent_path: &str) -> Vec<&SchemaNode> {
        let key = object_key(parent_path);
        self.nodes
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(&key))
            .filter(|(k, _)| {
                let rest = &k[key.len()..];
                if rest.is_empty() {
                    return false;
                }
                match rest.strip_suffix('.') {
                    // A child object is either "Seg." or a table "Seg.{i}."
                    Some(seg) => {
                        let parts: Vec<&str> = seg.split('.').collect();
                        parts.len() == 1
                            || (parts.len() == 2 && parts[1] == INSTANCE_PLACEHOLDER)
                    }
                    None => !rest.contains('.'),
                }
            })
            .map(|(_, n)| n)
            .collect()
    }

    /// Parameter children of a table, as name tails relative to the table.
    pub fn param_names_under(&self, table_path: &str) -> Vec<String> {
        let key = object_key(table_path);
        self.children_of(&key)
            .into_iter()
            .filter(|n| n.is_param())
            .map(|n| n.path[key.len()..].to_string())
            .collect()
    }

    pub fn nodes_under(&self, prefix: &str) -> Vec<&SchemaNode> {
        let key = object_key(prefix);
        self.nodes
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(&key))
            .map(|(_, n)| n)
            .collect()
    }

    // ------------------------------------------------------------------
    // Instance cache

    pub fn seed_instance(&mut self, instantiated_path: &str) {
        let mut concrete = instantiated_path.to_string();
        if !concrete.ends_with('.') {
            concrete.push('.');
        }
        let schema_key = to_schema_path(&concrete);
        let entry = self.instances.entry(schema_key).or_default();
        if !entry.contains(&concrete) {
            entry.push(concrete);
        }
    }

    pub fn instances_of(&self, table_path: &str) -> Vec<String> {
        let schema_key = object_key(table_path);
        self.instances.get(&schema_key).cloned().unwrap_or_default()
    }

    pub fn clear_instance_cache(&mut self) {
        self.instances.clear();
    }
}

/// Shared handle onto the schema tree, cloned into every handler.
#[derive(Debug, Clone)]
pub struct SchemaState {
    tree: Arc<RwLock<SchemaTree>>,
}

impl Default for SchemaState {
    fn default() -> Self {
        SchemaState {
            tree: Arc::new(RwLock::new(SchemaTree::new())),
        }
    }
}

impl SchemaState {
    pub fn read<R>(&self, f: impl FnOnce(&SchemaTree) -> R) -> R {
        f(&self.tree.read().unwrap())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut SchemaTree) -> R) -> R {
        f(&mut self.tree.write().unwrap())
    }

    pub fn exists_in_schema(&self, path: &str) -> bool {
        self.read(|t| t.exists_in_schema(path))
    }

    pub fn node_group(&self, path: &str) -> Option<Option<usize>> {
        self.read(|t| t.get_node(path).map(|n| n.group_id))
    }

    pub fn node_snapshot(&self, path: &str) -> Option<SchemaNode> {
        self.read(|t| t.get_node(path).cloned())
    }
}
