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

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const PERMIT_GET: u16 = 1 << 0;
pub const PERMIT_SET: u16 = 1 << 1;
pub const PERMIT_ADD: u16 = 1 << 2;
pub const PERMIT_DEL: u16 = 1 << 3;
pub const PERMIT_OPER: u16 = 1 << 4;
pub const PERMIT_GET_INST: u16 = 1 << 5;
pub const PERMIT_SUBSCRIBE: u16 = 1 << 6;
pub const PERMIT_ALL: u16 = PERMIT_GET
    | PERMIT_SET
    | PERMIT_ADD
    | PERMIT_DEL
    | PERMIT_OPER
    | PERMIT_GET_INST
    | PERMIT_SUBSCRIBE;

pub const FULL_ACCESS_ROLE: &str = "full-access";

/// The role an originator presents, resolved from its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedRole {
    pub role: String,
}

impl CombinedRole {
    pub fn new(role: impl Into<String>) -> CombinedRole {
        CombinedRole { role: role.into() }
    }
}

#[derive(Debug, Clone)]
struct PermissionRule {
    path_prefix: String,
    mask: u16,
}

/// Role store resolving a (path, role) pair to a permission bitmask by
/// longest-prefix rule match. Permission changes are picked up on the next
/// check, so subtrees exposed after a schema import need no re-stamping.
#[derive(Debug, Clone)]
pub struct PermissionState {
    rules: Arc<RwLock<HashMap<String, Vec<PermissionRule>>>>,
}

impl Default for PermissionState {
    fn default() -> Self {
        let state = PermissionState {
            rules: Arc::new(RwLock::new(HashMap::new())),
        };
        state.add_rule(FULL_ACCESS_ROLE, "Device.", PERMIT_ALL);
        state
    }
}

impl PermissionState {
    pub fn add_rule(&self, role: &str, path_prefix: &str, mask: u16) {
        let mut rules = self.rules.write().unwrap();
        rules
            .entry(role.to_string())
            .or_default()
            .push(PermissionRule {
                path_prefix: path_prefix.to_string(),
                mask,
            });
    }

    pub fn get_permissions(&self, path: &str, role: &CombinedRole) -> u16 {
        let rules = self.rules.read().unwrap();
        let Some(role_rules) = rules.get(&role.role) else {
            return 0;
        };
        role_rules
            .iter()
            .filter(|r| path.starts_with(&r.path_prefix))
            .max_by_key(|r| r.path_prefix.len())
            .map(|r| r.mask)
            .unwrap_or(0)
    }

    pub fn is_permitted(&self, path: &str, role: &CombinedRole, required: u16) -> bool {
        self.get_permissions(path, role) & required == required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_access_role_is_preinstalled() {
        let perms = PermissionState::default();
        let role = CombinedRole::new(FULL_ACCESS_ROLE);
        assert!(perms.is_permitted("Device.X.Y", &role, PERMIT_GET | PERMIT_SET));
    }

    #[test]
    fn unknown_role_has_no_permissions() {
        let perms = PermissionState::default();
        let role = CombinedRole::new("stranger");
        assert!(!perms.is_permitted("Device.X.Y", &role, PERMIT_GET));
    }

    #[test]
    fn longest_prefix_wins() {
        let perms = PermissionState::default();
        perms.add_rule("operator", "Device.", PERMIT_GET);
        perms.add_rule("operator", "Device.A.", PERMIT_GET | PERMIT_SET);
        let role = CombinedRole::new("operator");

        assert!(perms.is_permitted("Device.A.x", &role, PERMIT_SET));
        assert!(!perms.is_permitted("Device.B.y", &role, PERMIT_SET));
        assert!(perms.is_permitted("Device.B.y", &role, PERMIT_GET));
    }
}
