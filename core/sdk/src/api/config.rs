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

use serde::{Deserialize, Serialize};

use crate::utils::error::UspError;

/// Broker-wide limits and knobs, loadable from a JSON manifest. The
/// vendor parameter group space is sized by `max_usp_services`: one group
/// id per connected Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_max_usp_services")]
    pub max_usp_services: usize,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Negative means the instance cache is valid only for the message
    /// currently being processed.
    #[serde(default = "default_instance_cache_expiry_secs")]
    pub instance_cache_expiry_secs: i64,
    #[serde(default = "default_max_compound_key_params")]
    pub max_compound_key_params: usize,
    #[serde(default = "default_ws_listen_addr")]
    pub ws_listen_addr: String,
    #[serde(default = "default_controller_role")]
    pub default_controller_role: String,
}

fn default_max_usp_services() -> usize {
    32
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_instance_cache_expiry_secs() -> i64 {
    -1
}

fn default_max_compound_key_params() -> usize {
    4
}

fn default_ws_listen_addr() -> String {
    "127.0.0.1:5680".into()
}

fn default_controller_role() -> String {
    "full-access".into()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            max_usp_services: default_max_usp_services(),
            response_timeout_secs: default_response_timeout_secs(),
            instance_cache_expiry_secs: default_instance_cache_expiry_secs(),
            max_compound_key_params: default_max_compound_key_params(),
            ws_listen_addr: default_ws_listen_addr(),
            default_controller_role: default_controller_role(),
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &str) -> Result<BrokerConfig, UspError> {
        let contents = std::fs::read_to_string(path).map_err(|_| UspError::Internal)?;
        serde_json::from_str(&contents).map_err(|_| UspError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_sparse_manifests() {
        let cfg: BrokerConfig = serde_json::from_str(r#"{ "max_usp_services": 4 }"#).unwrap();
        assert_eq!(cfg.max_usp_services, 4);
        assert_eq!(cfg.response_timeout_secs, 30);
        assert_eq!(cfg.instance_cache_expiry_secs, -1);
        assert_eq!(cfg.default_controller_role, "full-access");
    }
}
