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

use usp_sdk::api::config::BrokerConfig;

use crate::mtp::MtpState;
use crate::state::permission_state::PermissionState;
use crate::state::request_state::RequestState;
use crate::state::schema_tree::{ParamType, SchemaState};
use crate::state::service_registry::ServiceRegistryState;
use crate::state::subscription_state::SubscriptionState;

pub const SERVICE_TABLE: &str = "Device.USPServices.USPService.";

/// Process-wide state, cloned into every handler task. Each field shares
/// its contents behind its own lock.
#[derive(Debug, Clone)]
pub struct PlatformState {
    pub config: BrokerConfig,
    pub services: ServiceRegistryState,
    pub schema: SchemaState,
    pub subscriptions: SubscriptionState,
    pub requests: RequestState,
    pub permissions: PermissionState,
    pub mtp: MtpState,
}

impl Default for PlatformState {
    fn default() -> Self {
        PlatformState::new(BrokerConfig::default())
    }
}

impl PlatformState {
    pub fn new(config: BrokerConfig) -> PlatformState {
        let state = PlatformState {
            config,
            services: ServiceRegistryState::default(),
            schema: SchemaState::default(),
            subscriptions: SubscriptionState::default(),
            requests: RequestState::default(),
            permissions: PermissionState::default(),
            mtp: MtpState::default(),
        };
        state.register_internal_schema();
        state
    }

    /// Installs the Broker's own data model. These paths are owned by no
    /// group, so Services cannot register over them.
    fn register_internal_schema(&self) {
        self.schema.write(|tree| {
            tree.register_object(None, "Device.USPServices.", false, false);
            tree.register_param(
                None,
                "Device.USPServices.USPServiceNumberOfEntries",
                false,
                ParamType::UnsignedInt,
            );
            // Instance add/delete on the service table is denied externally
            tree.register_object(None, "Device.USPServices.USPService.{i}.", true, false);
            for param in ["EndpointID", "Protocol", "DataModelPaths"] {
                tree.register_param(
                    None,
                    &format!("Device.USPServices.USPService.{{i}}.{}", param),
                    false,
                    ParamType::String,
                );
            }
            tree.register_param(
                None,
                "Device.USPServices.USPService.{i}.HasController",
                false,
                ParamType::Bool,
            );
            tree.register_unique_keys(
                "Device.USPServices.USPService.{i}.",
                &["EndpointID".to_string()],
                self.config.max_compound_key_params,
            );

            tree.register_object(None, "Device.LocalAgent.", false, false);
            tree.register_object(None, "Device.LocalAgent.Subscription.{i}.", true, true);
            for param in ["ID", "NotifType", "ReferenceList"] {
                tree.register_param(
                    None,
                    &format!("Device.LocalAgent.Subscription.{{i}}.{}", param),
                    true,
                    ParamType::String,
                );
            }
            for param in ["Enable", "Persistent", "NotifRetry"] {
                tree.register_param(
                    None,
                    &format!("Device.LocalAgent.Subscription.{{i}}.{}", param),
                    true,
                    ParamType::Bool,
                );
            }
            for param in ["TimeToLive", "NotifExpiration"] {
                tree.register_param(
                    None,
                    &format!("Device.LocalAgent.Subscription.{{i}}.{}", param),
                    true,
                    ParamType::UnsignedInt,
                );
            }

            tree.register_object(None, "Device.LocalAgent.Request.{i}.", true, false);
            for param in ["Command", "CommandKey", "Status"] {
                tree.register_param(
                    None,
                    &format!("Device.LocalAgent.Request.{{i}}.{}", param),
                    false,
                    ParamType::String,
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_schema_blocks_service_registration() {
        let state = PlatformState::default();
        assert!(state.schema.exists_in_schema("Device.USPServices."));
        assert!(state.schema.exists_in_schema("Device.LocalAgent.Subscription.{i}."));
        assert!(state
            .schema
            .exists_in_schema("Device.LocalAgent.Subscription.3.ID"));
        // Materialized root never blocks
        assert!(!state.schema.exists_in_schema("Device.Unclaimed."));
    }
}
