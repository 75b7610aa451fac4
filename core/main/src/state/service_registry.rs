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

use std::sync::{Arc, RwLock};

use usp_sdk::api::mtp::{MtpConn, MtpRole};
use usp_sdk::log::{info, warn};
use usp_sdk::utils::error::UspError;

use crate::state::correlation_maps::{MsgMap, ReqMap, SubsMap};
use crate::state::platform_state::PlatformState;
use crate::state::request_state::signal_operation_complete;

/// One connected USP Service and everything the Broker tracks for it.
#[derive(Debug, Clone)]
pub struct UspService {
    /// Instance number in Device.USPServices.USPService.{i}; stable while
    /// the Service stays connected, never reused while any record exists.
    pub instance: u32,
    pub endpoint_id: String,
    /// Tags every schema node owned by this Service.
    pub group_id: usize,
    /// Used when the Broker acts as a Controller towards the Service.
    pub controller_mtp: Option<MtpConn>,
    /// Used when the Broker acts as an Agent towards the Service.
    pub agent_mtp: Option<MtpConn>,
    /// Set when the Service connected on the Broker's agent socket.
    pub has_controller: bool,
    /// Message id of the in-flight GetSupportedDM request, if any.
    pub gsdm_msg_id: Option<String>,
    pub registered_paths: Vec<String>,
    pub subs_map: SubsMap,
    pub req_map: ReqMap,
    pub msg_map: MsgMap,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistryState {
    services: Arc<RwLock<Vec<UspService>>>,
}

impl ServiceRegistryState {
    /// Adds a new Service record, reserving its group id and allocating an
    /// instance number strictly greater than every live one.
    pub fn add(
        &self,
        endpoint_id: &str,
        mtpc: &MtpConn,
        max_services: usize,
    ) -> Result<(u32, usize), UspError> {
        let mut services = self.services.write().unwrap();
        if services.iter().any(|s| s.endpoint_id == endpoint_id) {
            return Err(UspError::Internal);
        }
        if services.len() >= max_services {
            warn!(
                "Too many USP services ({}) already registered",
                services.len()
            );
            return Err(UspError::ResourcesExceeded);
        }
        let group_id = (1..=max_services)
            .find(|g| !services.iter().any(|s| s.group_id == *g))
            .ok_or(UspError::ResourcesExceeded)?;
        let instance = services.iter().map(|s| s.instance).max().unwrap_or(0) + 1;

        let mut service = UspService {
            instance,
            endpoint_id: endpoint_id.to_string(),
            group_id,
            controller_mtp: None,
            agent_mtp: None,
            has_controller: false,
            gsdm_msg_id: None,
            registered_paths: Vec::new(),
            subs_map: SubsMap::default(),
            req_map: ReqMap::default(),
            msg_map: MsgMap::default(),
        };
        apply_transport(&mut service, mtpc);
        services.push(service);
        Ok((instance, group_id))
    }

    pub fn update_transport(&self, endpoint_id: &str, mtpc: &MtpConn) -> bool {
        let mut services = self.services.write().unwrap();
        if let Some(service) = services.iter_mut().find(|s| s.endpoint_id == endpoint_id) {
            apply_transport(service, mtpc);
            return true;
        }
        false
    }

    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.services
            .read()
            .unwrap()
            .iter()
            .any(|s| s.endpoint_id == endpoint_id)
    }

    pub fn with_service<R>(
        &self,
        endpoint_id: &str,
        f: impl FnOnce(&UspService) -> R,
    ) -> Option<R> {
        let services = self.services.read().unwrap();
        services
            .iter()
            .find(|s| s.endpoint_id == endpoint_id)
            .map(f)
    }

    pub fn with_service_mut<R>(
        &self,
        endpoint_id: &str,
        f: impl FnOnce(&mut UspService) -> R,
    ) -> Option<R> {
        let mut services = self.services.write().unwrap();
        services
            .iter_mut()
            .find(|s| s.endpoint_id == endpoint_id)
            .map(f)
    }

    pub fn with_service_by_group<R>(
        &self,
        group_id: usize,
        f: impl FnOnce(&UspService) -> R,
    ) -> Option<R> {
        let services = self.services.read().unwrap();
        services.iter().find(|s| s.group_id == group_id).map(f)
    }

    pub fn with_service_by_group_mut<R>(
        &self,
        group_id: usize,
        f: impl FnOnce(&mut UspService) -> R,
    ) -> Option<R> {
        let mut services = self.services.write().unwrap();
        services.iter_mut().find(|s| s.group_id == group_id).map(f)
    }

    pub fn with_service_by_instance<R>(
        &self,
        instance: u32,
        f: impl FnOnce(&UspService) -> R,
    ) -> Option<R> {
        let services = self.services.read().unwrap();
        services.iter().find(|s| s.instance == instance).map(f)
    }

    pub fn remove(&self, endpoint_id: &str) -> Option<UspService> {
        let mut services = self.services.write().unwrap();
        let idx = services.iter().position(|s| s.endpoint_id == endpoint_id)?;
        Some(services.remove(idx))
    }

    pub fn count(&self) -> usize {
        self.services.read().unwrap().len()
    }

    pub fn instances(&self) -> Vec<u32> {
        let mut instances: Vec<u32> = self
            .services
            .read()
            .unwrap()
            .iter()
            .map(|s| s.instance)
            .collect();
        instances.sort_unstable();
        instances
    }

    /// (endpoint, instance, group) triples, used by the data-model surface
    /// and the registry-uniqueness checks.
    pub fn snapshot(&self) -> Vec<(String, u32, usize)> {
        self.services
            .read()
            .unwrap()
            .iter()
            .map(|s| (s.endpoint_id.clone(), s.instance, s.group_id))
            .collect()
    }
}

fn apply_transport(service: &mut UspService, mtpc: &MtpConn) {
    if mtpc.distinguishes_roles() {
        match mtpc.role {
            Some(MtpRole::BrokersAgent) => service.agent_mtp = Some(mtpc.clone()),
            Some(MtpRole::BrokersController) => service.controller_mtp = Some(mtpc.clone()),
            None => unreachable!(),
        }
    } else {
        service.controller_mtp = Some(mtpc.clone());
        service.agent_mtp = Some(mtpc.clone());
    }
}

/// Called when a USP Service connects. Creates the record on first
/// contact, refreshes the transport handles otherwise.
pub fn handle_service_connected(
    state: &PlatformState,
    endpoint_id: &str,
    mtpc: &MtpConn,
) -> Result<(), UspError> {
    if state.services.contains(endpoint_id) {
        state.services.update_transport(endpoint_id, mtpc);
    } else {
        state
            .services
            .add(endpoint_id, mtpc, state.config.max_usp_services)
            .map_err(|e| {
                warn!("Unable to register any more USP services: {}", e);
                e
            })?;
        info!("USP Service {} connected", endpoint_id);
    }

    if mtpc.role == Some(MtpRole::BrokersAgent) {
        state
            .services
            .with_service_mut(endpoint_id, |s| s.has_controller = true);
    }
    Ok(())
}

pub const DONT_FAIL_COMMANDS_IN_PROGRESS: bool = false;
pub const FAIL_COMMANDS_IN_PROGRESS: bool = true;

/// Handles loss of one of a Service's connections. Losing the
/// controller-side handle runs failure propagation; when both handles are
/// gone the record is destroyed, releasing its group id.
pub async fn handle_service_disconnect(state: &PlatformState, endpoint_id: &str, role: MtpRole) {
    if !state.services.contains(endpoint_id) {
        return;
    }

    match role {
        MtpRole::BrokersAgent => {
            state.services.with_service_mut(endpoint_id, |s| {
                s.agent_mtp = None;
                s.has_controller = false;
            });
        }
        MtpRole::BrokersController => {
            state
                .services
                .with_service_mut(endpoint_id, |s| s.controller_mtp = None);
            handle_agent_disconnect(state, endpoint_id, FAIL_COMMANDS_IN_PROGRESS).await;
        }
    }

    let both_gone = state
        .services
        .with_service(endpoint_id, |s| {
            s.controller_mtp.is_none() && s.agent_mtp.is_none()
        })
        .unwrap_or(false);
    if both_gone {
        if let Some(service) = state.services.remove(endpoint_id) {
            info!(
                "USP Service {} fully disconnected, releasing group {}",
                endpoint_id, service.group_id
            );
        }
    }
}

/// Failure propagation for a Service whose agent side is gone: vendor
/// subscriptions fall back to core delivery, in-flight commands fail,
/// outstanding passthrough responses become unroutable and the Service's
/// schema subtree disappears.
pub async fn handle_agent_disconnect(
    state: &PlatformState,
    endpoint_id: &str,
    fail_commands: bool,
) {
    let (group_id, subs_entries, req_entries, registered_paths) = match state
        .services
        .with_service_mut(endpoint_id, |s| {
            (
                s.group_id,
                s.subs_map.drain(),
                s.req_map.drain(),
                std::mem::take(&mut s.registered_paths),
            )
        }) {
        Some(v) => v,
        None => return,
    };

    state.subscriptions.free_all_for_group(group_id);
    drop(subs_entries);

    if fail_commands {
        for entry in req_entries {
            let err_msg = format!(
                "USP Service implementing command ({}) disconnected",
                endpoint_id
            );
            signal_operation_complete(
                state,
                entry.request_instance,
                Some((UspError::CommandFailure, err_msg)),
                Vec::new(),
            )
            .await;
        }
    } else {
        // Commands still in progress on the Service send their own
        // completion after it reconnects, so the Request rows stay.
    }

    state
        .services
        .with_service_mut(endpoint_id, |s| s.msg_map.clear());

    state.schema.write(|tree| {
        for path in &registered_paths {
            tree.remove_subtree(path);
        }
    });
}

// ------------------------------------------------------------------
// Device.USPServices.USPService.{i} parameter surface

pub fn get_service_endpoint_id(state: &PlatformState, instance: u32) -> Option<String> {
    state
        .services
        .with_service_by_instance(instance, |s| s.endpoint_id.clone())
}

pub fn get_service_protocol(state: &PlatformState, instance: u32) -> Option<String> {
    state.services.with_service_by_instance(instance, |s| {
        let conn = s.controller_mtp.as_ref().or(s.agent_mtp.as_ref());
        conn.map(|c| c.protocol.to_string()).unwrap_or_default()
    })
}

pub fn get_service_dm_paths(state: &PlatformState, instance: u32) -> Option<String> {
    state
        .services
        .with_service_by_instance(instance, |s| s.registered_paths.join(","))
}

pub fn get_service_has_controller(state: &PlatformState, instance: u32) -> Option<bool> {
    state
        .services
        .with_service_by_instance(instance, |s| s.has_controller)
}
