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

use usp_sdk::api::usp::{
    Body, CommandType, ObjAccessType, ParamAccessType, ParamValueType, RequestedObjectResult,
    Response, SupportedObjectResult, UspMsg,
};
use usp_sdk::log::{error, info};
use usp_sdk::utils::path_utils::DM_ROOT;

use crate::broker::operation_adapter::service_refresh_instances;
use crate::broker::subscription_sync::sync_subscriptions;
use crate::state::platform_state::PlatformState;
use crate::state::schema_tree::{CommandKind, ParamType, SchemaTree};

/// Projects a GetSupportedDM response into the unified schema, then runs
/// subscription reconciliation and seeds a baseline of instances for the
/// freshly exposed tables.
pub async fn handle_get_supported_dm_resp(state: &PlatformState, msg: &UspMsg, endpoint_id: &str) {
    let Body::Response(Response::GetSupportedDmResp(gsdm)) = &msg.body else {
        error!("Incoming GSDM message is invalid or inconsistent");
        return;
    };

    let expectation = state.services.with_service(endpoint_id, |s| {
        (s.gsdm_msg_id.clone(), s.group_id, s.registered_paths.clone())
    });
    let Some((expected_msg_id, group_id, registered_paths)) = expectation else {
        error!(
            "Incoming GSDM Response is from an unexpected endpoint ({})",
            endpoint_id
        );
        return;
    };
    let Some(expected_msg_id) = expected_msg_id else {
        error!(
            "Ignoring GSDM Response from {} as not expecting one",
            endpoint_id
        );
        return;
    };
    if msg.msg_id() != expected_msg_id {
        error!(
            "Ignoring GSDM response from endpoint '{}' because msg_id='{}' (expected '{}')",
            endpoint_id,
            msg.msg_id(),
            expected_msg_id
        );
        return;
    }
    state
        .services
        .with_service_mut(endpoint_id, |s| s.gsdm_msg_id = None);

    state.schema.write(|tree| {
        for ror in &gsdm.req_obj_results {
            process_requested_path(tree, ror, group_id, &registered_paths);
        }
    });
    info!(
        "Imported supported data model of {} under group {}",
        endpoint_id, group_id
    );

    // Dynamic permission resolution covers the new subtree from here on

    sync_subscriptions(state, endpoint_id, group_id).await;

    // Baseline the instance cache so an ObjectCreation subscription using
    // the polling mechanism doesn't fire spuriously right after import
    if let Err(e) = service_refresh_instances(state, group_id, &registered_paths).await {
        error!(
            "Failed to seed instances for {} after import: {}",
            endpoint_id, e
        );
    }
}

fn process_requested_path(
    tree: &mut SchemaTree,
    ror: &RequestedObjectResult,
    group_id: usize,
    registered_paths: &[String],
) {
    if !registered_paths.contains(&ror.req_obj_path) {
        error!(
            "Ignoring requested_object_result for '{}', as it wasn't requested",
            ror.req_obj_path
        );
        return;
    }
    if ror.err_code != 0 {
        error!(
            "USP Service did not provide data model for '{}' (err_code={}, err_msg='{}')",
            ror.req_obj_path, ror.err_code, ror.err_msg
        );
        return;
    }
    for sor in &ror.supported_objs {
        process_supported_object(tree, sor, group_id);
    }
}

fn process_supported_object(tree: &mut SchemaTree, sor: &SupportedObjectResult, group_id: usize) {
    let obj_path = &sor.supported_obj_path;
    if !obj_path.starts_with(DM_ROOT) {
        error!("Object path to register is invalid ({})", obj_path);
        return;
    }

    // Single-instance objects materialize when their children register
    if sor.is_multi_instance {
        let writable = sor.access != ObjAccessType::ReadOnly;
        tree.register_object(Some(group_id), obj_path, true, writable);

        // Top-level tables (exactly one trailing "{i}.") refresh their
        // instances from this Service on demand
        if let Some(head) = obj_path.strip_suffix("{i}.") {
            if !head.contains("{i}") {
                tree.set_refresh_group(obj_path, group_id);
            }
        }
    }

    for sp in &sor.supported_params {
        let path = format!("{}{}", obj_path, sp.param_name);
        let writable = sp.access != ParamAccessType::ReadOnly;
        tree.register_param(Some(group_id), &path, writable, calc_param_type(sp.value_type));
    }

    for se in &sor.supported_events {
        let path = format!("{}{}", obj_path, se.event_name);
        tree.register_event(Some(group_id), &path, se.arg_names.clone());
    }

    for sc in &sor.supported_commands {
        let path = format!("{}{}", obj_path, sc.command_name);
        let kind = match sc.command_type {
            CommandType::Sync => CommandKind::Sync,
            CommandType::Async => CommandKind::Async,
        };
        tree.register_command(
            Some(group_id),
            &path,
            kind,
            sc.input_arg_names.clone(),
            sc.output_arg_names.clone(),
        );
    }
}

/// Translates the wire parameter type into the schema's type flags;
/// unknown types default to string.
fn calc_param_type(value_type: ParamValueType) -> ParamType {
    match value_type {
        ParamValueType::Base64 => ParamType::Base64,
        ParamValueType::Boolean => ParamType::Bool,
        ParamValueType::DateTime => ParamType::DateTime,
        ParamValueType::Decimal => ParamType::Decimal,
        ParamValueType::HexBinary => ParamType::HexBinary,
        ParamValueType::Int => ParamType::Int,
        ParamValueType::Long => ParamType::Long,
        ParamValueType::UnsignedInt => ParamType::UnsignedInt,
        ParamValueType::UnsignedLong => ParamType::UnsignedLong,
        ParamValueType::String | ParamValueType::Unknown => ParamType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::usp::{SupportedCommandResult, SupportedEventResult, SupportedParamResult};

    fn service_gsdm_object() -> SupportedObjectResult {
        SupportedObjectResult {
            supported_obj_path: "Device.X.Z.{i}.".into(),
            access: ObjAccessType::AddDelete,
            is_multi_instance: true,
            supported_params: vec![SupportedParamResult {
                param_name: "Name".into(),
                access: ParamAccessType::ReadWrite,
                value_type: ParamValueType::String,
            }],
            supported_events: vec![SupportedEventResult {
                event_name: "Changed!".into(),
                arg_names: vec!["Reason".into()],
            }],
            supported_commands: vec![SupportedCommandResult {
                command_name: "Reset()".into(),
                command_type: CommandType::Async,
                input_arg_names: vec![],
                output_arg_names: vec!["Status".into()],
            }],
        }
    }

    #[test]
    fn supported_object_registers_children_with_group() {
        let mut tree = SchemaTree::new();
        tree.add_placeholder_object("Device.X.", 4).unwrap();
        process_supported_object(&mut tree, &service_gsdm_object(), 4);

        let table = tree.get_node("Device.X.Z.{i}.").unwrap();
        assert!(table.is_multi_instance());
        assert_eq!(table.refresh_group, Some(4));

        let param = tree.get_node("Device.X.Z.3.Name").unwrap();
        assert!(param.is_vendor_param());
        assert_eq!(param.group_id, Some(4));

        assert!(tree.get_node("Device.X.Z.{i}.Changed!").is_some());
        assert!(tree.get_node("Device.X.Z.{i}.Reset()").unwrap().is_command());
    }

    #[test]
    fn nested_tables_get_no_refresh_hook() {
        let mut tree = SchemaTree::new();
        tree.add_placeholder_object("Device.X.", 4).unwrap();
        let mut sor = service_gsdm_object();
        sor.supported_obj_path = "Device.X.Z.{i}.Sub.{i}.".into();
        process_supported_object(&mut tree, &sor, 4);
        assert_eq!(
            tree.get_node("Device.X.Z.{i}.Sub.{i}.").unwrap().refresh_group,
            None
        );
    }

    #[test]
    fn foreign_roots_are_rejected() {
        let mut tree = SchemaTree::new();
        let mut sor = service_gsdm_object();
        sor.supported_obj_path = "Hardware.X.{i}.".into();
        process_supported_object(&mut tree, &sor, 4);
        assert!(tree.get_node("Hardware.X.{i}.").is_none());
    }

    #[test]
    fn unknown_param_type_defaults_to_string() {
        assert_eq!(calc_param_type(ParamValueType::Unknown), ParamType::String);
        assert_eq!(calc_param_type(ParamValueType::Boolean), ParamType::Bool);
    }
}
