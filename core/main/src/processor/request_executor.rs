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

//! Normal-path execution of Controller requests against the unified data
//! model, used whenever passthrough declines. Paths resolve individually,
//! per-path errors are reported inline, and grouped paths are bridged to
//! the owning Service through the operation adapter.

use usp_sdk::api::mtp::MtpConn;
use usp_sdk::api::usp::{
    AddOperationStatus, AddResp, Body, CreatedObjectResult, DeleteOperationStatus, DeleteResp,
    DeletedObjectResult, GetResp, OperateResp, OperationResp, OperationResult, ParamError,
    Request, RequestedPathResult, ResolvedPathResult, Response, ResultParamsEntry,
    SetOperationStatus, SetResp, UpdatedInstanceResult, UpdatedObjectResult, UspMsg,
};
use usp_sdk::log::error;
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::path_utils::{trailing_instance_number, with_trailing_dot};

use crate::broker::msg_builder::GroupAddParam;
use crate::broker::operation_adapter::{
    create_object, group_delete, group_get, group_set, group_subscribe, group_unsubscribe,
    refresh_instances, sync_operate,
};
use crate::broker::operation_adapter::async_operate;
use crate::state::permission_state::{
    CombinedRole, PERMIT_ADD, PERMIT_DEL, PERMIT_GET, PERMIT_OPER, PERMIT_SET,
};
use crate::state::platform_state::{PlatformState, SERVICE_TABLE};
use crate::state::request_state::REQUEST_TABLE;
use crate::state::schema_tree::{CommandKind, SchemaNode, SchemaNodeType};
use crate::state::service_registry::{
    get_service_dm_paths, get_service_endpoint_id, get_service_has_controller,
    get_service_protocol,
};
use crate::state::subscription_state::{Recipient, SUBS_TABLE};

async fn reply(mtpc: &MtpConn, endpoint_id: &str, msg: UspMsg) {
    if let Err(e) = mtpc.queue_message(endpoint_id, msg).await {
        error!("Failed to send response to {}: {}", endpoint_id, e);
    }
}

pub async fn send_message_not_understood(
    mtpc: &MtpConn,
    endpoint_id: &str,
    msg_id: &str,
    detail: &str,
) {
    let msg = UspMsg::error(msg_id.to_string(), &UspError::MessageNotUnderstood, detail);
    if let Err(e) = mtpc.queue_message(endpoint_id, msg).await {
        error!("Failed to send USP Error to {}: {}", endpoint_id, e);
    }
}

// ---------------------------------------------------------------------------
// Get

pub async fn handle_get(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) {
    let Body::Request(Request::Get(get)) = &msg.body else {
        send_message_not_understood(mtpc, endpoint_id, msg.msg_id(), "malformed Get").await;
        return;
    };

    let mut resp = GetResp::default();
    for path in &get.param_paths {
        let entry = match get_one_path(state, path, role).await {
            Ok(resolved) => RequestedPathResult {
                requested_path: path.clone(),
                err_code: 0,
                err_msg: String::new(),
                resolved_path_results: resolved,
            },
            Err((err, err_msg)) => RequestedPathResult {
                requested_path: path.clone(),
                err_code: err.to_wire_code(),
                err_msg,
                resolved_path_results: Vec::new(),
            },
        };
        resp.req_path_results.push(entry);
    }

    let reply_msg = UspMsg::response(msg.msg_id().to_string(), Response::GetResp(resp));
    reply(mtpc, endpoint_id, reply_msg).await;
}

fn split_param_path(path: &str) -> (String, String) {
    match path.rfind('.') {
        Some(idx) => (path[..=idx].to_string(), path[idx + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

async fn get_one_path(
    state: &PlatformState,
    path: &str,
    role: &CombinedRole,
) -> Result<Vec<ResolvedPathResult>, (UspError, String)> {
    let node = state.schema.node_snapshot(path).ok_or_else(|| {
        (
            UspError::InvalidPath,
            format!("Path '{}' does not exist in the data model", path),
        )
    })?;

    if !state.permissions.is_permitted(&node.path, role, PERMIT_GET) {
        return Err((
            UspError::PermissionDenied,
            format!("No permission to read '{}'", path),
        ));
    }

    match &node.node_type {
        SchemaNodeType::Param { .. } => {
            let (obj_path, name) = split_param_path(path);
            let value = match node.group_id {
                None => internal_param_value(state, path).ok_or((
                    UspError::Internal,
                    format!("No value for '{}'", path),
                ))?,
                Some(group_id) => {
                    let values = group_get(state, group_id, &[path.to_string()])
                        .await
                        .map_err(|e| (e, format!("Failed to get '{}'", path)))?;
                    values
                        .into_iter()
                        .find(|(p, _)| p == path)
                        .map(|(_, v)| v)
                        .ok_or((
                            UspError::Internal,
                            format!("Service returned no value for '{}'", path),
                        ))?
                }
            };
            Ok(vec![ResolvedPathResult {
                resolved_path: obj_path,
                result_params: vec![ResultParamsEntry { key: name, value }],
            }])
        }
        SchemaNodeType::Object { multi_instance, .. } => {
            get_object_path(state, path, &node, *multi_instance).await
        }
        _ => Err((
            UspError::InvalidPath,
            format!("Path '{}' is not readable", path),
        )),
    }
}

/// Expands an object path into one resolved result per instance. Grouped
/// tables with a refresh hook are re-queried from the owning Service
/// first; the cache only lives for this message.
async fn get_object_path(
    state: &PlatformState,
    path: &str,
    node: &SchemaNode,
    multi_instance: bool,
) -> Result<Vec<ResolvedPathResult>, (UspError, String)> {
    let requested = with_trailing_dot(path);

    if node.group_id.is_none() {
        return get_internal_object(state, &requested);
    }
    let group_id = node.group_id.unwrap();

    // A concrete instance path reads like a single object
    let is_instance_path = trailing_instance_number(&requested).is_some();
    let instances: Vec<String> = if !multi_instance || is_instance_path {
        vec![requested.clone()]
    } else {
        if let Some(refresh_group) = node.refresh_group {
            refresh_instances(state, refresh_group, &requested)
                .await
                .map_err(|e| (e, format!("Failed to refresh instances of '{}'", path)))?;
        }
        state.schema.read(|tree| tree.instances_of(&node.path))
    };

    let param_names = state.schema.read(|tree| tree.param_names_under(&node.path));
    let mut results = Vec::new();
    for instance in instances {
        let concrete: Vec<String> = param_names
            .iter()
            .map(|n| format!("{}{}", instance, n))
            .collect();
        let values = if concrete.is_empty() {
            Vec::new()
        } else {
            group_get(state, group_id, &concrete)
                .await
                .map_err(|e| (e, format!("Failed to get '{}'", instance)))?
        };
        results.push(ResolvedPathResult {
            resolved_path: instance.clone(),
            result_params: values
                .into_iter()
                .map(|(p, v)| ResultParamsEntry {
                    key: p.rsplit('.').next().unwrap_or_default().to_string(),
                    value: v,
                })
                .collect(),
        });
    }
    Ok(results)
}

fn get_internal_object(
    state: &PlatformState,
    requested: &str,
) -> Result<Vec<ResolvedPathResult>, (UspError, String)> {
    let mut results = Vec::new();
    if requested == SERVICE_TABLE || requested == "Device.USPServices." {
        for instance in state.services.instances() {
            let prefix = format!("{}{}.", SERVICE_TABLE, instance);
            let mut params = Vec::new();
            for name in ["EndpointID", "Protocol", "DataModelPaths", "HasController"] {
                if let Some(value) = internal_param_value(state, &format!("{}{}", prefix, name)) {
                    params.push(ResultParamsEntry {
                        key: name.to_string(),
                        value,
                    });
                }
            }
            results.push(ResolvedPathResult {
                resolved_path: prefix,
                result_params: params,
            });
        }
        return Ok(results);
    }
    if requested == SUBS_TABLE {
        for instance in state.subscriptions.instances() {
            let prefix = format!("{}{}.", SUBS_TABLE, instance);
            let params = ["ID", "NotifType", "ReferenceList", "Enable", "Persistent"]
                .iter()
                .filter_map(|name| {
                    state
                        .subscriptions
                        .param_value(instance, name)
                        .map(|value| ResultParamsEntry {
                            key: name.to_string(),
                            value,
                        })
                })
                .collect();
            results.push(ResolvedPathResult {
                resolved_path: prefix,
                result_params: params,
            });
        }
        return Ok(results);
    }
    Err((
        UspError::InvalidPath,
        format!("Path '{}' is not readable", requested),
    ))
}

fn internal_param_value(state: &PlatformState, path: &str) -> Option<String> {
    if path == "Device.USPServices.USPServiceNumberOfEntries" {
        return Some(state.services.count().to_string());
    }
    if let Some(rest) = path.strip_prefix(SERVICE_TABLE) {
        let (instance, name) = rest.split_once('.')?;
        let instance: u32 = instance.parse().ok()?;
        return match name {
            "EndpointID" => get_service_endpoint_id(state, instance),
            "Protocol" => get_service_protocol(state, instance),
            "DataModelPaths" => get_service_dm_paths(state, instance),
            "HasController" => get_service_has_controller(state, instance).map(|b| b.to_string()),
            _ => None,
        };
    }
    if let Some(rest) = path.strip_prefix(SUBS_TABLE) {
        let (instance, name) = rest.split_once('.')?;
        let instance: u32 = instance.parse().ok()?;
        return state.subscriptions.param_value(instance, name);
    }
    if let Some(rest) = path.strip_prefix(REQUEST_TABLE) {
        let (instance, name) = rest.split_once('.')?;
        let instance: u32 = instance.parse().ok()?;
        let row = state.requests.row(instance)?;
        return match name {
            "Command" => Some(row.command_path),
            "CommandKey" => Some(row.command_key),
            "Status" => Some(format!("{:?}", row.status)),
            _ => None,
        };
    }
    None
}

// ---------------------------------------------------------------------------
// Set

pub async fn handle_set(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) {
    let Body::Request(Request::Set(set)) = &msg.body else {
        send_message_not_understood(mtpc, endpoint_id, msg.msg_id(), "malformed Set").await;
        return;
    };

    let mut resp = SetResp::default();
    for obj in &set.update_objs {
        let params: Vec<(String, String)> = obj
            .param_settings
            .iter()
            .map(|p| (format!("{}{}", with_trailing_dot(&obj.obj_path), p.param), p.value.clone()))
            .collect();

        let result = set_one_object(state, &obj.obj_path, &params, role).await;
        match result {
            Ok(()) => resp.updated_obj_results.push(UpdatedObjectResult {
                requested_path: obj.obj_path.clone(),
                oper_status: SetOperationStatus::Success {
                    updated_inst_results: vec![UpdatedInstanceResult {
                        affected_path: with_trailing_dot(&obj.obj_path),
                        updated_params: Vec::new(),
                        param_errs: Vec::new(),
                    }],
                },
            }),
            Err((err, err_msg, failing_param)) => {
                if !set.allow_partial {
                    let mut error_msg =
                        UspMsg::error(msg.msg_id().to_string(), &err, err_msg.clone());
                    if let (Body::Error(body), Some(param)) = (&mut error_msg.body, failing_param) {
                        body.param_errs.push(ParamError {
                            param_path: param,
                            err_code: err.to_wire_code(),
                            err_msg,
                        });
                    }
                    reply(mtpc, endpoint_id, error_msg).await;
                    return;
                }
                resp.updated_obj_results.push(UpdatedObjectResult {
                    requested_path: obj.obj_path.clone(),
                    oper_status: SetOperationStatus::Failure {
                        err_code: err.to_wire_code(),
                        err_msg,
                        updated_inst_failures: failing_param
                            .map(|param| {
                                vec![ParamError {
                                    param_path: param,
                                    err_code: err.to_wire_code(),
                                    err_msg: String::new(),
                                }]
                            })
                            .unwrap_or_default(),
                    },
                });
            }
        }
    }

    let reply_msg = UspMsg::response(msg.msg_id().to_string(), Response::SetResp(resp));
    reply(mtpc, endpoint_id, reply_msg).await;
}

async fn set_one_object(
    state: &PlatformState,
    obj_path: &str,
    params: &[(String, String)],
    role: &CombinedRole,
) -> Result<(), (UspError, String, Option<String>)> {
    let requested = with_trailing_dot(obj_path);
    let node = state.schema.node_snapshot(&requested).ok_or_else(|| {
        (
            UspError::InvalidPath,
            format!("Path '{}' does not exist in the data model", obj_path),
            None,
        )
    })?;
    if !node.is_object() {
        return Err((
            UspError::InvalidPath,
            format!("Path '{}' is not an object", obj_path),
            None,
        ));
    }

    for (path, _) in params {
        let param_node = state.schema.node_snapshot(path).ok_or_else(|| {
            (
                UspError::InvalidPath,
                format!("Parameter '{}' does not exist", path),
                Some(path.clone()),
            )
        })?;
        let writable = matches!(
            param_node.node_type,
            SchemaNodeType::Param { writable: true, .. }
        );
        if !writable {
            return Err((
                UspError::RequestDenied,
                format!("Parameter '{}' is not writable", path),
                Some(path.clone()),
            ));
        }
        if !state.permissions.is_permitted(&param_node.path, role, PERMIT_SET) {
            return Err((
                UspError::PermissionDenied,
                format!("No permission to set '{}'", path),
                Some(path.clone()),
            ));
        }
    }

    match node.group_id {
        None => {
            // Of the internal tables only subscription rows are writable
            if let Some(rest) = requested.strip_prefix(SUBS_TABLE) {
                let instance: u32 = rest
                    .trim_end_matches('.')
                    .parse()
                    .map_err(|_| {
                        (
                            UspError::InvalidPath,
                            format!("Path '{}' is not a subscription row", obj_path),
                            None,
                        )
                    })?;
                for (path, value) in params {
                    let (_, name) = split_param_path(path);
                    state
                        .subscriptions
                        .set_param(instance, &name, value)
                        .map_err(|e| {
                            (
                                e,
                                format!("Failed to set '{}'", path),
                                Some(path.clone()),
                            )
                        })?;
                }
                Ok(())
            } else {
                Err((
                    UspError::RequestDenied,
                    format!("Object '{}' is not writable", obj_path),
                    None,
                ))
            }
        }
        Some(group_id) => group_set(state, group_id, params).await.map_err(|f| {
            let failing = f.failure_index.and_then(|i| params.get(i)).map(|(p, _)| p.clone());
            (f.err, f.err_msg, failing)
        }),
    }
}

// ---------------------------------------------------------------------------
// Add

pub async fn handle_add(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) {
    let Body::Request(Request::Add(add)) = &msg.body else {
        send_message_not_understood(mtpc, endpoint_id, msg.msg_id(), "malformed Add").await;
        return;
    };

    let mut resp = AddResp::default();
    for obj in &add.create_objs {
        let params: Vec<(String, String, bool)> = obj
            .param_settings
            .iter()
            .map(|p| (p.param.clone(), p.value.clone(), p.required))
            .collect();
        match add_one_object(state, &obj.obj_path, &params, endpoint_id, mtpc, role).await {
            Ok(status) => resp.created_obj_results.push(CreatedObjectResult {
                requested_path: obj.obj_path.clone(),
                oper_status: status,
            }),
            Err((err, err_msg)) => {
                if !add.allow_partial {
                    let error_msg = UspMsg::error(msg.msg_id().to_string(), &err, err_msg);
                    reply(mtpc, endpoint_id, error_msg).await;
                    return;
                }
                resp.created_obj_results.push(CreatedObjectResult {
                    requested_path: obj.obj_path.clone(),
                    oper_status: AddOperationStatus::Failure {
                        err_code: err.to_wire_code(),
                        err_msg,
                    },
                });
            }
        }
    }

    let reply_msg = UspMsg::response(msg.msg_id().to_string(), Response::AddResp(resp));
    reply(mtpc, endpoint_id, reply_msg).await;
}

async fn add_one_object(
    state: &PlatformState,
    obj_path: &str,
    params: &[(String, String, bool)],
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) -> Result<AddOperationStatus, (UspError, String)> {
    let requested = with_trailing_dot(obj_path);
    let node = state.schema.node_snapshot(&requested).ok_or_else(|| {
        (
            UspError::InvalidPath,
            format!("Path '{}' does not exist in the data model", obj_path),
        )
    })?;
    if !node.is_multi_instance() {
        return Err((
            UspError::CreationFailure,
            format!("Object '{}' is not a table", obj_path),
        ));
    }
    if !state.permissions.is_permitted(&node.path, role, PERMIT_ADD) {
        return Err((
            UspError::PermissionDenied,
            format!("No permission to add to '{}'", obj_path),
        ));
    }

    match node.group_id {
        None => {
            if node.path == format!("{}{{i}}.", SUBS_TABLE) {
                add_subscription_row(state, &requested, params, endpoint_id, mtpc).await
            } else {
                Err((
                    UspError::CreationFailure,
                    format!("Instances of '{}' cannot be added externally", obj_path),
                ))
            }
        }
        Some(group_id) => {
            let mut add_params: Vec<GroupAddParam> = params
                .iter()
                .map(|(name, value, required)| GroupAddParam::new(name, value, *required))
                .collect();
            match create_object(state, group_id, &requested, &mut add_params).await {
                Ok(result) => Ok(AddOperationStatus::Success {
                    instantiated_path: format!("{}{}.", requested, result.instance),
                    unique_keys: result
                        .unique_keys
                        .into_iter()
                        .map(|(key, value)| ResultParamsEntry { key, value })
                        .collect(),
                    param_errs: add_params
                        .into_iter()
                        .filter(|p| p.err_code != 0)
                        .map(|p| ParamError {
                            param_path: p.name,
                            err_code: p.err_code,
                            err_msg: p.err_msg,
                        })
                        .collect(),
                }),
                Err(failure) => Err((failure.err, failure.err_msg)),
            }
        }
    }
}

/// Creating a subscription row binds the Broker's table; any path owned by
/// a Service is then also subscribed on that Service so notifications flow
/// through the vendor layer.
async fn add_subscription_row(
    state: &PlatformState,
    requested: &str,
    params: &[(String, String, bool)],
    endpoint_id: &str,
    mtpc: &MtpConn,
) -> Result<AddOperationStatus, (UspError, String)> {
    let kv: Vec<(String, String)> = params
        .iter()
        .map(|(k, v, _)| (k.clone(), v.clone()))
        .collect();
    let instance = state
        .subscriptions
        .add_row_from_params(
            &kv,
            Some(Recipient {
                endpoint_id: endpoint_id.to_string(),
                mtp: mtpc.clone(),
            }),
        )
        .map_err(|e| (e, "Invalid subscription parameters".to_string()))?;

    let row = state.subscriptions.row(instance).unwrap();
    if row.enable {
        for path in &row.reference_list {
            let owner = state.schema.node_group(path).flatten();
            if let Some(group_id) = owner {
                match group_subscribe(state, instance, group_id, row.notify_type, path).await {
                    Ok(()) => state.subscriptions.bind_path(instance, path, group_id),
                    Err(e) => error!(
                        "Failed to create subscription for '{}' on group {}: {}",
                        path, group_id, e
                    ),
                }
            }
        }
    }

    Ok(AddOperationStatus::Success {
        instantiated_path: format!("{}{}.", requested, instance),
        unique_keys: vec![ResultParamsEntry {
            key: "ID".to_string(),
            value: row.id,
        }],
        param_errs: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Delete

pub async fn handle_delete(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) {
    let Body::Request(Request::Delete(del)) = &msg.body else {
        send_message_not_understood(mtpc, endpoint_id, msg.msg_id(), "malformed Delete").await;
        return;
    };

    let mut resp = DeleteResp::default();
    for path in &del.obj_paths {
        match delete_one_object(state, path, role).await {
            Ok(()) => resp.deleted_obj_results.push(DeletedObjectResult {
                requested_path: path.clone(),
                oper_status: DeleteOperationStatus::Success {
                    affected_paths: vec![with_trailing_dot(path)],
                    unaffected_path_errs: Vec::new(),
                },
            }),
            Err((err, err_msg)) => {
                if !del.allow_partial {
                    let error_msg = UspMsg::error(msg.msg_id().to_string(), &err, err_msg);
                    reply(mtpc, endpoint_id, error_msg).await;
                    return;
                }
                resp.deleted_obj_results.push(DeletedObjectResult {
                    requested_path: path.clone(),
                    oper_status: DeleteOperationStatus::Failure {
                        err_code: err.to_wire_code(),
                        err_msg,
                    },
                });
            }
        }
    }

    let reply_msg = UspMsg::response(msg.msg_id().to_string(), Response::DeleteResp(resp));
    reply(mtpc, endpoint_id, reply_msg).await;
}

async fn delete_one_object(
    state: &PlatformState,
    path: &str,
    role: &CombinedRole,
) -> Result<(), (UspError, String)> {
    let requested = with_trailing_dot(path);
    let node = state.schema.node_snapshot(&requested).ok_or_else(|| {
        (
            UspError::InvalidPath,
            format!("Path '{}' does not exist in the data model", path),
        )
    })?;
    if !node.is_multi_instance() || trailing_instance_number(&requested).is_none() {
        return Err((
            UspError::InvalidPath,
            format!("Path '{}' is not an object instance", path),
        ));
    }
    if !state.permissions.is_permitted(&node.path, role, PERMIT_DEL) {
        return Err((
            UspError::PermissionDenied,
            format!("No permission to delete '{}'", path),
        ));
    }

    match node.group_id {
        None => {
            if node.path == format!("{}{{i}}.", SUBS_TABLE) {
                let instance = trailing_instance_number(&requested).unwrap();
                let row = state.subscriptions.row(instance).ok_or_else(|| {
                    (
                        UspError::ObjectDoesNotExist,
                        format!("'{}' does not exist", path),
                    )
                })?;
                for (sub_path, group_id) in &row.vendor_bound {
                    if let Err(e) = group_unsubscribe(state, instance, *group_id, sub_path).await {
                        error!("Failed to unsubscribe '{}': {}", sub_path, e);
                    }
                }
                state.subscriptions.delete_row(instance);
                Ok(())
            } else {
                Err((
                    UspError::RequestDenied,
                    format!("Instances of '{}' cannot be deleted externally", path),
                ))
            }
        }
        Some(group_id) => group_delete(state, group_id, requested.trim_end_matches('.'))
            .await
            .map_err(|e| (e, format!("Failed to delete '{}'", path))),
    }
}

// ---------------------------------------------------------------------------
// Operate

pub async fn handle_operate(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) {
    let Body::Request(Request::Operate(operate)) = &msg.body else {
        send_message_not_understood(mtpc, endpoint_id, msg.msg_id(), "malformed Operate").await;
        return;
    };

    let input_args: Vec<(String, String)> = operate
        .input_args
        .iter()
        .map(|e| (e.key.clone(), e.value.clone()))
        .collect();

    let operation_resp = run_operate(state, &operate.command, &operate.command_key, &input_args, role).await;

    if !operate.send_resp {
        return;
    }
    let resp = OperateResp {
        operation_results: vec![OperationResult {
            executed_command: operate.command.clone(),
            operation_resp,
        }],
    };
    let reply_msg = UspMsg::response(msg.msg_id().to_string(), Response::OperateResp(resp));
    reply(mtpc, endpoint_id, reply_msg).await;
}

async fn run_operate(
    state: &PlatformState,
    command: &str,
    command_key: &str,
    input_args: &[(String, String)],
    role: &CombinedRole,
) -> OperationResp {
    let failure = |err: UspError, err_msg: String| OperationResp::CommandFailure {
        err_code: err.to_wire_code(),
        err_msg,
    };

    let Some(node) = state.schema.node_snapshot(command) else {
        return failure(
            UspError::InvalidPath,
            format!("Command '{}' does not exist", command),
        );
    };
    let SchemaNodeType::Command { kind, .. } = &node.node_type else {
        return failure(
            UspError::InvalidPath,
            format!("Path '{}' is not a command", command),
        );
    };
    if !state.permissions.is_permitted(&node.path, role, PERMIT_OPER) {
        return failure(
            UspError::PermissionDenied,
            format!("No permission to invoke '{}'", command),
        );
    }
    let Some(group_id) = node.group_id else {
        return failure(
            UspError::InvalidPath,
            format!("Command '{}' has no provider", command),
        );
    };

    match kind {
        CommandKind::Sync => {
            match sync_operate(state, group_id, command, command_key, input_args).await {
                Ok(args) => OperationResp::OutputArgs(args),
                Err(f) => failure(f.err, f.err_msg),
            }
        }
        CommandKind::Async => {
            let instance = state.requests.add(command, command_key);
            match async_operate(state, group_id, command, input_args, instance).await {
                Ok(()) => OperationResp::ReqObjPath(format!("{}{}.", REQUEST_TABLE, instance)),
                Err(f) => {
                    state.requests.delete(instance);
                    failure(f.err, f.err_msg)
                }
            }
        }
    }
}
