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

use usp_sdk::api::mtp::MtpConn;
use usp_sdk::api::usp::{MsgType, ResultParamsEntry};
use usp_sdk::log::warn;
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::path_utils::with_trailing_dot;

use crate::broker::msg_builder::{
    create_add_req, create_delete_req, create_get_instances_req, create_get_req,
    create_operate_req, create_set_req, GroupAddParam,
};
use crate::broker::msg_decoder::{
    process_add_response, process_delete_response, process_get_instances_response,
    process_get_response, process_operate_response, process_set_response, AddResult,
    DecodeFailure, GroupOpFailure, OperateOutcome,
};
use crate::state::platform_state::PlatformState;
use crate::state::request_state::signal_operation_complete;
use crate::state::subscription_state::{NotifyType, SUBS_TABLE};

/// Looks up the Service owning a group and its controller-side handle,
/// failing fast when the connection has dropped in the meantime.
fn service_conn(state: &PlatformState, group_id: usize) -> Result<(String, MtpConn), UspError> {
    let found = state
        .services
        .with_service_by_group(group_id, |s| {
            (s.endpoint_id.clone(), s.controller_mtp.clone())
        })
        .ok_or(UspError::Internal)?;
    match found {
        (endpoint, Some(conn)) if conn.is_reply_to_specified => Ok((endpoint, conn)),
        (endpoint, _) => {
            warn!("Unable to send to UspService={}. Connection dropped", endpoint);
            Err(UspError::Internal)
        }
    }
}

async fn round_trip(
    state: &PlatformState,
    group_id: usize,
    msg: usp_sdk::api::usp::UspMsg,
    expected: MsgType,
) -> Result<usp_sdk::api::usp::UspMsg, UspError> {
    let (endpoint, conn) = service_conn(state, group_id)?;
    state
        .mtp
        .send_request_and_await_response(
            &endpoint,
            msg,
            &conn,
            expected,
            state.config.response_timeout_secs,
        )
        .await
}

/// Grouped Get: one USP Get round-trip for the parameters owned by the
/// Service, returned as (path, value) pairs.
pub async fn group_get(
    state: &PlatformState,
    group_id: usize,
    paths: &[String],
) -> Result<Vec<(String, String)>, UspError> {
    let req = create_get_req(state.mtp.next_msg_id(), paths);
    let resp = round_trip(state, group_id, req, MsgType::GetResp).await?;
    process_get_response(&resp).map_err(|f| f.err)
}

/// Grouped Set with allow_partial=false; the failure records the index of
/// the first parameter the Service refused.
pub async fn group_set(
    state: &PlatformState,
    group_id: usize,
    params: &[(String, String)],
) -> Result<(), GroupOpFailure> {
    let req = create_set_req(state.mtp.next_msg_id(), params);
    let resp = round_trip(state, group_id, req, MsgType::SetResp)
        .await
        .map_err(|err| GroupOpFailure {
            err,
            err_msg: String::new(),
            failure_index: None,
        })?;
    process_set_response(&resp, params)
}

/// Adds one instance with no child parameters, returning its number.
pub async fn group_add(
    state: &PlatformState,
    group_id: usize,
    path: &str,
) -> Result<u32, UspError> {
    let obj_path = with_trailing_dot(path);
    let req = create_add_req(state.mtp.next_msg_id(), &obj_path, &[]);
    let resp = round_trip(state, group_id, req, MsgType::AddResp).await?;
    process_add_response(state, &resp, &obj_path, None)
        .map(|r| r.instance)
        .map_err(|f| f.err)
}

/// Adds one instance with child parameters; per-parameter errors are
/// written back into `params`.
pub async fn create_object(
    state: &PlatformState,
    group_id: usize,
    path: &str,
    params: &mut Vec<GroupAddParam>,
) -> Result<AddResult, DecodeFailure> {
    let obj_path = with_trailing_dot(path);
    let req = create_add_req(state.mtp.next_msg_id(), &obj_path, params);
    let resp = round_trip(state, group_id, req, MsgType::AddResp)
        .await
        .map_err(|err| DecodeFailure {
            err,
            err_msg: String::new(),
            param_errs_path: None,
        })?;
    process_add_response(state, &resp, &obj_path, Some(params))
}

/// Deletes instances on the Service; used both directly and by the
/// unsubscribe and reconciliation paths.
pub async fn service_delete_instances(
    state: &PlatformState,
    group_id: usize,
    allow_partial: bool,
    paths: &[String],
) -> Result<(), GroupOpFailure> {
    let req = create_delete_req(state.mtp.next_msg_id(), paths, allow_partial);
    let resp = round_trip(state, group_id, req, MsgType::DeleteResp)
        .await
        .map_err(|err| GroupOpFailure {
            err,
            err_msg: String::new(),
            failure_index: None,
        })?;
    process_delete_response(&resp, paths)
}

pub async fn group_delete(
    state: &PlatformState,
    group_id: usize,
    path: &str,
) -> Result<(), UspError> {
    let paths = vec![with_trailing_dot(path)];
    service_delete_instances(state, group_id, false, &paths)
        .await
        .map_err(|f| f.err)
}

pub async fn multi_delete(
    state: &PlatformState,
    group_id: usize,
    allow_partial: bool,
    paths: &[String],
) -> Result<(), GroupOpFailure> {
    let obj_paths: Vec<String> = paths.iter().map(|p| with_trailing_dot(p)).collect();
    service_delete_instances(state, group_id, allow_partial, &obj_paths).await
}

/// Synchronous command: the Operate round-trip carries the outcome.
pub async fn sync_operate(
    state: &PlatformState,
    group_id: usize,
    path: &str,
    command_key: &str,
    input_args: &[(String, String)],
) -> Result<Vec<ResultParamsEntry>, DecodeFailure> {
    let req = create_operate_req(state.mtp.next_msg_id(), path, command_key, input_args);
    let resp = round_trip(state, group_id, req, MsgType::OperateResp)
        .await
        .map_err(|err| DecodeFailure {
            err,
            err_msg: String::new(),
            param_errs_path: None,
        })?;
    match process_operate_response(&resp, path, true)? {
        OperateOutcome::Complete(args) => Ok(args),
        OperateOutcome::Started => unreachable!(),
    }
}

/// Asynchronous command. Refused unless an OperationComplete subscription
/// covers the command (the Broker would otherwise never learn of
/// completion) and the (path, command_key) pair is unique in flight. The
/// ReqMap entry is inserted before the request goes out, so a Service
/// emitting the completion notification before its OperateResponse is
/// still correlated.
pub async fn async_operate(
    state: &PlatformState,
    group_id: usize,
    path: &str,
    input_args: &[(String, String)],
    request_instance: u32,
) -> Result<(), DecodeFailure> {
    let command_key = state
        .requests
        .command_key(request_instance)
        .ok_or_else(|| DecodeFailure {
            err: UspError::Internal,
            err_msg: format!("No request row {}", request_instance),
            param_errs_path: None,
        })?;

    let precondition = state
        .services
        .with_service_by_group(group_id, |s| {
            if s.subs_map.find_by_path(path).is_none() {
                return Err(DecodeFailure {
                    err: UspError::RequestDenied,
                    err_msg: format!(
                        "OperationComplete subscription must be set before invoking '{}'",
                        path
                    ),
                    param_errs_path: None,
                });
            }
            if s.req_map.find(path, &command_key).is_some() {
                return Err(DecodeFailure {
                    err: UspError::RequestDenied,
                    err_msg: format!(
                        "Command_key='{}' is not unique for path '{}'",
                        command_key, path
                    ),
                    param_errs_path: None,
                });
            }
            Ok(())
        })
        .unwrap_or_else(|| {
            Err(DecodeFailure {
                err: UspError::Internal,
                err_msg: format!("No service for group {}", group_id),
                param_errs_path: None,
            })
        });
    precondition?;

    state.services.with_service_by_group_mut(group_id, |s| {
        s.req_map.add(request_instance, path, &command_key)
    });

    let req = create_operate_req(state.mtp.next_msg_id(), path, &command_key, input_args);
    let outcome = match round_trip(state, group_id, req, MsgType::OperateResp).await {
        Ok(resp) => process_operate_response(&resp, path, false),
        Err(err) => Err(DecodeFailure {
            err,
            err_msg: String::new(),
            param_errs_path: None,
        }),
    };

    match outcome {
        Err(failure) => {
            state.services.with_service_by_group_mut(group_id, |s| {
                s.req_map.remove(path, &command_key)
            });
            Err(failure)
        }
        Ok(OperateOutcome::Started) => {
            state.requests.set_active(request_instance);
            Ok(())
        }
        Ok(OperateOutcome::Complete(output_args)) => {
            // An async command completing inside the Operate reply is
            // reported as an immediate completion
            state.requests.set_active(request_instance);
            state.services.with_service_by_group_mut(group_id, |s| {
                s.req_map.remove(path, &command_key)
            });
            signal_operation_complete(state, request_instance, None, output_args).await;
            Ok(())
        }
    }
}

/// Refreshes the instance cache for a set of top-level tables via one
/// GetInstances round-trip.
pub async fn service_refresh_instances(
    state: &PlatformState,
    group_id: usize,
    paths: &[String],
) -> Result<(), UspError> {
    let req = create_get_instances_req(state.mtp.next_msg_id(), paths);
    let resp = round_trip(state, group_id, req, MsgType::GetInstancesResp).await?;
    let instances = process_get_instances_response(&resp).map_err(|f| f.err)?;

    let max_keys = state.config.max_compound_key_params;
    state.schema.write(|tree| {
        for ci in &instances {
            tree.seed_instance(&ci.instantiated_obj_path);
            if !ci.unique_keys.is_empty() {
                let keys: Vec<String> = ci.unique_keys.iter().map(|k| k.key.clone()).collect();
                tree.register_unique_keys(&ci.instantiated_obj_path, &keys, max_keys);
            }
        }
    });
    Ok(())
}

/// Refresh-instances hook for a single table, returning the cache expiry.
/// The negative expiry scopes the cache to the current message only;
/// passthrough traffic bypasses the cache, so anything longer would leave
/// it stale.
pub async fn refresh_instances(
    state: &PlatformState,
    group_id: usize,
    path: &str,
) -> Result<i64, UspError> {
    service_refresh_instances(state, group_id, &[path.to_string()]).await?;
    Ok(state.config.instance_cache_expiry_secs)
}

/// Creates a subscription row on the Service for one path of a Broker
/// subscription and records the pairing in SubsMap.
pub async fn group_subscribe(
    state: &PlatformState,
    broker_instance: u32,
    group_id: usize,
    notify_type: NotifyType,
    path: &str,
) -> Result<(), UspError> {
    let subscription_id = state.mtp.next_subscription_id();
    let mut params = vec![
        GroupAddParam::new("NotifType", notify_type.as_str(), true),
        GroupAddParam::new("ReferenceList", path, true),
        GroupAddParam::new("ID", subscription_id.clone(), true),
        GroupAddParam::new("Persistent", "false", true),
        GroupAddParam::new("TimeToLive", "0", true),
        GroupAddParam::new("NotifRetry", "false", true),
        GroupAddParam::new("NotifExpiration", "0", true),
        GroupAddParam::new("Enable", "true", true),
    ];

    let req = create_add_req(state.mtp.next_msg_id(), SUBS_TABLE, &params);
    let resp = round_trip(state, group_id, req, MsgType::AddResp).await?;
    let result = process_add_response(state, &resp, SUBS_TABLE, Some(&mut params))
        .map_err(|f| f.err)?;

    state.services.with_service_by_group_mut(group_id, |s| {
        s.subs_map
            .add(result.instance, path, &subscription_id, broker_instance)
    });
    Ok(())
}

/// Deletes the Service-side subscription row paired with a Broker
/// subscription path and drops the SubsMap entry.
pub async fn group_unsubscribe(
    state: &PlatformState,
    broker_instance: u32,
    group_id: usize,
    path: &str,
) -> Result<(), UspError> {
    let service_instance = state
        .services
        .with_service_by_group(group_id, |s| {
            s.subs_map
                .find_by_broker_instance_and_path(broker_instance, path)
                .map(|e| e.service_instance)
        })
        .flatten()
        .ok_or_else(|| {
            warn!("Not subscribed to path {}", path);
            UspError::Internal
        })?;

    let obj_path = format!("{}{}.", SUBS_TABLE, service_instance);
    let result = service_delete_instances(state, group_id, false, &[obj_path]).await;

    state.services.with_service_by_group_mut(group_id, |s| {
        s.subs_map
            .remove_by_broker_instance_and_path(broker_instance, path)
    });
    result.map_err(|f| f.err)
}

/// Creates on the Service every enabled Broker subscription path owned by
/// its group that no vendor layer satisfies yet.
pub async fn start_all_vendor_layer_subs(state: &PlatformState, group_id: usize) {
    for (broker_instance, notify_type, path) in state.subscriptions.unbound_enabled_paths() {
        let owned = state.schema.node_group(&path) == Some(Some(group_id));
        if !owned {
            continue;
        }
        match group_subscribe(state, broker_instance, group_id, notify_type, &path).await {
            Ok(()) => {
                state.subscriptions.bind_path(broker_instance, &path, group_id);
            }
            Err(e) => {
                warn!(
                    "Failed to create subscription for {} on group {}: {}",
                    path, group_id, e
                );
            }
        }
    }
}
