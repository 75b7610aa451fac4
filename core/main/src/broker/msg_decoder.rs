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
    AddOperationStatus, Body, CurrInstance, DeleteOperationStatus, MsgType, OperationResp,
    Response, ResultParamsEntry, SetOperationStatus, UspMsg,
};
use usp_sdk::log::{error, warn};
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::path_utils::{tail_matches, to_schema_path, trailing_instance_number};

use crate::broker::msg_builder::GroupAddParam;
use crate::state::platform_state::PlatformState;

/// A response that decoded to a failure, including the parameter path an
/// embedded USP Error singled out (used to locate failure indices).
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub err: UspError,
    pub err_msg: String,
    pub param_errs_path: Option<String>,
}

impl DecodeFailure {
    fn new(err: UspError, err_msg: impl Into<String>) -> DecodeFailure {
        DecodeFailure {
            err,
            err_msg: err_msg.into(),
            param_errs_path: None,
        }
    }
}

/// A grouped Set/Delete that failed, with the index of the first failing
/// entry when the Service identified one.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOpFailure {
    pub err: UspError,
    pub err_msg: String,
    pub failure_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddResult {
    pub instance: u32,
    pub unique_keys: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperateOutcome {
    /// Async command accepted; completion arrives as a notification.
    Started,
    /// The command finished within the Operate round-trip.
    Complete(Vec<ResultParamsEntry>),
}

/// Checks that the message body holds the expected response kind. A USP
/// Error body is decoded into a failure; any other mismatch is a protocol
/// violation by the Service.
fn validate_response(resp: &UspMsg, expected: MsgType) -> Result<&Response, DecodeFailure> {
    match &resp.body {
        Body::Error(err) => {
            let mut failure = DecodeFailure::new(
                UspError::from_wire_code(err.err_code),
                err.err_msg.clone(),
            );
            failure.param_errs_path = err.param_errs.first().map(|p| p.param_path.clone());
            Err(failure)
        }
        Body::Response(response) if response.msg_type() == expected => Ok(response),
        _ => Err(DecodeFailure::new(
            UspError::Internal,
            format!("Expected {} in response, got {}", expected, resp.msg_type()),
        )),
    }
}

fn propagate_param_err(
    path: &str,
    err_code: u32,
    err_msg: &str,
    params: &mut Option<&mut Vec<GroupAddParam>>,
) {
    if let Some(params) = params {
        if let Some(p) = params.iter_mut().find(|p| tail_matches(path, &p.name)) {
            p.err_code = err_code;
            p.err_msg = err_msg.to_string();
        }
    }
}

/// Decodes a Get response into (requested_path, value) pairs. Errored or
/// shape-violating entries are logged and skipped; the group-get caller
/// notices any missing values.
pub fn process_get_response(resp: &UspMsg) -> Result<Vec<(String, String)>, DecodeFailure> {
    let response = validate_response(resp, MsgType::GetResp)?;
    let Response::GetResp(get) = response else {
        unreachable!();
    };

    let mut values = Vec::new();
    for rpr in &get.req_path_results {
        if rpr.err_code != 0 {
            warn!("Failed to get {}: {}", rpr.requested_path, rpr.err_msg);
            continue;
        }
        let Some(res) = rpr.resolved_path_results.first() else {
            warn!(
                "No resolved path result for '{}' in GetResponse",
                rpr.requested_path
            );
            continue;
        };
        let Some(entry) = res.result_params.first() else {
            warn!(
                "No result params entry for '{}' in GetResponse",
                rpr.requested_path
            );
            continue;
        };
        values.push((rpr.requested_path.clone(), entry.value.clone()));
    }
    Ok(values)
}

/// Decodes an Add response for a single created object, validating that
/// the instantiated path matches the requested table and registering any
/// returned unique keys. Per-parameter errors are copied back into
/// `params` by tail match.
pub fn process_add_response(
    state: &PlatformState,
    resp: &UspMsg,
    path: &str,
    mut params: Option<&mut Vec<GroupAddParam>>,
) -> Result<AddResult, DecodeFailure> {
    let response = match validate_response(resp, MsgType::AddResp) {
        Ok(r) => r,
        Err(failure) => {
            if let Some(p) = &failure.param_errs_path {
                propagate_param_err(p, failure.err.to_wire_code(), &failure.err_msg, &mut params);
            }
            return Err(failure);
        }
    };
    let Response::AddResp(add) = response else {
        unreachable!();
    };

    if add.created_obj_results.len() != 1 {
        return Err(DecodeFailure::new(
            UspError::Internal,
            format!(
                "Unexpected number of objects created ({})",
                add.created_obj_results.len()
            ),
        ));
    }
    let created = &add.created_obj_results[0];
    if created.requested_path != path {
        return Err(DecodeFailure::new(
            UspError::Internal,
            format!(
                "Unexpected requested path in AddResponse (got={}, expected={})",
                created.requested_path, path
            ),
        ));
    }

    match &created.oper_status {
        AddOperationStatus::Failure { err_code, err_msg } => {
            let err = if *err_code == 0 {
                UspError::Internal
            } else {
                UspError::from_wire_code(*err_code)
            };
            Err(DecodeFailure::new(err, err_msg.clone()))
        }
        AddOperationStatus::Success {
            instantiated_path,
            unique_keys,
            param_errs,
        } => {
            let instance = validate_add_response_path(state, path, instantiated_path)?;

            if !unique_keys.is_empty() {
                let key_names: Vec<String> =
                    unique_keys.iter().map(|k| k.key.clone()).collect();
                let max_keys = state.config.max_compound_key_params;
                state.schema.write(|tree| {
                    tree.register_unique_keys(instantiated_path, &key_names, max_keys)
                });
            }
            for pe in param_errs {
                propagate_param_err(&pe.param_path, pe.err_code, &pe.err_msg, &mut params);
            }

            Ok(AddResult {
                instance,
                unique_keys: unique_keys
                    .iter()
                    .map(|k| (k.key.clone(), k.value.clone()))
                    .collect(),
            })
        }
    }
}

/// The instantiated path must be an instance of the requested table, known
/// to the Broker's schema, with a trailing instance number.
fn validate_add_response_path(
    state: &PlatformState,
    requested_path: &str,
    instantiated_path: &str,
) -> Result<u32, DecodeFailure> {
    if state.schema.node_snapshot(instantiated_path).is_none() {
        return Err(DecodeFailure::new(
            UspError::Internal,
            format!("Unknown AddResponse instantiated path {}", instantiated_path),
        ));
    }
    let expected = to_schema_path(requested_path);
    let received = to_schema_path(instantiated_path);
    if received.trim_end_matches('.') != format!("{}{{i}}", expected).trim_end_matches('.') {
        return Err(DecodeFailure::new(
            UspError::Internal,
            format!(
                "AddResponse contains unexpected object (requested={}, got={})",
                requested_path, instantiated_path
            ),
        ));
    }
    trailing_instance_number(instantiated_path).ok_or_else(|| {
        DecodeFailure::new(
            UspError::Internal,
            format!(
                "AddResponse contains object without instance number ({})",
                instantiated_path
            ),
        )
    })
}

/// Decodes a Set response issued with allow_partial=false.
pub fn process_set_response(
    resp: &UspMsg,
    params: &[(String, String)],
) -> Result<(), GroupOpFailure> {
    let response = match validate_response(resp, MsgType::SetResp) {
        Ok(r) => r,
        Err(failure) => {
            let failure_index = failure
                .param_errs_path
                .as_ref()
                .and_then(|p| params.iter().position(|(name, _)| name == p || tail_matches(name, p)));
            return Err(GroupOpFailure {
                err: failure.err,
                err_msg: failure.err_msg,
                failure_index,
            });
        }
    };
    let Response::SetResp(set) = response else {
        unreachable!();
    };

    for result in &set.updated_obj_results {
        if let SetOperationStatus::Failure {
            err_code,
            err_msg,
            updated_inst_failures,
        } = &result.oper_status
        {
            let failure_index = updated_inst_failures.first().and_then(|pe| {
                params
                    .iter()
                    .position(|(name, _)| tail_matches(name, &pe.param_path))
            });
            return Err(GroupOpFailure {
                err: UspError::from_wire_code(*err_code),
                err_msg: err_msg.clone(),
                failure_index,
            });
        }
    }
    Ok(())
}

/// Decodes a Delete response for the exact set of requested instances.
/// An OperFailure under allow_partial=false is a Service protocol
/// violation, accepted as a failure with the index recorded.
pub fn process_delete_response(
    resp: &UspMsg,
    paths: &[String],
) -> Result<(), GroupOpFailure> {
    let response = match validate_response(resp, MsgType::DeleteResp) {
        Ok(r) => r,
        Err(failure) => {
            let failure_index = failure
                .param_errs_path
                .as_ref()
                .and_then(|p| paths.iter().position(|path| path == p));
            return Err(GroupOpFailure {
                err: failure.err,
                err_msg: failure.err_msg,
                failure_index,
            });
        }
    };
    let Response::DeleteResp(del) = response else {
        unreachable!();
    };

    if del.deleted_obj_results.len() != paths.len() {
        return Err(GroupOpFailure {
            err: UspError::Internal,
            err_msg: format!(
                "Unexpected number of objects deleted (got={}, expected={})",
                del.deleted_obj_results.len(),
                paths.len()
            ),
            failure_index: None,
        });
    }

    for (i, result) in del.deleted_obj_results.iter().enumerate() {
        if !paths.contains(&result.requested_path) {
            return Err(GroupOpFailure {
                err: UspError::Internal,
                err_msg: format!(
                    "Unexpected requested path in DeleteResponse ({})",
                    result.requested_path
                ),
                failure_index: None,
            });
        }
        match &result.oper_status {
            DeleteOperationStatus::Failure { err_code, err_msg } => {
                return Err(GroupOpFailure {
                    err: UspError::from_wire_code(*err_code),
                    err_msg: err_msg.clone(),
                    failure_index: Some(i),
                });
            }
            DeleteOperationStatus::Success {
                unaffected_path_errs,
                ..
            } => {
                if !unaffected_path_errs.is_empty() {
                    error!(
                        "DeleteResponse contained {} unaffected path errors, but shouldn't have",
                        unaffected_path_errs.len()
                    );
                }
            }
        }
    }
    Ok(())
}

/// Decodes an Operate response. `is_sync` rules the ReqObjPath case: a
/// synchronous command returning a Request-table path is a violation.
pub fn process_operate_response(
    resp: &UspMsg,
    path: &str,
    is_sync: bool,
) -> Result<OperateOutcome, DecodeFailure> {
    let response = validate_response(resp, MsgType::OperateResp)?;
    let Response::OperateResp(oper) = response else {
        unreachable!();
    };

    if oper.operation_results.len() != 1 {
        return Err(DecodeFailure::new(
            UspError::Internal,
            format!(
                "Unexpected number of operation results (got={}, expected=1)",
                oper.operation_results.len()
            ),
        ));
    }
    let result = &oper.operation_results[0];
    if result.executed_command != path {
        return Err(DecodeFailure::new(
            UspError::Internal,
            format!(
                "Unexpected operation in response (got='{}', expected='{}')",
                result.executed_command, path
            ),
        ));
    }

    match &result.operation_resp {
        OperationResp::ReqObjPath(req_obj_path) => {
            if is_sync {
                Err(DecodeFailure::new(
                    UspError::Internal,
                    format!(
                        "Synchronous operation unexpectedly returning request table path ({})",
                        req_obj_path
                    ),
                ))
            } else {
                Ok(OperateOutcome::Started)
            }
        }
        OperationResp::OutputArgs(args) => Ok(OperateOutcome::Complete(args.clone())),
        OperationResp::CommandFailure { err_code, err_msg } => Err(DecodeFailure::new(
            UspError::from_wire_code(*err_code),
            err_msg.clone(),
        )),
    }
}

/// Decodes a GetInstances response into the instantiated paths it lists.
pub fn process_get_instances_response(
    resp: &UspMsg,
) -> Result<Vec<CurrInstance>, DecodeFailure> {
    let response = validate_response(resp, MsgType::GetInstancesResp)?;
    let Response::GetInstancesResp(geti) = response else {
        unreachable!();
    };

    let mut instances = Vec::new();
    for rpr in &geti.req_path_results {
        if rpr.err_code != 0 {
            return Err(DecodeFailure::new(
                UspError::from_wire_code(rpr.err_code),
                format!(
                    "Received error '{}' for object '{}'",
                    rpr.err_msg, rpr.requested_path
                ),
            ));
        }
        for ci in &rpr.curr_insts {
            if !ci.instantiated_obj_path.is_empty() {
                instances.push(ci.clone());
            }
        }
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::usp::{
        AddResp, CreatedObjectResult, DeleteResp, DeletedObjectResult, GetResp, OperateResp,
        OperationResult, RequestedPathResult, ResolvedPathResult,
    };
    use crate::state::schema_tree::ParamType;

    fn state_with_table() -> PlatformState {
        let state = PlatformState::default();
        state.schema.write(|tree| {
            tree.add_placeholder_object("Device.X.", 1).unwrap();
            tree.register_object(Some(1), "Device.X.Z.{i}.", true, true);
            tree.register_param(Some(1), "Device.X.Z.{i}.Name", true, ParamType::String);
        });
        state
    }

    fn get_resp(entries: Vec<RequestedPathResult>) -> UspMsg {
        UspMsg::response(
            "m-1".into(),
            Response::GetResp(GetResp {
                req_path_results: entries,
            }),
        )
    }

    #[test]
    fn get_response_skips_errored_paths() {
        let resp = get_resp(vec![
            RequestedPathResult {
                requested_path: "Device.X.Y".into(),
                err_code: 0,
                err_msg: String::new(),
                resolved_path_results: vec![ResolvedPathResult {
                    resolved_path: "Device.X.Y".into(),
                    result_params: vec![ResultParamsEntry {
                        key: "Y".into(),
                        value: "42".into(),
                    }],
                }],
            },
            RequestedPathResult {
                requested_path: "Device.X.Missing".into(),
                err_code: 7016,
                err_msg: "no such object".into(),
                resolved_path_results: vec![],
            },
        ]);
        let values = process_get_response(&resp).unwrap();
        assert_eq!(values, vec![("Device.X.Y".to_string(), "42".to_string())]);
    }

    #[test]
    fn get_response_rejects_wrong_kind() {
        let resp = UspMsg::response("m-1".into(), Response::SetResp(Default::default()));
        assert_eq!(
            process_get_response(&resp).unwrap_err().err,
            UspError::Internal
        );
    }

    #[test]
    fn error_body_decodes_to_failure() {
        let resp = UspMsg::error("m-1".into(), &UspError::RequestDenied, "nope");
        let failure = process_get_response(&resp).unwrap_err();
        assert_eq!(failure.err, UspError::RequestDenied);
        assert_eq!(failure.err_msg, "nope");
    }

    fn add_resp(requested: &str, status: AddOperationStatus) -> UspMsg {
        UspMsg::response(
            "m-1".into(),
            Response::AddResp(AddResp {
                created_obj_results: vec![CreatedObjectResult {
                    requested_path: requested.into(),
                    oper_status: status,
                }],
            }),
        )
    }

    #[test]
    fn add_response_extracts_instance_and_keys() {
        let state = state_with_table();
        let resp = add_resp(
            "Device.X.Z.",
            AddOperationStatus::Success {
                instantiated_path: "Device.X.Z.5.".into(),
                unique_keys: vec![ResultParamsEntry {
                    key: "Name".into(),
                    value: "first".into(),
                }],
                param_errs: vec![],
            },
        );
        let result = process_add_response(&state, &resp, "Device.X.Z.", None).unwrap();
        assert_eq!(result.instance, 5);
        assert_eq!(result.unique_keys[0].0, "Name");
        let keys = state
            .schema
            .node_snapshot("Device.X.Z.{i}.")
            .unwrap()
            .unique_keys;
        assert_eq!(keys, vec!["Name".to_string()]);
    }

    #[test]
    fn add_response_validates_instantiated_path() {
        let state = state_with_table();
        // Wrong table in the instantiated path
        let resp = add_resp(
            "Device.X.Z.",
            AddOperationStatus::Success {
                instantiated_path: "Device.X.5.".into(),
                unique_keys: vec![],
                param_errs: vec![],
            },
        );
        assert!(process_add_response(&state, &resp, "Device.X.Z.", None).is_err());
    }

    #[test]
    fn add_response_propagates_param_errors() {
        let state = state_with_table();
        let resp = add_resp(
            "Device.X.Z.",
            AddOperationStatus::Success {
                instantiated_path: "Device.X.Z.2.".into(),
                unique_keys: vec![],
                param_errs: vec![usp_sdk::api::usp::ParamError {
                    param_path: "Device.X.Z.2.Name".into(),
                    err_code: 7012,
                    err_msg: "bad value".into(),
                }],
            },
        );
        let mut params = vec![GroupAddParam::new("Name", "x", false)];
        process_add_response(&state, &resp, "Device.X.Z.", Some(&mut params)).unwrap();
        assert_eq!(params[0].err_code, 7012);
        assert_eq!(params[0].err_msg, "bad value");
    }

    #[test]
    fn delete_response_counts_results() {
        let paths = vec!["Device.X.Z.1.".to_string(), "Device.X.Z.2.".to_string()];
        let resp = UspMsg::response(
            "m-1".into(),
            Response::DeleteResp(DeleteResp {
                deleted_obj_results: vec![DeletedObjectResult {
                    requested_path: "Device.X.Z.1.".into(),
                    oper_status: DeleteOperationStatus::Success {
                        affected_paths: vec!["Device.X.Z.1.".into()],
                        unaffected_path_errs: vec![],
                    },
                }],
            }),
        );
        let failure = process_delete_response(&resp, &paths).unwrap_err();
        assert_eq!(failure.err, UspError::Internal);
    }

    #[test]
    fn delete_response_records_failure_index() {
        let paths = vec!["Device.X.Z.1.".to_string(), "Device.X.Z.2.".to_string()];
        let results: Vec<DeletedObjectResult> = vec![
            DeletedObjectResult {
                requested_path: "Device.X.Z.1.".into(),
                oper_status: DeleteOperationStatus::Success {
                    affected_paths: vec!["Device.X.Z.1.".into()],
                    unaffected_path_errs: vec![],
                },
            },
            DeletedObjectResult {
                requested_path: "Device.X.Z.2.".into(),
                oper_status: DeleteOperationStatus::Failure {
                    err_code: 7016,
                    err_msg: "gone".into(),
                },
            },
        ];
        let resp = UspMsg::response(
            "m-1".into(),
            Response::DeleteResp(DeleteResp {
                deleted_obj_results: results,
            }),
        );
        let failure = process_delete_response(&resp, &paths).unwrap_err();
        assert_eq!(failure.failure_index, Some(1));
        assert_eq!(failure.err, UspError::ObjectDoesNotExist);
    }

    fn operate_resp(command: &str, op: OperationResp) -> UspMsg {
        UspMsg::response(
            "m-1".into(),
            Response::OperateResp(OperateResp {
                operation_results: vec![OperationResult {
                    executed_command: command.into(),
                    operation_resp: op,
                }],
            }),
        )
    }

    #[test]
    fn operate_response_cases() {
        // Async started
        let resp = operate_resp(
            "Device.X.Run()",
            OperationResp::ReqObjPath("Device.LocalAgent.Request.3.".into()),
        );
        assert_eq!(
            process_operate_response(&resp, "Device.X.Run()", false).unwrap(),
            OperateOutcome::Started
        );
        // Sync getting a request path is a violation
        assert!(process_operate_response(&resp, "Device.X.Run()", true).is_err());

        // Immediate completion with output args
        let resp = operate_resp(
            "Device.X.Run()",
            OperationResp::OutputArgs(vec![ResultParamsEntry {
                key: "Result".into(),
                value: "ok".into(),
            }]),
        );
        match process_operate_response(&resp, "Device.X.Run()", false).unwrap() {
            OperateOutcome::Complete(args) => assert_eq!(args[0].key, "Result"),
            other => panic!("unexpected outcome {:?}", other),
        }

        // Embedded command failure
        let resp = operate_resp(
            "Device.X.Run()",
            OperationResp::CommandFailure {
                err_code: 7022,
                err_msg: "broke".into(),
            },
        );
        let failure = process_operate_response(&resp, "Device.X.Run()", true).unwrap_err();
        assert_eq!(failure.err, UspError::CommandFailure);

        // Wrong command echoed back
        let resp = operate_resp("Device.X.Other()", OperationResp::OutputArgs(vec![]));
        assert!(process_operate_response(&resp, "Device.X.Run()", true).is_err());
    }
}
