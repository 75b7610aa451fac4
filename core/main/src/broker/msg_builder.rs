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
    Add, CreateObject, CreateParamSetting, Delete, DeregisterOperationStatus, DeregisterResp,
    DeregisteredPathResult, Get, GetInstances, GetSupportedDm, Operate, RegisterOperationStatus,
    RegisterResp, RegisteredPathResult, Request, ResultParamsEntry, Set, UpdateObject,
    UpdateParamSetting, UspMsg,
};
use usp_sdk::utils::error::UspError;

/// Child parameter of a grouped object-creation, carrying back any
/// per-parameter error the Service reported.
#[derive(Debug, Clone)]
pub struct GroupAddParam {
    pub name: String,
    pub value: String,
    pub required: bool,
    pub err_code: u32,
    pub err_msg: String,
}

impl GroupAddParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>, required: bool) -> GroupAddParam {
        GroupAddParam {
            name: name.into(),
            value: value.into(),
            required,
            err_code: 0,
            err_msg: String::new(),
        }
    }
}

pub fn create_get_req(msg_id: String, paths: &[String]) -> UspMsg {
    UspMsg::request(
        msg_id,
        Request::Get(Get {
            param_paths: paths.to_vec(),
            max_depth: 0,
        }),
    )
}

/// Builds a Set with allow_partial=false, grouping the full parameter
/// paths by their parent object.
pub fn create_set_req(msg_id: String, params: &[(String, String)]) -> UspMsg {
    let mut update_objs: Vec<UpdateObject> = Vec::new();
    for (path, value) in params {
        let (obj_path, param) = match path.rfind('.') {
            Some(idx) => (&path[..=idx], &path[idx + 1..]),
            None => ("", path.as_str()),
        };
        let setting = UpdateParamSetting {
            param: param.to_string(),
            value: value.clone(),
            required: true,
        };
        match update_objs.iter_mut().find(|o| o.obj_path == obj_path) {
            Some(obj) => obj.param_settings.push(setting),
            None => update_objs.push(UpdateObject {
                obj_path: obj_path.to_string(),
                param_settings: vec![setting],
            }),
        }
    }
    UspMsg::request(
        msg_id,
        Request::Set(Set {
            allow_partial: false,
            update_objs,
        }),
    )
}

pub fn create_add_req(msg_id: String, obj_path: &str, params: &[GroupAddParam]) -> UspMsg {
    UspMsg::request(
        msg_id,
        Request::Add(Add {
            allow_partial: false,
            create_objs: vec![CreateObject {
                obj_path: obj_path.to_string(),
                param_settings: params
                    .iter()
                    .map(|p| CreateParamSetting {
                        param: p.name.clone(),
                        value: p.value.clone(),
                        required: p.required,
                    })
                    .collect(),
            }],
        }),
    )
}

pub fn create_delete_req(msg_id: String, paths: &[String], allow_partial: bool) -> UspMsg {
    UspMsg::request(
        msg_id,
        Request::Delete(Delete {
            allow_partial,
            obj_paths: paths.to_vec(),
        }),
    )
}

pub fn create_operate_req(
    msg_id: String,
    path: &str,
    command_key: &str,
    input_args: &[(String, String)],
) -> UspMsg {
    UspMsg::request(
        msg_id,
        Request::Operate(Operate {
            command: path.to_string(),
            command_key: command_key.to_string(),
            send_resp: true,
            input_args: input_args
                .iter()
                .map(|(k, v)| ResultParamsEntry {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect(),
        }),
    )
}

pub fn create_get_instances_req(msg_id: String, paths: &[String]) -> UspMsg {
    UspMsg::request(
        msg_id,
        Request::GetInstances(GetInstances {
            obj_paths: paths.to_vec(),
            first_level_only: false,
        }),
    )
}

pub fn create_get_supported_dm_req(msg_id: String, paths: &[String]) -> UspMsg {
    UspMsg::request(
        msg_id,
        Request::GetSupportedDm(GetSupportedDm {
            obj_paths: paths.to_vec(),
            first_level_only: false,
            return_commands: true,
            return_events: true,
            return_params: true,
        }),
    )
}

// ------------------------------------------------------------------
// Register / Deregister response construction

pub fn add_register_resp_result(
    resp: &mut RegisterResp,
    requested_path: &str,
    result: Result<(), (UspError, String)>,
) {
    let oper_status = match result {
        Ok(()) => RegisterOperationStatus::Success {
            registered_path: requested_path.to_string(),
        },
        Err((err, err_msg)) => RegisterOperationStatus::Failure {
            err_code: err.to_wire_code(),
            err_msg,
        },
    };
    resp.registered_path_results.push(RegisteredPathResult {
        requested_path: requested_path.to_string(),
        oper_status,
    });
}

pub fn add_deregister_resp_result(
    resp: &mut DeregisterResp,
    requested_path: &str,
    path: &str,
    result: Result<(), (UspError, String)>,
) {
    let oper_status = match result {
        Ok(()) => DeregisterOperationStatus::Success {
            deregistered_path: vec![path.to_string()],
        },
        Err((err, err_msg)) => DeregisterOperationStatus::Failure {
            err_code: err.to_wire_code(),
            err_msg,
        },
    };
    resp.deregistered_path_results.push(DeregisteredPathResult {
        requested_path: requested_path.to_string(),
        oper_status,
    });
}

/// Grows the success entry produced for a "deregister everything" request.
pub fn add_deregister_success_path(result: &mut DeregisteredPathResult, path: &str) {
    if let DeregisterOperationStatus::Success { deregistered_path } = &mut result.oper_status {
        deregistered_path.push(path.to_string());
    }
}

pub fn remove_last_deregister_result(resp: &mut DeregisterResp) {
    resp.deregistered_path_results.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::usp::Body;

    #[test]
    fn set_request_groups_params_by_object() {
        let msg = create_set_req(
            "m-1".into(),
            &[
                ("Device.X.Z.1.Name".into(), "a".into()),
                ("Device.X.Z.1.Alias".into(), "b".into()),
                ("Device.X.Other".into(), "c".into()),
            ],
        );
        let Body::Request(Request::Set(set)) = &msg.body else {
            panic!("not a set request");
        };
        assert!(!set.allow_partial);
        assert_eq!(set.update_objs.len(), 2);
        assert_eq!(set.update_objs[0].obj_path, "Device.X.Z.1.");
        assert_eq!(set.update_objs[0].param_settings.len(), 2);
        assert_eq!(set.update_objs[1].obj_path, "Device.X.");
    }

    #[test]
    fn gsdm_request_asks_for_everything() {
        let msg = create_get_supported_dm_req("m-2".into(), &["Device.X.".to_string()]);
        let Body::Request(Request::GetSupportedDm(gsdm)) = &msg.body else {
            panic!("not a gsdm request");
        };
        assert!(gsdm.return_commands && gsdm.return_events && gsdm.return_params);
        assert!(!gsdm.first_level_only);
    }

    #[test]
    fn operate_request_wants_a_response() {
        let msg = create_operate_req("m-3".into(), "Device.X.Run()", "K1", &[]);
        let Body::Request(Request::Operate(op)) = &msg.body else {
            panic!("not an operate request");
        };
        assert!(op.send_resp);
        assert_eq!(op.command, "Device.X.Run()");
    }

    #[test]
    fn deregister_all_success_entry_grows() {
        let mut resp = DeregisterResp::default();
        add_deregister_resp_result(&mut resp, "", "Device.A.", Ok(()));
        add_deregister_success_path(&mut resp.deregistered_path_results[0], "Device.B.");
        let DeregisterOperationStatus::Success { deregistered_path } =
            &resp.deregistered_path_results[0].oper_status
        else {
            panic!("expected success");
        };
        assert_eq!(deregistered_path.len(), 2);
    }
}
