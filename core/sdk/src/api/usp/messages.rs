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

/// A parsed USP message. The MTP layer delivers these to the gateway with
/// the USP Record envelope already stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UspMsg {
    pub header: Header,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: MsgType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Error,
    Get,
    GetResp,
    Set,
    SetResp,
    Add,
    AddResp,
    Delete,
    DeleteResp,
    Operate,
    OperateResp,
    GetInstances,
    GetInstancesResp,
    GetSupportedDm,
    GetSupportedDmResp,
    Notify,
    Register,
    RegisterResp,
    Deregister,
    DeregisterResp,
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Response(Response),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub err_code: u32,
    pub err_msg: String,
    pub param_errs: Vec<ParamError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamError {
    pub param_path: String,
    pub err_code: u32,
    pub err_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get(Get),
    Set(Set),
    Add(Add),
    Delete(Delete),
    Operate(Operate),
    GetInstances(GetInstances),
    GetSupportedDm(GetSupportedDm),
    Register(Register),
    Deregister(Deregister),
    Notify(Notify),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    GetResp(GetResp),
    SetResp(SetResp),
    AddResp(AddResp),
    DeleteResp(DeleteResp),
    OperateResp(OperateResp),
    GetInstancesResp(GetInstancesResp),
    GetSupportedDmResp(GetSupportedDmResp),
    RegisterResp(RegisterResp),
    DeregisterResp(DeregisterResp),
}

// ---------------------------------------------------------------------------
// Get

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Get {
    pub param_paths: Vec<String>,
    pub max_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GetResp {
    pub req_path_results: Vec<RequestedPathResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedPathResult {
    pub requested_path: String,
    pub err_code: u32,
    pub err_msg: String,
    pub resolved_path_results: Vec<ResolvedPathResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPathResult {
    pub resolved_path: String,
    pub result_params: Vec<ResultParamsEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultParamsEntry {
    pub key: String,
    pub value: String,
}

impl ResolvedPathResult {
    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.result_params
            .iter()
            .find(|e| e.key == name)
            .map(|e| e.value.as_str())
    }
}

// ---------------------------------------------------------------------------
// Set

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Set {
    pub allow_partial: bool,
    pub update_objs: Vec<UpdateObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateObject {
    pub obj_path: String,
    pub param_settings: Vec<UpdateParamSetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateParamSetting {
    pub param: String,
    pub value: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SetResp {
    pub updated_obj_results: Vec<UpdatedObjectResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedObjectResult {
    pub requested_path: String,
    pub oper_status: SetOperationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetOperationStatus {
    Failure {
        err_code: u32,
        err_msg: String,
        updated_inst_failures: Vec<ParamError>,
    },
    Success {
        updated_inst_results: Vec<UpdatedInstanceResult>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedInstanceResult {
    pub affected_path: String,
    pub updated_params: Vec<ResultParamsEntry>,
    pub param_errs: Vec<ParamError>,
}

// ---------------------------------------------------------------------------
// Add

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Add {
    pub allow_partial: bool,
    pub create_objs: Vec<CreateObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateObject {
    pub obj_path: String,
    pub param_settings: Vec<CreateParamSetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParamSetting {
    pub param: String,
    pub value: String,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AddResp {
    pub created_obj_results: Vec<CreatedObjectResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedObjectResult {
    pub requested_path: String,
    pub oper_status: AddOperationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AddOperationStatus {
    Failure {
        err_code: u32,
        err_msg: String,
    },
    Success {
        instantiated_path: String,
        unique_keys: Vec<ResultParamsEntry>,
        param_errs: Vec<ParamError>,
    },
}

// ---------------------------------------------------------------------------
// Delete

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub allow_partial: bool,
    pub obj_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeleteResp {
    pub deleted_obj_results: Vec<DeletedObjectResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedObjectResult {
    pub requested_path: String,
    pub oper_status: DeleteOperationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeleteOperationStatus {
    Failure {
        err_code: u32,
        err_msg: String,
    },
    Success {
        affected_paths: Vec<String>,
        unaffected_path_errs: Vec<ParamError>,
    },
}

// ---------------------------------------------------------------------------
// Operate

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operate {
    pub command: String,
    pub command_key: String,
    pub send_resp: bool,
    pub input_args: Vec<ResultParamsEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OperateResp {
    pub operation_results: Vec<OperationResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub executed_command: String,
    pub operation_resp: OperationResp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationResp {
    ReqObjPath(String),
    OutputArgs(Vec<ResultParamsEntry>),
    CommandFailure { err_code: u32, err_msg: String },
}

// ---------------------------------------------------------------------------
// GetInstances

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetInstances {
    pub obj_paths: Vec<String>,
    pub first_level_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GetInstancesResp {
    pub req_path_results: Vec<GetInstancesPathResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetInstancesPathResult {
    pub requested_path: String,
    pub err_code: u32,
    pub err_msg: String,
    pub curr_insts: Vec<CurrInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrInstance {
    pub instantiated_obj_path: String,
    pub unique_keys: Vec<ResultParamsEntry>,
}

// ---------------------------------------------------------------------------
// GetSupportedDm

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSupportedDm {
    pub obj_paths: Vec<String>,
    pub first_level_only: bool,
    pub return_commands: bool,
    pub return_events: bool,
    pub return_params: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GetSupportedDmResp {
    pub req_obj_results: Vec<RequestedObjectResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedObjectResult {
    pub req_obj_path: String,
    pub err_code: u32,
    pub err_msg: String,
    pub supported_objs: Vec<SupportedObjectResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedObjectResult {
    pub supported_obj_path: String,
    pub access: ObjAccessType,
    pub is_multi_instance: bool,
    pub supported_params: Vec<SupportedParamResult>,
    pub supported_events: Vec<SupportedEventResult>,
    pub supported_commands: Vec<SupportedCommandResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ObjAccessType {
    ReadOnly,
    AddDelete,
    AddOnly,
    DeleteOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedParamResult {
    pub param_name: String,
    pub access: ParamAccessType,
    pub value_type: ParamValueType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamAccessType {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValueType {
    Unknown,
    Base64,
    Boolean,
    DateTime,
    Decimal,
    HexBinary,
    Int,
    Long,
    String,
    UnsignedInt,
    UnsignedLong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedEventResult {
    pub event_name: String,
    pub arg_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedCommandResult {
    pub command_name: String,
    pub command_type: CommandType,
    pub input_arg_names: Vec<String>,
    pub output_arg_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    Sync,
    Async,
}

// ---------------------------------------------------------------------------
// Register / Deregister

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub allow_partial: bool,
    pub reg_paths: Vec<RegistrationPath>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPath {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegisterResp {
    pub registered_path_results: Vec<RegisteredPathResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPathResult {
    pub requested_path: String,
    pub oper_status: RegisterOperationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegisterOperationStatus {
    Failure { err_code: u32, err_msg: String },
    Success { registered_path: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deregister {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeregisterResp {
    pub deregistered_path_results: Vec<DeregisteredPathResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeregisteredPathResult {
    pub requested_path: String,
    pub oper_status: DeregisterOperationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeregisterOperationStatus {
    Failure { err_code: u32, err_msg: String },
    Success { deregistered_path: Vec<String> },
}

// ---------------------------------------------------------------------------
// Notify

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notify {
    pub subscription_id: String,
    pub send_resp: bool,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    ValueChange {
        param_path: String,
        param_value: String,
    },
    Event {
        obj_path: String,
        event_name: String,
        params: Vec<ResultParamsEntry>,
    },
    ObjectCreation {
        obj_path: String,
        unique_keys: Vec<ResultParamsEntry>,
    },
    ObjectDeletion {
        obj_path: String,
    },
    OperationComplete {
        obj_path: String,
        command_name: String,
        command_key: String,
        operation_resp: OperationCompleteResp,
    },
    OnBoardRequest {
        oui: String,
        product_class: String,
        serial_number: String,
        agent_supported_protocol_versions: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationCompleteResp {
    OutputArgs(Vec<ResultParamsEntry>),
    CommandFailure { err_code: u32, err_msg: String },
}

// ---------------------------------------------------------------------------

impl Request {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Request::Get(_) => MsgType::Get,
            Request::Set(_) => MsgType::Set,
            Request::Add(_) => MsgType::Add,
            Request::Delete(_) => MsgType::Delete,
            Request::Operate(_) => MsgType::Operate,
            Request::GetInstances(_) => MsgType::GetInstances,
            Request::GetSupportedDm(_) => MsgType::GetSupportedDm,
            Request::Register(_) => MsgType::Register,
            Request::Deregister(_) => MsgType::Deregister,
            Request::Notify(_) => MsgType::Notify,
        }
    }
}

impl Response {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Response::GetResp(_) => MsgType::GetResp,
            Response::SetResp(_) => MsgType::SetResp,
            Response::AddResp(_) => MsgType::AddResp,
            Response::DeleteResp(_) => MsgType::DeleteResp,
            Response::OperateResp(_) => MsgType::OperateResp,
            Response::GetInstancesResp(_) => MsgType::GetInstancesResp,
            Response::GetSupportedDmResp(_) => MsgType::GetSupportedDmResp,
            Response::RegisterResp(_) => MsgType::RegisterResp,
            Response::DeregisterResp(_) => MsgType::DeregisterResp,
        }
    }
}

impl UspMsg {
    pub fn request(msg_id: String, request: Request) -> UspMsg {
        let msg_type = request.msg_type();
        UspMsg {
            header: Header { msg_id, msg_type },
            body: Body::Request(request),
        }
    }

    pub fn response(msg_id: String, response: Response) -> UspMsg {
        let msg_type = response.msg_type();
        UspMsg {
            header: Header { msg_id, msg_type },
            body: Body::Response(response),
        }
    }

    pub fn error(msg_id: String, err: &UspError, err_msg: impl Into<String>) -> UspMsg {
        UspMsg {
            header: Header {
                msg_id,
                msg_type: MsgType::Error,
            },
            body: Body::Error(ErrorBody {
                err_code: err.to_wire_code(),
                err_msg: err_msg.into(),
                param_errs: Vec::new(),
            }),
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, Body::Request(_))
    }

    pub fn is_response_or_error(&self) -> bool {
        matches!(self.body, Body::Response(_) | Body::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_follows_body() {
        let msg = UspMsg::request(
            "m-1".into(),
            Request::Get(Get {
                param_paths: vec!["Device.Test.Value".into()],
                max_depth: 0,
            }),
        );
        assert_eq!(msg.msg_type(), MsgType::Get);
        assert!(msg.is_request());

        let msg = UspMsg::response("m-1".into(), Response::GetResp(GetResp::default()));
        assert_eq!(msg.msg_type(), MsgType::GetResp);
        assert!(msg.is_response_or_error());
    }

    #[test]
    fn serde_round_trip_preserves_variant() {
        let msg = UspMsg::request(
            "m-2".into(),
            Request::Notify(Notify {
                subscription_id: "1-2-BROKER".into(),
                send_resp: false,
                notification: Notification::OperationComplete {
                    obj_path: "Device.Test.".into(),
                    command_name: "Reset()".into(),
                    command_key: "key1".into(),
                    operation_resp: OperationCompleteResp::OutputArgs(vec![]),
                },
            }),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: UspMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
