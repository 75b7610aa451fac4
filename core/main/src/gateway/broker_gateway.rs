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

use usp_sdk::api::mtp::{MtpConn, MtpRole};
use usp_sdk::api::usp::{Body, Request, Response, UspMsg};
use usp_sdk::log::{debug, error, warn};
use usp_sdk::tokio;
use usp_sdk::tokio::sync::mpsc::{self, Receiver, Sender};

use crate::broker::passthrough_router::attempt_passthru;
use crate::broker::schema_importer::handle_get_supported_dm_resp;
use crate::processor::notify_processor::handle_notification;
use crate::processor::register_processor::{handle_deregister, handle_register};
use crate::processor::request_executor::{
    handle_add, handle_delete, handle_get, handle_operate, handle_set,
    send_message_not_understood,
};
use crate::state::permission_state::CombinedRole;
use crate::state::platform_state::PlatformState;
use crate::state::service_registry::{handle_service_connected, handle_service_disconnect};

/// Everything the MTP layer feeds into the Broker core.
#[derive(Debug)]
pub enum GatewayCommand {
    HandleMessage {
        msg: UspMsg,
        endpoint_id: String,
        mtpc: MtpConn,
        role: CombinedRole,
    },
    ServiceConnected {
        endpoint_id: String,
        mtpc: MtpConn,
    },
    ServiceDisconnected {
        endpoint_id: String,
        role: MtpRole,
    },
}

/// Front door of the Broker: owns the command queue and dispatches every
/// inbound message. Responses awaited by an in-flight round-trip complete
/// on the loop itself; everything else runs in its own task so a blocked
/// round-trip never stalls the queue.
pub struct BrokerGateway {
    state: PlatformState,
    rx: Receiver<GatewayCommand>,
}

impl BrokerGateway {
    pub fn new(state: PlatformState) -> (BrokerGateway, Sender<GatewayCommand>) {
        let (tx, rx) = mpsc::channel(64);
        (BrokerGateway { state, rx }, tx)
    }

    pub async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                GatewayCommand::ServiceConnected { endpoint_id, mtpc } => {
                    if let Err(e) = handle_service_connected(&self.state, &endpoint_id, &mtpc) {
                        error!("Failed to admit USP Service {}: {}", endpoint_id, e);
                    }
                }
                GatewayCommand::ServiceDisconnected { endpoint_id, role } => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        handle_service_disconnect(&state, &endpoint_id, role).await;
                    });
                }
                GatewayCommand::HandleMessage {
                    msg,
                    endpoint_id,
                    mtpc,
                    role,
                } => {
                    // Typed waiters are completed synchronously so their
                    // round-trips finish in submission order
                    if msg.is_response_or_error() && self.state.mtp.try_complete(&msg) {
                        continue;
                    }
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        dispatch_message(&state, msg, &endpoint_id, &mtpc, &role).await;
                    });
                }
            }
        }
    }
}

pub async fn dispatch_message(
    state: &PlatformState,
    msg: UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) {
    debug!("{} from {}", msg.msg_type(), endpoint_id);

    if msg.is_response_or_error() {
        if attempt_passthru(state, &msg, endpoint_id, mtpc, role).await {
            return;
        }
        if matches!(msg.body, Body::Response(Response::GetSupportedDmResp(_))) {
            handle_get_supported_dm_resp(state, &msg, endpoint_id).await;
            return;
        }
        warn!(
            "Ignoring unexpected {} from {}",
            msg.msg_type(),
            endpoint_id
        );
        return;
    }

    let Body::Request(request) = &msg.body else {
        unreachable!();
    };

    match request {
        Request::Register(_) => handle_register(state, &msg, endpoint_id, mtpc).await,
        Request::Deregister(_) => handle_deregister(state, &msg, endpoint_id, mtpc).await,
        Request::Notify(_) => {
            if !attempt_passthru(state, &msg, endpoint_id, mtpc, role).await {
                handle_notification(state, &msg, endpoint_id, mtpc).await;
            }
        }
        Request::Get(_) | Request::Set(_) | Request::Add(_) | Request::Delete(_) => {
            if !attempt_passthru(state, &msg, endpoint_id, mtpc, role).await {
                match request {
                    Request::Get(_) => handle_get(state, &msg, endpoint_id, mtpc, role).await,
                    Request::Set(_) => handle_set(state, &msg, endpoint_id, mtpc, role).await,
                    Request::Add(_) => handle_add(state, &msg, endpoint_id, mtpc, role).await,
                    Request::Delete(_) => handle_delete(state, &msg, endpoint_id, mtpc, role).await,
                    _ => unreachable!(),
                }
            }
        }
        Request::Operate(_) => handle_operate(state, &msg, endpoint_id, mtpc, role).await,
        Request::GetInstances(_) | Request::GetSupportedDm(_) => {
            send_message_not_understood(
                mtpc,
                endpoint_id,
                msg.msg_id(),
                "Request kind not served by this agent",
            )
            .await;
        }
    }

    // The instance cache only outlives the message that filled it
    state.schema.write(|tree| tree.clear_instance_cache());
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::mtp::MtpProtocol;
    use usp_sdk::api::usp::{
        Add, CreateObject, CreateParamSetting, Get, Notification, Notify, Operate,
        OperationCompleteResp, OperationResp, Register, RegistrationPath,
    };
    use usp_sdk::utils::error::UspError;

    use crate::broker::test::mock_service::MockService;
    use crate::state::permission_state::FULL_ACCESS_ROLE;
    use crate::state::subscription_state::SUBS_TABLE;

    struct Harness {
        state: PlatformState,
        tx: Sender<GatewayCommand>,
        ctrl: MtpConn,
        ctrl_rx: usp_sdk::tokio::sync::mpsc::Receiver<usp_sdk::api::mtp::MtpSendItem>,
    }

    async fn harness() -> Harness {
        let state = PlatformState::default();
        let (gateway, tx) = BrokerGateway::new(state.clone());
        tokio::spawn(gateway.run());
        let (ctrl, ctrl_rx) = MtpConn::channel(MtpProtocol::Channel, None, 32);
        Harness {
            state,
            tx,
            ctrl,
            ctrl_rx,
        }
    }

    impl Harness {
        async fn from_controller(&self, msg: UspMsg) {
            self.tx
                .send(GatewayCommand::HandleMessage {
                    msg,
                    endpoint_id: "controller".into(),
                    mtpc: self.ctrl.clone(),
                    role: CombinedRole::new(FULL_ACCESS_ROLE),
                })
                .await
                .unwrap();
        }

        async fn controller_recv(&mut self) -> UspMsg {
            usp_sdk::tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.ctrl_rx.recv(),
            )
            .await
            .expect("timed out waiting for controller message")
            .expect("controller channel closed")
            .msg
        }
    }

    async fn register_mock(harness: &Harness) -> MockService {
        let mock = MockService::spawn("svc-test", harness.tx.clone());
        let register = UspMsg::request(
            "reg-1".into(),
            Request::Register(Register {
                allow_partial: false,
                reg_paths: vec![RegistrationPath {
                    path: "Device.Test.".into(),
                }],
            }),
        );
        mock.send_to_broker(register).await;
        // Wait until the discovered schema (including the async command)
        // has been imported
        for _ in 0..100 {
            if harness
                .state
                .schema
                .node_snapshot("Device.Test.Run()")
                .is_some()
            {
                break;
            }
            usp_sdk::tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(harness.state.schema.exists_in_schema("Device.Test."));
        mock
    }

    #[tokio::test]
    async fn register_and_resolve_get_through_the_service() {
        let mut harness = harness().await;
        let _mock = register_mock(&harness).await;

        // Absolute parameter resolves through the owning Service
        harness
            .from_controller(UspMsg::request(
                "g-1".into(),
                Request::Get(Get {
                    param_paths: vec!["Device.Test.Value".into()],
                    max_depth: 0,
                }),
            ))
            .await;
        let resp = harness.controller_recv().await;
        assert_eq!(resp.msg_id(), "g-1");
        let Body::Response(Response::GetResp(get_resp)) = &resp.body else {
            panic!("expected GetResp, got {:?}", resp.body);
        };
        assert_eq!(get_resp.req_path_results[0].err_code, 0);
        assert_eq!(
            get_resp.req_path_results[0].resolved_path_results[0].result_params[0].value,
            "test-value"
        );
    }

    #[tokio::test]
    async fn partial_get_refreshes_instances_from_the_service() {
        let mut harness = harness().await;
        let _mock = register_mock(&harness).await;

        // Mixed-group request declines passthrough; the normal handler
        // expands the table through GetInstances
        harness
            .from_controller(UspMsg::request(
                "g-2".into(),
                Request::Get(Get {
                    param_paths: vec![
                        "Device.Test.Item.".into(),
                        "Device.USPServices.USPServiceNumberOfEntries".into(),
                    ],
                    max_depth: 0,
                }),
            ))
            .await;
        let resp = harness.controller_recv().await;
        let Body::Response(Response::GetResp(get_resp)) = &resp.body else {
            panic!("expected GetResp, got {:?}", resp.body);
        };
        let table = &get_resp.req_path_results[0];
        assert_eq!(table.err_code, 0);
        assert_eq!(table.resolved_path_results[0].resolved_path, "Device.Test.Item.1.");
        assert_eq!(get_resp.req_path_results[1].resolved_path_results[0].result_params[0].value, "1");
    }

    async fn subscribe_operation_complete(harness: &mut Harness) -> u32 {
        harness
            .from_controller(UspMsg::request(
                "a-sub".into(),
                Request::Add(Add {
                    allow_partial: false,
                    create_objs: vec![CreateObject {
                        obj_path: SUBS_TABLE.into(),
                        param_settings: vec![
                            CreateParamSetting {
                                param: "NotifType".into(),
                                value: "OperationComplete".into(),
                                required: true,
                            },
                            CreateParamSetting {
                                param: "ReferenceList".into(),
                                value: "Device.Test.Run()".into(),
                                required: true,
                            },
                            CreateParamSetting {
                                param: "ID".into(),
                                value: "ctl-op-sub".into(),
                                required: true,
                            },
                            CreateParamSetting {
                                param: "Enable".into(),
                                value: "true".into(),
                                required: true,
                            },
                        ],
                    }],
                }),
            ))
            .await;
        let resp = harness.controller_recv().await;
        let Body::Response(Response::AddResp(_)) = &resp.body else {
            panic!("expected AddResp, got {:?}", resp.body);
        };
        let rows = harness.state.subscriptions.rows();
        assert_eq!(rows.len(), 1);
        rows[0].instance
    }

    #[tokio::test]
    async fn async_operate_happy_path() {
        let mut harness = harness().await;
        let mock = register_mock(&harness).await;
        let _sub = subscribe_operation_complete(&mut harness).await;

        // The vendor-layer subscription reached the mock Service
        for _ in 0..100 {
            if !mock.subscription_ids().is_empty() {
                break;
            }
            usp_sdk::tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let service_sub_id = mock.subscription_ids().pop().expect("no service-side sub");
        assert!(service_sub_id.contains("BROKER"));

        harness
            .from_controller(UspMsg::request(
                "op-1".into(),
                Request::Operate(Operate {
                    command: "Device.Test.Run()".into(),
                    command_key: "K1".into(),
                    send_resp: true,
                    input_args: vec![],
                }),
            ))
            .await;
        let resp = harness.controller_recv().await;
        let Body::Response(Response::OperateResp(op_resp)) = &resp.body else {
            panic!("expected OperateResp, got {:?}", resp.body);
        };
        let OperationResp::ReqObjPath(req_path) = &op_resp.operation_results[0].operation_resp
        else {
            panic!("expected ReqObjPath");
        };
        assert!(req_path.starts_with("Device.LocalAgent.Request."));
        assert_eq!(harness.state.requests.rows().len(), 1);

        // Completion notification flows back to the controller and clears
        // the request bookkeeping
        mock.send_to_broker(UspMsg::request(
            "svc-n1".into(),
            Request::Notify(Notify {
                subscription_id: service_sub_id,
                send_resp: false,
                notification: Notification::OperationComplete {
                    obj_path: "Device.Test.".into(),
                    command_name: "Run()".into(),
                    command_key: "K1".into(),
                    operation_resp: OperationCompleteResp::OutputArgs(vec![]),
                },
            }),
        ))
        .await;

        let notify = harness.controller_recv().await;
        let Body::Request(Request::Notify(n)) = &notify.body else {
            panic!("expected Notify, got {:?}", notify.body);
        };
        assert_eq!(n.subscription_id, "ctl-op-sub");
        for _ in 0..100 {
            if harness.state.requests.rows().is_empty() {
                break;
            }
            usp_sdk::tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(harness.state.requests.rows().is_empty());
        assert!(harness
            .state
            .services
            .with_service("svc-test", |s| s.req_map.is_empty())
            .unwrap());
    }

    #[tokio::test]
    async fn service_crash_fails_commands_in_progress() {
        let mut harness = harness().await;
        let mock = register_mock(&harness).await;
        let _sub = subscribe_operation_complete(&mut harness).await;
        for _ in 0..100 {
            if !mock.subscription_ids().is_empty() {
                break;
            }
            usp_sdk::tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        harness
            .from_controller(UspMsg::request(
                "op-2".into(),
                Request::Operate(Operate {
                    command: "Device.Test.Run()".into(),
                    command_key: "K9".into(),
                    send_resp: true,
                    input_args: vec![],
                }),
            ))
            .await;
        let _op_resp = harness.controller_recv().await;

        // Controller-side transport loss fails the in-flight command
        harness
            .tx
            .send(GatewayCommand::ServiceDisconnected {
                endpoint_id: "svc-test".into(),
                role: MtpRole::BrokersController,
            })
            .await
            .unwrap();

        let notify = harness.controller_recv().await;
        let Body::Request(Request::Notify(n)) = &notify.body else {
            panic!("expected Notify, got {:?}", notify.body);
        };
        let Notification::OperationComplete { operation_resp, .. } = &n.notification else {
            panic!("expected OperationComplete");
        };
        let OperationCompleteResp::CommandFailure { err_code, .. } = operation_resp else {
            panic!("expected CommandFailure");
        };
        assert_eq!(*err_code, UspError::CommandFailure.to_wire_code());

        // Correlation state is empty and the schema subtree is gone
        assert!(harness.state.requests.rows().is_empty());
        let maps_empty = harness
            .state
            .services
            .with_service("svc-test", |s| {
                s.subs_map.is_empty() && s.req_map.is_empty() && s.msg_map.is_empty()
            })
            .unwrap();
        assert!(maps_empty);
        assert!(!harness.state.schema.exists_in_schema("Device.Test."));
    }
}
