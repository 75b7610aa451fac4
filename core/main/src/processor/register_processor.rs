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
use usp_sdk::api::usp::{
    Body, DeregisterResp, RegisterResp, Request, Response, UspMsg,
};
use usp_sdk::log::{error, info, warn};
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::path_utils::{is_child_of, validate_register_path};

use crate::broker::msg_builder::{
    add_deregister_resp_result, add_deregister_success_path, add_register_resp_result,
    create_get_supported_dm_req, remove_last_deregister_result,
};
use crate::broker::operation_adapter::group_unsubscribe;
use crate::state::platform_state::PlatformState;
use crate::state::request_state::signal_operation_complete;
use crate::state::service_registry::handle_service_connected;

/// Handles a USP Register message from a Service. Path conflicts honour
/// allow_partial; a Service that already owns any prefix is refused
/// outright (single-registration policy).
pub async fn handle_register(state: &PlatformState, msg: &UspMsg, endpoint_id: &str, mtpc: &MtpConn) {
    let msg_id = msg.msg_id().to_string();

    let Body::Request(Request::Register(reg)) = &msg.body else {
        send_error(mtpc, endpoint_id, &msg_id, UspError::MessageNotUnderstood,
            "Incoming message is invalid or inconsistent").await;
        return;
    };

    if reg.reg_paths.is_empty() {
        send_error(mtpc, endpoint_id, &msg_id, UspError::RegisterFailure,
            "No paths in register message").await;
        return;
    }

    let already_registered = state
        .services
        .with_service(endpoint_id, |s| !s.registered_paths.is_empty())
        .unwrap_or(false);
    if already_registered {
        send_error(mtpc, endpoint_id, &msg_id, UspError::RegisterFailure,
            "USP Service already registered. Multiple registration messages not supported").await;
        return;
    }

    if handle_service_connected(state, endpoint_id, mtpc).is_err() {
        send_error(mtpc, endpoint_id, &msg_id, UspError::RegisterFailure,
            "Unable to register any more USP services").await;
        return;
    }

    let mut resp = RegisterResp::default();
    let mut accepted = false;
    for rp in &reg.reg_paths {
        let result = register_usp_service_path(state, endpoint_id, &rp.path);
        if let Err((err, err_msg)) = &result {
            if !reg.allow_partial {
                // All-or-nothing: drop anything accepted so far
                state
                    .services
                    .with_service_mut(endpoint_id, |s| s.registered_paths.clear());
                send_error(mtpc, endpoint_id, &msg_id, err.clone(), err_msg).await;
                return;
            }
        } else {
            accepted = true;
        }
        add_register_resp_result(&mut resp, &rp.path, result);
    }

    let reply = UspMsg::response(msg_id, Response::RegisterResp(resp));
    if let Err(e) = mtpc.queue_message(endpoint_id, reply).await {
        error!("Failed to send RegisterResp to {}: {}", endpoint_id, e);
    }

    if accepted {
        queue_get_supported_dm(state, endpoint_id).await;
    }
}

/// Validates one requested prefix and claims it for the Service. The
/// prefix must be unclaimed by every Service (this one included) and by
/// the Broker's own schema.
fn register_usp_service_path(
    state: &PlatformState,
    endpoint_id: &str,
    requested_path: &str,
) -> Result<(), (UspError, String)> {
    let owner = state.services.snapshot().into_iter().find_map(|(ep, _, _)| {
        state
            .services
            .with_service(&ep, |s| s.registered_paths.contains(&requested_path.to_string()))
            .unwrap_or(false)
            .then_some(ep)
    });
    if let Some(owner) = owner {
        return Err((
            UspError::PathAlreadyRegistered,
            format!(
                "Requested path '{}' has already been registered by endpoint '{}'",
                requested_path, owner
            ),
        ));
    }

    validate_register_path(requested_path).map_err(|err| {
        (
            err,
            format!("Requested path '{}' is not a valid data model path", requested_path),
        )
    })?;

    if state.schema.exists_in_schema(requested_path) {
        return Err((
            UspError::PathAlreadyRegistered,
            format!(
                "Requested path '{}' already exists in the data model",
                requested_path
            ),
        ));
    }

    state
        .services
        .with_service_mut(endpoint_id, |s| {
            s.registered_paths.push(requested_path.to_string())
        })
        .ok_or((
            UspError::Internal,
            format!("Endpoint '{}' is not a USP Service", endpoint_id),
        ))?;
    Ok(())
}

/// Sends the GetSupportedDM discovery request and installs placeholder
/// schema nodes so no other Service can claim the accepted prefixes while
/// discovery is in flight.
pub async fn queue_get_supported_dm(state: &PlatformState, endpoint_id: &str) {
    let snapshot = state.services.with_service(endpoint_id, |s| {
        (
            s.registered_paths.clone(),
            s.controller_mtp.clone(),
            s.group_id,
        )
    });
    let Some((registered_paths, conn, group_id)) = snapshot else {
        return;
    };
    if registered_paths.is_empty() {
        return;
    }
    let Some(conn) = conn else {
        warn!("Unable to send to UspService={}. Connection dropped", endpoint_id);
        return;
    };

    let msg_id = state.mtp.next_msg_id();
    state
        .services
        .with_service_mut(endpoint_id, |s| s.gsdm_msg_id = Some(msg_id.clone()));
    let req = create_get_supported_dm_req(msg_id, &registered_paths);
    if let Err(e) = conn.queue_message(endpoint_id, req).await {
        error!("Failed to queue GSDM request to {}: {}", endpoint_id, e);
        return;
    }

    state.schema.write(|tree| {
        for path in &registered_paths {
            if let Err(e) = tree.add_placeholder_object(path, group_id) {
                error!(
                    "Requested path '{}' could not be registered into the data model: {}",
                    path, e
                );
            }
        }
    });
}

/// Handles a USP Deregister message. An empty path means "everything this
/// Service registered".
pub async fn handle_deregister(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
) {
    let msg_id = msg.msg_id().to_string();

    let Body::Request(Request::Deregister(dreg)) = &msg.body else {
        send_error(mtpc, endpoint_id, &msg_id, UspError::MessageNotUnderstood,
            "Incoming message is invalid or inconsistent").await;
        return;
    };

    let mut resp = DeregisterResp::default();

    let has_paths = state
        .services
        .with_service(endpoint_id, |s| !s.registered_paths.is_empty())
        .unwrap_or(false);
    if !has_paths {
        let err_msg = format!("Endpoint '{}' has not registered any paths", endpoint_id);
        for path in &dreg.paths {
            add_deregister_resp_result(
                &mut resp,
                path,
                path,
                Err((UspError::DeregisterFailure, err_msg.clone())),
            );
        }
    } else {
        for path in &dreg.paths {
            if path.is_empty() {
                deregister_all_paths(state, endpoint_id, &mut resp).await;
            } else if let Err(err) = validate_register_path(path) {
                add_deregister_resp_result(
                    &mut resp,
                    path,
                    path,
                    Err((
                        UspError::DeregisterFailure,
                        format!("Path '{}' is not a valid data model path: {}", path, err),
                    )),
                );
            } else {
                let result = deregister_usp_service_path(state, endpoint_id, path).await;
                add_deregister_resp_result(&mut resp, path, path, result);
            }
        }
    }

    let reply = UspMsg::response(msg_id, Response::DeregisterResp(resp));
    if let Err(e) = mtpc.queue_message(endpoint_id, reply).await {
        error!("Failed to send DeregisterResp to {}: {}", endpoint_id, e);
    }
}

/// Removes one owned prefix: descendant subscriptions are unwound, active
/// commands under it fail, then the schema subtree goes away.
async fn deregister_usp_service_path(
    state: &PlatformState,
    endpoint_id: &str,
    path: &str,
) -> Result<(), (UspError, String)> {
    let snapshot = state.services.with_service(endpoint_id, |s| {
        (
            s.group_id,
            s.registered_paths.contains(&path.to_string()),
            s.subs_map.entries().to_vec(),
            s.req_map.entries().to_vec(),
        )
    });
    let Some((group_id, owned, subs_entries, req_entries)) = snapshot else {
        return Err((
            UspError::DeregisterFailure,
            format!("Endpoint '{}' is not a USP Service", endpoint_id),
        ));
    };
    if !owned {
        return Err((
            UspError::DeregisterFailure,
            format!("Path never registered by endpoint_id={}", endpoint_id),
        ));
    }

    for entry in subs_entries.iter().filter(|e| is_child_of(&e.path, path)) {
        if let Err(err) =
            group_unsubscribe(state, entry.broker_instance, group_id, &entry.path).await
        {
            return Err((
                err,
                format!("Failed to remove subscription for '{}'", entry.path),
            ));
        }
        state
            .subscriptions
            .remove_vendor_binding(entry.broker_instance, &entry.path);
    }

    for entry in req_entries.iter().filter(|e| is_child_of(&e.path, path)) {
        let err_msg = format!(
            "USP Service {} deregistered {} whilst command was in progress",
            endpoint_id, path
        );
        state
            .services
            .with_service_mut(endpoint_id, |s| {
                s.req_map.remove(&entry.path, &entry.command_key)
            });
        signal_operation_complete(
            state,
            entry.request_instance,
            Some((UspError::CommandFailure, err_msg)),
            Vec::new(),
        )
        .await;
    }

    // Passthrough responses for this subtree still route back: the Service
    // answers them itself, possibly with an error

    state.schema.write(|tree| tree.remove_subtree(path));
    state.services.with_service_mut(endpoint_id, |s| {
        s.registered_paths.retain(|p| p != path)
    });
    info!("{} deregistered {}", endpoint_id, path);
    Ok(())
}

/// Deregisters every owned prefix, reporting all successes in one result
/// entry. The first failure replaces that entry with a failure report and
/// stops.
async fn deregister_all_paths(
    state: &PlatformState,
    endpoint_id: &str,
    resp: &mut DeregisterResp,
) {
    let mut success_added = false;
    loop {
        let next = state
            .services
            .with_service(endpoint_id, |s| s.registered_paths.first().cloned())
            .flatten();
        let Some(path) = next else {
            break;
        };

        match deregister_usp_service_path(state, endpoint_id, &path).await {
            Ok(()) => {
                if success_added {
                    let last = resp.deregistered_path_results.last_mut().unwrap();
                    add_deregister_success_path(last, &path);
                } else {
                    add_deregister_resp_result(resp, "", &path, Ok(()));
                    success_added = true;
                }
            }
            Err((err, err_msg)) => {
                if success_added {
                    remove_last_deregister_result(resp);
                }
                add_deregister_resp_result(
                    resp,
                    "",
                    &path,
                    Err((err, format!("Failed to deregister {} ({})", path, err_msg))),
                );
                return;
            }
        }
    }
}

async fn send_error(
    mtpc: &MtpConn,
    endpoint_id: &str,
    msg_id: &str,
    err: UspError,
    err_msg: &str,
) {
    let reply = UspMsg::error(msg_id.to_string(), &err, err_msg);
    if let Err(e) = mtpc.queue_message(endpoint_id, reply).await {
        error!("Failed to send USP Error to {}: {}", endpoint_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::mtp::MtpProtocol;
    use usp_sdk::api::usp::{Register, RegisterOperationStatus, RegistrationPath};

    fn register_msg(paths: &[&str], allow_partial: bool) -> UspMsg {
        UspMsg::request(
            "r-1".into(),
            Request::Register(Register {
                allow_partial,
                reg_paths: paths
                    .iter()
                    .map(|p| RegistrationPath { path: p.to_string() })
                    .collect(),
            }),
        )
    }

    async fn recv(
        rx: &mut usp_sdk::tokio::sync::mpsc::Receiver<usp_sdk::api::mtp::MtpSendItem>,
    ) -> UspMsg {
        rx.recv().await.unwrap().msg
    }

    #[tokio::test]
    async fn register_accepts_paths_and_queues_discovery() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);

        handle_register(&state, &register_msg(&["Device.X."], false), "svc-1", &conn).await;

        let resp = recv(&mut rx).await;
        let Body::Response(Response::RegisterResp(reg_resp)) = &resp.body else {
            panic!("expected RegisterResp, got {:?}", resp.body);
        };
        assert!(matches!(
            reg_resp.registered_path_results[0].oper_status,
            RegisterOperationStatus::Success { .. }
        ));

        // Discovery follows on the same connection
        let gsdm = recv(&mut rx).await;
        assert!(matches!(
            gsdm.body,
            Body::Request(Request::GetSupportedDm(_))
        ));
        let expected = state
            .services
            .with_service("svc-1", |s| s.gsdm_msg_id.clone())
            .flatten()
            .unwrap();
        assert_eq!(gsdm.msg_id(), expected);

        // Placeholder holds the prefix
        assert!(state.schema.exists_in_schema("Device.X."));
    }

    #[tokio::test]
    async fn conflicting_register_reports_path_already_registered() {
        let state = PlatformState::default();
        let (conn1, mut rx1) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(&state, &register_msg(&["Device.WiFi."], false), "svc-1", &conn1).await;
        let _ = recv(&mut rx1).await;
        let _ = recv(&mut rx1).await;

        let (conn2, mut rx2) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(&state, &register_msg(&["Device.WiFi."], true), "svc-2", &conn2).await;
        let resp = recv(&mut rx2).await;
        let Body::Response(Response::RegisterResp(reg_resp)) = &resp.body else {
            panic!("expected RegisterResp");
        };
        let RegisterOperationStatus::Failure { err_code, .. } =
            &reg_resp.registered_path_results[0].oper_status
        else {
            panic!("expected failure");
        };
        assert_eq!(*err_code, UspError::PathAlreadyRegistered.to_wire_code());
        assert!(state
            .services
            .with_service("svc-2", |s| s.registered_paths.is_empty())
            .unwrap());
    }

    #[tokio::test]
    async fn all_or_nothing_register_fails_whole_message() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(
            &state,
            &register_msg(&["Device.Good.", "Device.Bad"], false),
            "svc-1",
            &conn,
        )
        .await;

        let resp = recv(&mut rx).await;
        assert!(matches!(resp.body, Body::Error(_)));
        // Nothing was kept
        assert!(state
            .services
            .with_service("svc-1", |s| s.registered_paths.is_empty())
            .unwrap());
        assert!(!state.schema.exists_in_schema("Device.Good."));
    }

    #[tokio::test]
    async fn second_register_message_is_refused() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(&state, &register_msg(&["Device.X."], false), "svc-1", &conn).await;
        let _ = recv(&mut rx).await;
        let _ = recv(&mut rx).await;

        handle_register(&state, &register_msg(&["Device.Y."], false), "svc-1", &conn).await;
        let resp = recv(&mut rx).await;
        let Body::Error(err) = &resp.body else {
            panic!("expected Error");
        };
        assert_eq!(err.err_code, UspError::RegisterFailure.to_wire_code());
    }

    #[tokio::test]
    async fn internal_schema_cannot_be_claimed() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(
            &state,
            &register_msg(&["Device.USPServices."], true),
            "svc-1",
            &conn,
        )
        .await;
        let resp = recv(&mut rx).await;
        let Body::Response(Response::RegisterResp(reg_resp)) = &resp.body else {
            panic!("expected RegisterResp");
        };
        assert!(matches!(
            reg_resp.registered_path_results[0].oper_status,
            RegisterOperationStatus::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn deregister_of_unowned_path_fails() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(&state, &register_msg(&["Device.X."], false), "svc-1", &conn).await;
        let _ = recv(&mut rx).await;
        let _ = recv(&mut rx).await;

        let msg = UspMsg::request(
            "d-1".into(),
            Request::Deregister(usp_sdk::api::usp::Deregister {
                paths: vec!["Device.Y.".into()],
            }),
        );
        handle_deregister(&state, &msg, "svc-1", &conn).await;
        let resp = recv(&mut rx).await;
        let Body::Response(Response::DeregisterResp(dresp)) = &resp.body else {
            panic!("expected DeregisterResp");
        };
        assert!(matches!(
            dresp.deregistered_path_results[0].oper_status,
            usp_sdk::api::usp::DeregisterOperationStatus::Failure { .. }
        ));
        // Device.X. is still owned
        assert!(state.schema.exists_in_schema("Device.X."));
    }

    #[tokio::test]
    async fn deregister_all_fails_commands_in_progress() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(&state, &register_msg(&["Device.X."], false), "svc-1", &conn).await;
        let _ = recv(&mut rx).await;
        let _ = recv(&mut rx).await;

        // A controller holds an OperationComplete subscription and has an
        // async command in flight on the service
        let (ctrl, mut ctrl_rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        state
            .subscriptions
            .add_row_from_params(
                &[
                    ("NotifType".to_string(), "OperationComplete".to_string()),
                    ("ReferenceList".to_string(), "Device.X.Run()".to_string()),
                    ("ID".to_string(), "ctl-sub".to_string()),
                    ("Enable".to_string(), "true".to_string()),
                ],
                Some(crate::state::subscription_state::Recipient {
                    endpoint_id: "controller".into(),
                    mtp: ctrl,
                }),
            )
            .unwrap();
        let instance = state.requests.add("Device.X.Run()", "K1");
        state
            .services
            .with_service_mut("svc-1", |s| s.req_map.add(instance, "Device.X.Run()", "K1"));

        let msg = UspMsg::request(
            "d-3".into(),
            Request::Deregister(usp_sdk::api::usp::Deregister {
                paths: vec!["".into()],
            }),
        );
        handle_deregister(&state, &msg, "svc-1", &conn).await;

        // The in-flight command failed exactly once
        let notify = ctrl_rx.recv().await.unwrap().msg;
        let Body::Request(Request::Notify(n)) = &notify.body else {
            panic!("expected Notify");
        };
        assert!(matches!(
            n.notification,
            usp_sdk::api::usp::Notification::OperationComplete {
                operation_resp: usp_sdk::api::usp::OperationCompleteResp::CommandFailure { .. },
                ..
            }
        ));
        assert!(state.requests.rows().is_empty());
        assert!(state
            .services
            .with_service("svc-1", |s| s.req_map.is_empty())
            .unwrap());

        let resp = recv(&mut rx).await;
        let Body::Response(Response::DeregisterResp(dresp)) = &resp.body else {
            panic!("expected DeregisterResp");
        };
        assert!(matches!(
            dresp.deregistered_path_results[0].oper_status,
            usp_sdk::api::usp::DeregisterOperationStatus::Success { .. }
        ));
        assert!(!state.schema.exists_in_schema("Device.X."));
    }

    #[tokio::test]
    async fn deregister_all_lists_every_path_in_one_success() {
        let state = PlatformState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        handle_register(
            &state,
            &register_msg(&["Device.X.", "Device.Y."], false),
            "svc-1",
            &conn,
        )
        .await;
        let _ = recv(&mut rx).await;
        let _ = recv(&mut rx).await;

        let msg = UspMsg::request(
            "d-2".into(),
            Request::Deregister(usp_sdk::api::usp::Deregister {
                paths: vec!["".into()],
            }),
        );
        handle_deregister(&state, &msg, "svc-1", &conn).await;
        let resp = recv(&mut rx).await;
        let Body::Response(Response::DeregisterResp(dresp)) = &resp.body else {
            panic!("expected DeregisterResp");
        };
        assert_eq!(dresp.deregistered_path_results.len(), 1);
        let usp_sdk::api::usp::DeregisterOperationStatus::Success { deregistered_path } =
            &dresp.deregistered_path_results[0].oper_status
        else {
            panic!("expected success");
        };
        assert_eq!(
            deregistered_path,
            &vec!["Device.X.".to_string(), "Device.Y.".to_string()]
        );
        assert!(!state.schema.exists_in_schema("Device.X."));
        assert!(!state.schema.exists_in_schema("Device.Y."));
        assert!(state
            .services
            .with_service("svc-1", |s| s.registered_paths.is_empty())
            .unwrap());
    }
}
