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
use usp_sdk::api::usp::{Body, MsgType, Notification, Request, Response, UspMsg};
use usp_sdk::log::info;
use usp_sdk::utils::error::UspError;

use crate::processor::notify_processor::route_notification;
use crate::state::permission_state::{
    CombinedRole, PERMIT_ADD, PERMIT_DEL, PERMIT_GET, PERMIT_GET_INST, PERMIT_SET,
};
use crate::state::platform_state::PlatformState;
use crate::state::schema_tree::SchemaTree;

const FULL_DEPTH: u32 = u32::MAX;

/// Tries to handle the message without decoding it into the unified data
/// model: requests wholly owned by one Service are forwarded with a
/// remapped message id, responses to earlier passthrough requests are
/// routed back to their originators, and matching notifications are
/// relayed verbatim. Returns true when the message was consumed.
pub async fn attempt_passthru(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) -> bool {
    match &msg.body {
        Body::Request(Request::Get(_))
        | Body::Request(Request::Set(_))
        | Body::Request(Request::Add(_))
        | Body::Request(Request::Delete(_)) => {
            attempt_passthru_for_request(state, msg, endpoint_id, mtpc, role).await
        }
        Body::Request(Request::Notify(_)) => {
            attempt_passthru_for_notification(state, msg, endpoint_id).await
        }
        Body::Error(_) => attempt_passthru_for_response(state, msg, endpoint_id).await,
        Body::Response(resp) => match resp {
            Response::GetResp(_)
            | Response::SetResp(_)
            | Response::AddResp(_)
            | Response::DeleteResp(_) => {
                attempt_passthru_for_response(state, msg, endpoint_id).await
            }
            _ => false,
        },
        _ => false,
    }
}

/// Qualification: every referenced path resolves, all paths share one
/// non-internal group, and the originator's role permits the action on
/// every path. Any miss hands the request to the normal handlers.
async fn attempt_passthru_for_request(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
    role: &CombinedRole,
) -> bool {
    let group_id = state
        .schema
        .read(|tree| qualifying_group(state, tree, msg, role));
    let Some(group_id) = group_id else {
        return false;
    };
    pass_thru_to_service(state, group_id, msg, endpoint_id, mtpc)
        .await
        .is_ok()
}

fn qualifying_group(
    state: &PlatformState,
    tree: &SchemaTree,
    msg: &UspMsg,
    role: &CombinedRole,
) -> Option<usize> {
    let mut group_id: Option<usize> = None;

    // Each referenced path must land in the same Service-owned group
    let mut check_path = |path: &str, required: u16, depth: u32| -> Option<()> {
        let node = tree.get_node(path)?;
        match group_id {
            None => {
                let gid = node.group_id?;
                state.services.with_service_by_group(gid, |_| ())?;
                group_id = Some(gid);
            }
            Some(gid) => {
                if node.group_id != Some(gid) {
                    return None;
                }
            }
        }
        if !check_permissions(state, tree, &node.path, depth, required, role) {
            return None;
        }
        Some(())
    };

    match &msg.body {
        Body::Request(Request::Get(get)) => {
            if get.param_paths.is_empty() {
                return None;
            }
            let depth = if get.max_depth == 0 {
                FULL_DEPTH
            } else {
                get.max_depth
            };
            for path in &get.param_paths {
                let node = tree.get_node(path)?;
                if !node.is_object() && !node.is_vendor_param() {
                    return None;
                }
                check_path(path, PERMIT_GET | PERMIT_GET_INST, depth)?;
            }
        }
        Body::Request(Request::Set(set)) => {
            if set.update_objs.is_empty() {
                return None;
            }
            for obj in &set.update_objs {
                let node = tree.get_node(&obj.obj_path)?;
                if !node.is_object() {
                    return None;
                }
                check_path(&obj.obj_path, 0, 1)?;
                for param in &obj.param_settings {
                    let param_path = format!("{}{}", node.path, param.param);
                    let param_node = tree.get_node(&param_path)?;
                    if !param_node.is_vendor_param() {
                        return None;
                    }
                    check_path(&param_path, PERMIT_SET, 1)?;
                }
            }
        }
        Body::Request(Request::Add(add)) => {
            if add.create_objs.is_empty() {
                return None;
            }
            for obj in &add.create_objs {
                let node = tree.get_node(&obj.obj_path)?;
                if !node.is_multi_instance() {
                    return None;
                }
                check_path(&obj.obj_path, PERMIT_ADD, 1)?;
                for param in &obj.param_settings {
                    let param_path = format!("{}{}", node.path, param.param);
                    let param_node = tree.get_node(&param_path)?;
                    if !param_node.is_vendor_param() {
                        return None;
                    }
                    check_path(&param_path, PERMIT_SET, 1)?;
                }
            }
        }
        Body::Request(Request::Delete(del)) => {
            if del.obj_paths.is_empty() {
                return None;
            }
            for path in &del.obj_paths {
                let node = tree.get_node(path)?;
                if !node.is_multi_instance() {
                    return None;
                }
                check_path(path, PERMIT_DEL, 1)?;
            }
        }
        _ => return None,
    }

    group_id
}

/// Recursive permission check over the node and its children, down to the
/// requested depth.
fn check_permissions(
    state: &PlatformState,
    tree: &SchemaTree,
    node_path: &str,
    depth: u32,
    required: u16,
    role: &CombinedRole,
) -> bool {
    if !state.permissions.is_permitted(node_path, role, required) {
        return false;
    }
    if depth <= 1 {
        return true;
    }
    for child in tree.children_of(node_path) {
        if !check_permissions(state, tree, &child.path, depth - 1, required, role) {
            return false;
        }
    }
    true
}

/// Forwards the request with a fresh Broker message id, recording how to
/// route the response back.
async fn pass_thru_to_service(
    state: &PlatformState,
    group_id: usize,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
) -> Result<(), UspError> {
    let (service_endpoint, conn) = state
        .services
        .with_service_by_group(group_id, |s| {
            (s.endpoint_id.clone(), s.controller_mtp.clone())
        })
        .ok_or(UspError::Internal)?;
    let conn = conn.ok_or(UspError::Internal)?;

    let broker_msg_id = state.mtp.next_msg_id();
    let original_msg_id = msg.msg_id().to_string();
    info!("Passthru {} to '{}'", msg.msg_type(), service_endpoint);

    let mut forwarded = msg.clone();
    forwarded.header.msg_id = broker_msg_id.clone();

    // Recorded before the send so an early response always finds its way
    state.services.with_service_by_group_mut(group_id, |s| {
        s.msg_map
            .add(&original_msg_id, &broker_msg_id, endpoint_id, mtpc.clone())
    });

    if let Err(e) = conn.queue_message(service_endpoint, forwarded).await {
        state
            .services
            .with_service_by_group_mut(group_id, |s| s.msg_map.remove(&broker_msg_id));
        return Err(e);
    }
    Ok(())
}

/// Routes a Service's response to a passed-through request back to the
/// originator, restoring its message id.
async fn attempt_passthru_for_response(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
) -> bool {
    let entry = state
        .services
        .with_service_mut(endpoint_id, |s| s.msg_map.remove(msg.msg_id()))
        .flatten();
    let Some(entry) = entry else {
        return false;
    };

    let mut restored = msg.clone();
    restored.header.msg_id = entry.original_msg_id.clone();
    info!("Passback {} to '{}'", msg.msg_type(), entry.originator);

    // Nothing sensible to do on a send failure other than drop the response
    let _ = entry
        .mtp_conn
        .queue_message(entry.originator.clone(), restored)
        .await;
    true
}

/// Relays a notification matching a SubsMap entry without re-encoding.
/// OperationComplete and OnBoardRequest always take the normal path, and
/// creation/deletion events are held back while an Add round-trip to the
/// same Service is in flight (they may describe rollback of a failed
/// partial Add).
async fn attempt_passthru_for_notification(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
) -> bool {
    let Body::Request(Request::Notify(notify)) = &msg.body else {
        return false;
    };
    if notify.send_resp {
        return false;
    }
    match &notify.notification {
        Notification::OperationComplete { .. } | Notification::OnBoardRequest { .. } => {
            return false;
        }
        Notification::ObjectCreation { .. } | Notification::ObjectDeletion { .. } => {
            if state.mtp.has_pending(endpoint_id, MsgType::AddResp) {
                return false;
            }
        }
        _ => {}
    }

    let broker_instance = state
        .services
        .with_service(endpoint_id, |s| {
            s.subs_map
                .find_by_service_subs_id(&notify.subscription_id)
                .map(|e| e.broker_instance)
        })
        .flatten();
    let Some(broker_instance) = broker_instance else {
        return false;
    };

    info!("Passthru NOTIFY");
    route_notification(state, msg, broker_instance).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::mtp::MtpProtocol;
    use usp_sdk::api::usp::{Get, Set, UpdateObject, UpdateParamSetting};
    use crate::state::permission_state::FULL_ACCESS_ROLE;
    use crate::state::schema_tree::ParamType;

    struct Fixture {
        state: PlatformState,
        svc_rx: usp_sdk::tokio::sync::mpsc::Receiver<usp_sdk::api::mtp::MtpSendItem>,
        ctrl: MtpConn,
        ctrl_rx: usp_sdk::tokio::sync::mpsc::Receiver<usp_sdk::api::mtp::MtpSendItem>,
    }

    fn fixture() -> Fixture {
        let state = PlatformState::default();
        let (svc_conn, svc_rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        state.services.add("svc-1", &svc_conn, 8).unwrap();
        state.schema.write(|tree| {
            tree.add_placeholder_object("Device.A.", 1).unwrap();
            tree.register_param(Some(1), "Device.A.x", true, ParamType::String);
            tree.add_placeholder_object("Device.B.", 2).unwrap();
            tree.register_param(Some(2), "Device.B.y", true, ParamType::String);
        });
        let (svc2, _rx2) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        state.services.add("svc-2", &svc2, 8).unwrap();
        let (ctrl, ctrl_rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        Fixture {
            state,
            svc_rx,
            ctrl,
            ctrl_rx,
        }
    }

    fn get_msg(paths: &[&str]) -> UspMsg {
        UspMsg::request(
            "ctl-1".into(),
            Request::Get(Get {
                param_paths: paths.iter().map(|s| s.to_string()).collect(),
                max_depth: 0,
            }),
        )
    }

    #[tokio::test]
    async fn single_group_get_passes_through_with_remapped_id() {
        let mut fx = fixture();
        let role = CombinedRole::new(FULL_ACCESS_ROLE);
        let msg = get_msg(&["Device.A.x"]);

        assert!(attempt_passthru(&fx.state, &msg, "controller", &fx.ctrl, &role).await);

        let forwarded = fx.svc_rx.recv().await.unwrap();
        assert_ne!(forwarded.msg.msg_id(), "ctl-1");
        assert!(forwarded.msg.msg_id().starts_with("BROKER-"));
        // Body is untouched
        assert_eq!(forwarded.msg.body, msg.body);

        // The matching response is routed back with the original id
        let resp = UspMsg::response(
            forwarded.msg.msg_id().to_string(),
            Response::GetResp(Default::default()),
        );
        assert!(attempt_passthru(&fx.state, &resp, "svc-1", &fx.ctrl, &role).await);
        let returned = fx.ctrl_rx.recv().await.unwrap();
        assert_eq!(returned.msg.msg_id(), "ctl-1");
        assert_eq!(returned.endpoint_id, "controller");
        assert_eq!(returned.msg.body, resp.body);

        // MsgMap entry is consumed
        assert!(!attempt_passthru(&fx.state, &resp, "svc-1", &fx.ctrl, &role).await);
    }

    #[tokio::test]
    async fn mixed_groups_decline() {
        let fx = fixture();
        let role = CombinedRole::new(FULL_ACCESS_ROLE);
        let msg = get_msg(&["Device.A.x", "Device.B.y"]);
        assert!(!attempt_passthru(&fx.state, &msg, "controller", &fx.ctrl, &role).await);
    }

    #[tokio::test]
    async fn unresolved_path_declines() {
        let fx = fixture();
        let role = CombinedRole::new(FULL_ACCESS_ROLE);
        let msg = get_msg(&["Device.A.x", "Device.A.unknown"]);
        assert!(!attempt_passthru(&fx.state, &msg, "controller", &fx.ctrl, &role).await);
    }

    #[tokio::test]
    async fn missing_permission_declines() {
        let fx = fixture();
        fx.state.permissions.add_rule("limited", "Device.A.", PERMIT_GET | PERMIT_GET_INST);
        let role = CombinedRole::new("limited");

        assert!(attempt_passthru(&fx.state, &get_msg(&["Device.A.x"]), "controller", &fx.ctrl, &role).await);

        // Set is not permitted for this role
        let set = UspMsg::request(
            "ctl-2".into(),
            Request::Set(Set {
                allow_partial: false,
                update_objs: vec![UpdateObject {
                    obj_path: "Device.A.".into(),
                    param_settings: vec![UpdateParamSetting {
                        param: "x".into(),
                        value: "v".into(),
                        required: true,
                    }],
                }],
            }),
        );
        assert!(!attempt_passthru(&fx.state, &set, "controller", &fx.ctrl, &role).await);
    }

    #[tokio::test]
    async fn internal_paths_never_pass_through() {
        let fx = fixture();
        let role = CombinedRole::new(FULL_ACCESS_ROLE);
        let msg = get_msg(&["Device.USPServices.USPServiceNumberOfEntries"]);
        assert!(!attempt_passthru(&fx.state, &msg, "controller", &fx.ctrl, &role).await);
    }
}
