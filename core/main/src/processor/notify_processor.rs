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
use usp_sdk::api::usp::{Body, Notification, Request, UspMsg};
use usp_sdk::log::{error, info};
use usp_sdk::utils::error::UspError;

use crate::state::platform_state::PlatformState;

/// Forwards a notification to the Controller that created the matching
/// subscription on the Broker, substituting the Broker-side subscription
/// ID the Controller knows.
pub async fn route_notification(
    state: &PlatformState,
    msg: &UspMsg,
    broker_instance: u32,
) -> Result<(), UspError> {
    let row = state
        .subscriptions
        .row(broker_instance)
        .ok_or(UspError::Internal)?;
    let recipient = row.recipient.ok_or(UspError::Internal)?;

    let mut forwarded = msg.clone();
    if let Body::Request(Request::Notify(notify)) = &mut forwarded.body {
        notify.subscription_id = row.id.clone();
    } else {
        return Err(UspError::Internal);
    }

    recipient
        .mtp
        .queue_message(recipient.endpoint_id.clone(), forwarded)
        .await
}

/// Handles a notification arriving from a USP Service on the normal path.
/// Protocol violations are answered with a USP ERROR on the receiving MTP.
pub async fn handle_notification(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
    mtpc: &MtpConn,
) {
    let result = process_notification(state, msg, endpoint_id).await;
    if let Err((err, err_msg)) = result {
        let reply = UspMsg::error(msg.msg_id().to_string(), &err, err_msg);
        if let Err(e) = mtpc.queue_message(endpoint_id, reply).await {
            error!("Failed to send USP Error to {}: {}", endpoint_id, e);
        }
    }
}

async fn process_notification(
    state: &PlatformState,
    msg: &UspMsg,
    endpoint_id: &str,
) -> Result<(), (UspError, String)> {
    let Body::Request(Request::Notify(notify)) = &msg.body else {
        return Err((
            UspError::RequestDenied,
            "Notification is invalid or inconsistent".into(),
        ));
    };

    // Subscriptions are created with NotifRetry=false, so a notification
    // asking for a response is breaking the contract
    if notify.send_resp {
        return Err((
            UspError::RequestDenied,
            "Notification has send_resp=true, but subscription was setup with NotifRetry=false"
                .into(),
        ));
    }

    if !state.services.contains(endpoint_id) {
        return Err((
            UspError::RequestDenied,
            format!("Notification is from an unexpected endpoint ({})", endpoint_id),
        ));
    }

    let broker_instance = state
        .services
        .with_service(endpoint_id, |s| {
            s.subs_map
                .find_by_service_subs_id(&notify.subscription_id)
                .map(|e| e.broker_instance)
        })
        .flatten()
        .ok_or_else(|| {
            (
                UspError::RequestDenied,
                format!(
                    "Notification contains unexpected subscription Id ({})",
                    notify.subscription_id
                ),
            )
        })?;

    if let Err(e) = route_notification(state, msg, broker_instance).await {
        error!("Failed to route notification from {}: {}", endpoint_id, e);
    }

    if let Notification::OperationComplete {
        obj_path,
        command_name,
        command_key,
        ..
    } = &notify.notification
    {
        delete_matching_operate_request(state, endpoint_id, obj_path, command_name, command_key);
    }

    Ok(())
}

/// Removes the Request-table row and ReqMap entry of a completed command.
/// A Service (incorrectly) emitting duplicate completions produces a
/// logged miss, nothing more.
fn delete_matching_operate_request(
    state: &PlatformState,
    endpoint_id: &str,
    obj_path: &str,
    command_name: &str,
    command_key: &str,
) {
    let command_path = format!("{}{}", obj_path, command_name);
    let entry = state
        .services
        .with_service_mut(endpoint_id, |s| s.req_map.remove(&command_path, command_key))
        .flatten();
    match entry {
        Some(entry) => {
            state.requests.delete(entry.request_instance);
            info!(
                "Command {} (command_key={}) completed",
                command_path, command_key
            );
        }
        None => {
            error!(
                "Received an Operation Complete for {} (command_key={}), but no entry in request map",
                command_path, command_key
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::mtp::MtpProtocol;
    use usp_sdk::api::usp::{Notify, OperationCompleteResp};
    use crate::state::subscription_state::Recipient;

    struct Fixture {
        state: PlatformState,
        svc_conn: MtpConn,
        svc_rx: usp_sdk::tokio::sync::mpsc::Receiver<usp_sdk::api::mtp::MtpSendItem>,
        ctrl_rx: usp_sdk::tokio::sync::mpsc::Receiver<usp_sdk::api::mtp::MtpSendItem>,
        broker_instance: u32,
    }

    fn fixture() -> Fixture {
        let state = PlatformState::default();
        let (svc_conn, svc_rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        state.services.add("svc-1", &svc_conn, 8).unwrap();

        let (ctrl_conn, ctrl_rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        let broker_instance = state
            .subscriptions
            .add_row_from_params(
                &[
                    ("NotifType".to_string(), "OperationComplete".to_string()),
                    ("ReferenceList".to_string(), "Device.X.Run()".to_string()),
                    ("ID".to_string(), "ctl-sub-1".to_string()),
                    ("Enable".to_string(), "true".to_string()),
                ],
                Some(Recipient {
                    endpoint_id: "controller".into(),
                    mtp: ctrl_conn,
                }),
            )
            .unwrap();
        state.services.with_service_mut("svc-1", |s| {
            s.subs_map
                .add(4, "Device.X.Run()", "1-AA-BROKER", broker_instance)
        });
        Fixture {
            state,
            svc_conn,
            svc_rx,
            ctrl_rx,
            broker_instance,
        }
    }

    fn oper_complete(subscription_id: &str, send_resp: bool) -> UspMsg {
        UspMsg::request(
            "n-1".into(),
            Request::Notify(Notify {
                subscription_id: subscription_id.into(),
                send_resp,
                notification: Notification::OperationComplete {
                    obj_path: "Device.X.".into(),
                    command_name: "Run()".into(),
                    command_key: "K1".into(),
                    operation_resp: OperationCompleteResp::OutputArgs(vec![]),
                },
            }),
        )
    }

    #[tokio::test]
    async fn operation_complete_routes_and_cleans_up() {
        let mut fx = fixture();
        let instance = fx.state.requests.add("Device.X.Run()", "K1");
        fx.state.services.with_service_mut("svc-1", |s| {
            s.req_map.add(instance, "Device.X.Run()", "K1")
        });

        handle_notification(
            &fx.state,
            &oper_complete("1-AA-BROKER", false),
            "svc-1",
            &fx.svc_conn,
        )
        .await;

        // Forwarded to the controller with the broker-side subscription id
        let delivered = fx.ctrl_rx.recv().await.unwrap();
        assert_eq!(delivered.endpoint_id, "controller");
        let Body::Request(Request::Notify(notify)) = &delivered.msg.body else {
            panic!("expected Notify");
        };
        assert_eq!(notify.subscription_id, "ctl-sub-1");

        // Request row and ReqMap entry are gone
        assert!(fx.state.requests.row(instance).is_none());
        assert!(fx
            .state
            .services
            .with_service("svc-1", |s| s.req_map.is_empty())
            .unwrap());
        let _ = fx.broker_instance;
    }

    #[tokio::test]
    async fn duplicate_completion_is_tolerated() {
        let mut fx = fixture();
        handle_notification(
            &fx.state,
            &oper_complete("1-AA-BROKER", false),
            "svc-1",
            &fx.svc_conn,
        )
        .await;
        // Routed fine even though no request was in flight
        assert!(fx.ctrl_rx.recv().await.is_some());
        // No error reply went back to the service
        assert!(fx.svc_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_resp_notification_is_rejected() {
        let mut fx = fixture();
        handle_notification(
            &fx.state,
            &oper_complete("1-AA-BROKER", true),
            "svc-1",
            &fx.svc_conn,
        )
        .await;
        let reply = fx.svc_rx.recv().await.unwrap();
        let Body::Error(err) = &reply.msg.body else {
            panic!("expected Error");
        };
        assert_eq!(err.err_code, UspError::RequestDenied.to_wire_code());
    }

    #[tokio::test]
    async fn unknown_subscription_id_is_rejected() {
        let mut fx = fixture();
        handle_notification(
            &fx.state,
            &oper_complete("not-ours", false),
            "svc-1",
            &fx.svc_conn,
        )
        .await;
        let reply = fx.svc_rx.recv().await.unwrap();
        assert!(matches!(reply.msg.body, Body::Error(_)));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let fx = fixture();
        let (stranger, mut stranger_rx) = MtpConn::channel(MtpProtocol::Channel, None, 4);
        handle_notification(
            &fx.state,
            &oper_complete("1-AA-BROKER", false),
            "stranger",
            &stranger,
        )
        .await;
        let reply = stranger_rx.recv().await.unwrap();
        assert!(matches!(reply.msg.body, Body::Error(_)));
    }
}
