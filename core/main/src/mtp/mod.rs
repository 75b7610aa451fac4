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

pub mod websocket;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use usp_sdk::api::mtp::MtpConn;
use usp_sdk::api::usp::{MsgType, UspMsg};
use usp_sdk::log::warn;
use usp_sdk::tokio::sync::oneshot;
use usp_sdk::tokio::time::timeout;
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::ids::{MessageIdAllocator, SubscriptionIdAllocator};

#[derive(Debug)]
struct PendingResponse {
    expected: MsgType,
    endpoint_id: String,
    tx: oneshot::Sender<UspMsg>,
}

/// Broker-side transport state: id allocation plus the pending-response
/// map behind the send-and-wait primitive. While a caller awaits its typed
/// response here, the gateway keeps dispatching other traffic, so registry
/// and schema may mutate across any call into this module.
#[derive(Debug, Clone, Default)]
pub struct MtpState {
    pending: Arc<RwLock<HashMap<String, PendingResponse>>>,
    msg_ids: MessageIdAllocator,
    subs_ids: SubscriptionIdAllocator,
}

impl MtpState {
    pub fn next_msg_id(&self) -> String {
        self.msg_ids.next_id()
    }

    pub fn next_subscription_id(&self) -> String {
        self.subs_ids.next_id()
    }

    /// Sends a request on the given connection and waits for the matching
    /// typed response (or a USP Error carrying the same message id). A
    /// missing response surfaces as `Internal` after the deadline; there is
    /// no retry.
    pub async fn send_request_and_await_response(
        &self,
        endpoint_id: &str,
        msg: UspMsg,
        conn: &MtpConn,
        expected: MsgType,
        timeout_secs: u64,
    ) -> Result<UspMsg, UspError> {
        let msg_id = msg.msg_id().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().unwrap();
            pending.insert(
                msg_id.clone(),
                PendingResponse {
                    expected,
                    endpoint_id: endpoint_id.to_string(),
                    tx,
                },
            );
        }

        if let Err(e) = conn.queue_message(endpoint_id, msg).await {
            self.pending.write().unwrap().remove(&msg_id);
            return Err(e);
        }

        match timeout(Duration::from_secs(timeout_secs), rx).await {
            Ok(Ok(resp)) => Ok(resp),
            _ => {
                self.pending.write().unwrap().remove(&msg_id);
                warn!(
                    "Timed out waiting for {} from {} (msg_id={})",
                    expected, endpoint_id, msg_id
                );
                Err(UspError::Internal)
            }
        }
    }

    /// Offers an inbound response to the pending map. Returns true when a
    /// waiter consumed it.
    pub fn try_complete(&self, msg: &UspMsg) -> bool {
        if !msg.is_response_or_error() {
            return false;
        }
        let mut pending = self.pending.write().unwrap();
        let matches = pending
            .get(msg.msg_id())
            .map(|p| msg.msg_type() == p.expected || msg.msg_type() == MsgType::Error)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(entry) = pending.remove(msg.msg_id()) {
            // A dropped waiter already timed out; the response is stale
            let _ = entry.tx.send(msg.clone());
        }
        true
    }

    /// True when a request of the given kind is in flight to the endpoint.
    /// Notification passthrough holds back ObjectCreation/ObjectDeletion
    /// while an Add round-trip is outstanding.
    pub fn has_pending(&self, endpoint_id: &str, expected: MsgType) -> bool {
        self.pending
            .read()
            .unwrap()
            .values()
            .any(|p| p.endpoint_id == endpoint_id && p.expected == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usp_sdk::api::mtp::MtpProtocol;
    use usp_sdk::api::usp::{Get, GetResp, Request, Response};

    fn get_req(msg_id: &str) -> UspMsg {
        UspMsg::request(
            msg_id.into(),
            Request::Get(Get {
                param_paths: vec!["Device.X.Y".into()],
                max_depth: 0,
            }),
        )
    }

    #[tokio::test]
    async fn round_trip_completes_with_typed_response() {
        let mtp = MtpState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 4);

        let mtp_c = mtp.clone();
        let responder = usp_sdk::tokio::spawn(async move {
            let item = rx.recv().await.unwrap();
            let resp = UspMsg::response(
                item.msg.msg_id().to_string(),
                Response::GetResp(GetResp::default()),
            );
            assert!(mtp_c.try_complete(&resp));
        });

        let resp = mtp
            .send_request_and_await_response("svc", get_req("m-1"), &conn, MsgType::GetResp, 5)
            .await
            .unwrap();
        assert_eq!(resp.msg_type(), MsgType::GetResp);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_completes_the_wait() {
        let mtp = MtpState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 4);

        let mtp_c = mtp.clone();
        usp_sdk::tokio::spawn(async move {
            let item = rx.recv().await.unwrap();
            let resp = UspMsg::error(
                item.msg.msg_id().to_string(),
                &UspError::RequestDenied,
                "denied",
            );
            assert!(mtp_c.try_complete(&resp));
        });

        let resp = mtp
            .send_request_and_await_response("svc", get_req("m-2"), &conn, MsgType::GetResp, 5)
            .await
            .unwrap();
        assert_eq!(resp.msg_type(), MsgType::Error);
    }

    #[tokio::test]
    async fn mismatched_type_or_id_is_not_consumed() {
        let mtp = MtpState::default();
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 4);

        let mtp_c = mtp.clone();
        usp_sdk::tokio::spawn(async move {
            let item = rx.recv().await.unwrap();
            let id = item.msg.msg_id().to_string();
            // Wrong type for this waiter
            let wrong = UspMsg::response(id.clone(), Response::SetResp(Default::default()));
            assert!(!mtp_c.try_complete(&wrong));
            // Unknown message id
            let unknown = UspMsg::response("other".into(), Response::GetResp(GetResp::default()));
            assert!(!mtp_c.try_complete(&unknown));
            let right = UspMsg::response(id, Response::GetResp(GetResp::default()));
            assert!(mtp_c.try_complete(&right));
        });

        let resp = mtp
            .send_request_and_await_response("svc", get_req("m-3"), &conn, MsgType::GetResp, 5)
            .await
            .unwrap();
        assert_eq!(resp.msg_type(), MsgType::GetResp);
    }

    #[tokio::test]
    async fn timeout_surfaces_as_internal_and_clears_pending() {
        let mtp = MtpState::default();
        let (conn, _rx) = MtpConn::channel(MtpProtocol::Channel, None, 4);

        let err = mtp
            .send_request_and_await_response("svc", get_req("m-4"), &conn, MsgType::GetResp, 0)
            .await
            .unwrap_err();
        assert_eq!(err, UspError::Internal);
        assert!(!mtp.has_pending("svc", MsgType::GetResp));
    }

    #[tokio::test]
    async fn pending_kind_is_visible_per_endpoint() {
        let mtp = MtpState::default();
        let (conn, _rx) = MtpConn::channel(MtpProtocol::Channel, None, 4);

        let mtp_c = mtp.clone();
        let waiter = usp_sdk::tokio::spawn(async move {
            let _ = mtp_c
                .send_request_and_await_response(
                    "svc",
                    get_req("m-5"),
                    &conn,
                    MsgType::AddResp,
                    1,
                )
                .await;
        });
        usp_sdk::tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mtp.has_pending("svc", MsgType::AddResp));
        assert!(!mtp.has_pending("other", MsgType::AddResp));
        waiter.await.unwrap();
    }
}
