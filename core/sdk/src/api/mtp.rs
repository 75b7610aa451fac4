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
use tokio::sync::mpsc;

use crate::api::usp::UspMsg;
use crate::utils::error::UspError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MtpProtocol {
    Channel,
    WebSocket,
}

impl std::fmt::Display for MtpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MtpProtocol::Channel => write!(f, "Channel"),
            MtpProtocol::WebSocket => write!(f, "WebSocket"),
        }
    }
}

/// Which of the Broker's sockets a peer connected on. Transports that
/// distinguish the Broker-as-Controller connection from the
/// Broker-as-Agent connection carry one of these per connection; others
/// serve both roles over a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MtpRole {
    BrokersController,
    BrokersAgent,
}

/// An outbound USP message handed to a transport connection for delivery.
#[derive(Debug, Clone)]
pub struct MtpSendItem {
    pub endpoint_id: String,
    pub msg: UspMsg,
}

/// Handle onto one live transport connection. Cloning shares the
/// underlying connection; messages queued on a handle preserve FIFO order.
#[derive(Debug, Clone)]
pub struct MtpConn {
    pub protocol: MtpProtocol,
    pub role: Option<MtpRole>,
    pub is_reply_to_specified: bool,
    sender: mpsc::Sender<MtpSendItem>,
}

impl MtpConn {
    pub fn new(
        protocol: MtpProtocol,
        role: Option<MtpRole>,
        sender: mpsc::Sender<MtpSendItem>,
    ) -> MtpConn {
        MtpConn {
            protocol,
            role,
            is_reply_to_specified: true,
            sender,
        }
    }

    /// Creates a handle backed by an in-process channel, returning the
    /// receiving half. The transport acceptors use this; tests use it to
    /// observe what the Broker sends.
    pub fn channel(
        protocol: MtpProtocol,
        role: Option<MtpRole>,
        capacity: usize,
    ) -> (MtpConn, mpsc::Receiver<MtpSendItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (MtpConn::new(protocol, role, tx), rx)
    }

    /// True when the transport differentiates the Broker's controller and
    /// agent connections, so only the matching handle may be updated.
    pub fn distinguishes_roles(&self) -> bool {
        self.role.is_some()
    }

    pub async fn queue_message(
        &self,
        endpoint_id: impl Into<String>,
        msg: UspMsg,
    ) -> Result<(), UspError> {
        if self
            .sender
            .send(MtpSendItem {
                endpoint_id: endpoint_id.into(),
                msg,
            })
            .await
            .is_err()
        {
            return Err(UspError::SendFailure);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::usp::{Get, Request};

    #[tokio::test]
    async fn queue_message_delivers_in_order() {
        let (conn, mut rx) = MtpConn::channel(MtpProtocol::Channel, None, 8);
        for i in 0..3 {
            let msg = UspMsg::request(
                format!("m-{}", i),
                Request::Get(Get {
                    param_paths: vec![],
                    max_depth: 0,
                }),
            );
            conn.queue_message("ep", msg).await.unwrap();
        }
        for i in 0..3 {
            let item = rx.recv().await.unwrap();
            assert_eq!(item.msg.msg_id(), format!("m-{}", i));
        }
    }

    #[tokio::test]
    async fn queue_message_fails_when_peer_gone() {
        let (conn, rx) = MtpConn::channel(MtpProtocol::Channel, None, 1);
        drop(rx);
        let msg = UspMsg::request(
            "m-0".into(),
            Request::Get(Get {
                param_paths: vec![],
                max_depth: 0,
            }),
        );
        assert_eq!(
            conn.queue_message("ep", msg).await,
            Err(UspError::SendFailure)
        );
    }
}
