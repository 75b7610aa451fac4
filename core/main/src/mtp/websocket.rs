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

//! WebSocket MTP: accepts Controller and Service connections carrying
//! JSON-framed USP messages, bridging them onto the gateway queue.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use usp_sdk::api::mtp::{MtpConn, MtpProtocol, MtpRole};
use usp_sdk::api::usp::UspMsg;
use usp_sdk::log::{error, info, warn};
use usp_sdk::tokio::sync::mpsc::Sender;
use usp_sdk::uuid::Uuid;

use crate::gateway::broker_gateway::GatewayCommand;
use crate::state::permission_state::CombinedRole;
use crate::state::platform_state::PlatformState;

/// First frame on every connection, identifying the peer.
#[derive(Debug, Serialize, Deserialize)]
struct ConnectHello {
    endpoint_id: String,
    /// True when the peer is a USP Service (data-model provider).
    #[serde(default)]
    usp_service: bool,
    /// "controller" or "agent": which of the Broker's sockets this
    /// connection stands in for. Absent means the connection serves both.
    #[serde(default)]
    socket_role: Option<String>,
    /// Role name used for permission checks on this peer's requests.
    #[serde(default)]
    role: Option<String>,
}

pub async fn start_ws_listener(
    state: PlatformState,
    gateway_tx: Sender<GatewayCommand>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&state.config.ws_listen_addr).await?;
    info!("WebSocket MTP listening on {}", state.config.ws_listen_addr);
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        let gateway_tx = gateway_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state, gateway_tx).await {
                warn!("Connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: PlatformState,
    gateway_tx: Sender<GatewayCommand>,
) -> Result<(), String> {
    let ws = accept_async(stream).await.map_err(|e| e.to_string())?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // The peer introduces itself before any USP traffic
    let hello: ConnectHello = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                break serde_json::from_str(&text).map_err(|e| e.to_string())?;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("closed before hello".into()),
        }
    };

    let connection_id = Uuid::new_v4().to_string();
    let mtp_role = match hello.socket_role.as_deref() {
        Some("agent") => Some(MtpRole::BrokersAgent),
        Some("controller") => Some(MtpRole::BrokersController),
        _ => None,
    };
    info!(
        "New {} connection endpoint_id={} connection_id={}",
        if hello.usp_service { "service" } else { "controller" },
        hello.endpoint_id,
        connection_id
    );

    let (conn, mut out_rx) = MtpConn::channel(MtpProtocol::WebSocket, mtp_role, 32);

    // Writer: drains the handle's queue onto the socket in FIFO order
    let writer = tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            match serde_json::to_string(&item.msg) {
                Ok(text) => {
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        error!("Failed to write to {}: {}", item.endpoint_id, e);
                        break;
                    }
                }
                Err(e) => error!("Failed to encode message: {}", e),
            }
        }
    });

    if hello.usp_service {
        let _ = gateway_tx
            .send(GatewayCommand::ServiceConnected {
                endpoint_id: hello.endpoint_id.clone(),
                mtpc: conn.clone(),
            })
            .await;
    }
    let role = CombinedRole::new(
        hello
            .role
            .clone()
            .unwrap_or_else(|| state.config.default_controller_role.clone()),
    );

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<UspMsg>(&text) {
                Ok(msg) => {
                    let _ = gateway_tx
                        .send(GatewayCommand::HandleMessage {
                            msg,
                            endpoint_id: hello.endpoint_id.clone(),
                            mtpc: conn.clone(),
                            role: role.clone(),
                        })
                        .await;
                }
                Err(e) => warn!(
                    "Dropping unparseable frame from {}: {}",
                    hello.endpoint_id, e
                ),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error for {}: {}", hello.endpoint_id, e);
                break;
            }
        }
    }

    info!(
        "Connection closed endpoint_id={} connection_id={}",
        hello.endpoint_id, connection_id
    );
    if hello.usp_service {
        let _ = gateway_tx
            .send(GatewayCommand::ServiceDisconnected {
                endpoint_id: hello.endpoint_id.clone(),
                role: mtp_role.unwrap_or(MtpRole::BrokersController),
            })
            .await;
    }
    writer.abort();
    Ok(())
}
