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

use usp_broker::gateway::broker_gateway::BrokerGateway;
use usp_broker::mtp::websocket::start_ws_listener;
use usp_broker::state::platform_state::PlatformState;
use usp_sdk::api::config::BrokerConfig;
use usp_sdk::log::{error, info, warn};
use usp_sdk::utils::logger::init_logger;

#[tokio::main]
async fn main() {
    if let Err(e) = init_logger("usp-broker".into()) {
        eprintln!("Failed to initialize logger: {:?}", e);
    }

    let config = match std::env::args().nth(1) {
        Some(path) => match BrokerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load config from {} ({}), using defaults", path, e);
                BrokerConfig::default()
            }
        },
        None => BrokerConfig::default(),
    };
    info!(
        "Starting USP Broker (max services {})",
        config.max_usp_services
    );

    let state = PlatformState::new(config);
    let (gateway, gateway_tx) = BrokerGateway::new(state.clone());

    let listener_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_ws_listener(listener_state, gateway_tx).await {
            error!("WebSocket listener failed: {}", e);
        }
    });

    gateway.run().await;
}
