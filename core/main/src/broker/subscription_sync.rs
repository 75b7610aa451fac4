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

use usp_sdk::api::usp::{Body, MsgType, ResolvedPathResult, Response};
use usp_sdk::log::{error, warn};
use usp_sdk::utils::ids::BROKER_UNIQUE_STR;
use usp_sdk::utils::path_utils::trailing_instance_number;

use crate::broker::msg_builder::create_get_req;
use crate::broker::operation_adapter::{multi_delete, start_all_vendor_layer_subs};
use crate::state::platform_state::PlatformState;
use crate::state::subscription_state::{NotifyType, SUBS_TABLE};

/// Reconciles the Service's subscription table with the Broker's state:
/// Broker-created rows are re-paired into SubsMap, stale or foreign rows
/// are deleted, and unmatched Broker subscriptions are re-created on the
/// Service. Reconciliation errors are logged and swallowed; the next
/// reconnect retries.
pub async fn sync_subscriptions(state: &PlatformState, endpoint_id: &str, group_id: usize) {
    let conn = state
        .services
        .with_service(endpoint_id, |s| s.controller_mtp.clone())
        .flatten();
    let Some(conn) = conn else {
        warn!("Unable to send to UspService={}. Connection dropped", endpoint_id);
        return;
    };

    let req = create_get_req(state.mtp.next_msg_id(), &[SUBS_TABLE.to_string()]);
    let resp = match state
        .mtp
        .send_request_and_await_response(
            endpoint_id,
            req,
            &conn,
            MsgType::GetResp,
            state.config.response_timeout_secs,
        )
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            error!("Failed to read subscription table of {}: {}", endpoint_id, e);
            return;
        }
    };

    if let Err(msg) = process_get_subs_response(state, endpoint_id, group_id, &resp).await {
        error!("Subscription sync with {} failed: {}", endpoint_id, msg);
    }

    start_all_vendor_layer_subs(state, group_id).await;
}

async fn process_get_subs_response(
    state: &PlatformState,
    endpoint_id: &str,
    group_id: usize,
    resp: &usp_sdk::api::usp::UspMsg,
) -> Result<(), String> {
    let Body::Response(Response::GetResp(get)) = &resp.body else {
        return Err("expected a GetResponse".into());
    };
    if get.req_path_results.len() != 1 {
        return Err(format!(
            "expected only 1 requested path result, but got {}",
            get.req_path_results.len()
        ));
    }
    let rpr = &get.req_path_results[0];
    if rpr.requested_path != SUBS_TABLE {
        return Err(format!(
            "requested path was '{}' but expected {}",
            rpr.requested_path, SUBS_TABLE
        ));
    }
    if rpr.err_code != 0 {
        return Err(format!(
            "received err={} ({}) when getting the subscription table",
            rpr.err_code, rpr.err_msg
        ));
    }

    let mut subs_to_delete = Vec::new();
    for res in &rpr.resolved_path_results {
        process_service_subscription_row(state, endpoint_id, group_id, res, &mut subs_to_delete);
    }

    if !subs_to_delete.is_empty() {
        // Failures here are tolerated; stale rows are retried next sync
        if let Err(f) = multi_delete(state, group_id, false, &subs_to_delete).await {
            warn!(
                "Failed to delete stale subscriptions on {}: {}",
                endpoint_id, f.err
            );
        }
    }
    Ok(())
}

/// Examines one row of the Service's subscription table. Rows the Broker
/// did not create are left alone; Broker-marked rows are paired, skipped,
/// or marked for deletion.
fn process_service_subscription_row(
    state: &PlatformState,
    endpoint_id: &str,
    group_id: usize,
    res: &ResolvedPathResult,
    subs_to_delete: &mut Vec<String>,
) {
    let Some(service_instance) = trailing_instance_number(&res.resolved_path) else {
        error!(
            "Resolved path was '{}' but expected {}<instance>.",
            res.resolved_path, SUBS_TABLE
        );
        return;
    };

    let (Some(path), Some(notify_type_str), Some(subscription_id), Some(enable_str)) = (
        res.param_value("ReferenceList"),
        res.param_value("NotifType"),
        res.param_value("ID"),
        res.param_value("Enable"),
    ) else {
        error!(
            "Unable to extract parameters for subscription table instance {}",
            service_instance
        );
        return;
    };

    let Some(notify_type) = NotifyType::from_str(notify_type_str) else {
        error!("USP Service returned unknown notify type ({})", notify_type_str);
        return;
    };

    if !subscription_id.contains(BROKER_UNIQUE_STR) {
        return;
    }

    // Broker-created rows are always enabled; a disabled one is deleted
    // and recreated by the vendor-layer start if still wanted
    if enable_str != "true" {
        subs_to_delete.push(res.resolved_path.clone());
        return;
    }

    let node_group = state.schema.node_group(path);
    match node_group {
        // Not in the schema yet: may pair up after a later Register
        None => return,
        Some(owner) if owner != Some(group_id) => {
            subs_to_delete.push(res.resolved_path.clone());
            return;
        }
        _ => {}
    }

    let already_paired = state
        .services
        .with_service(endpoint_id, |s| {
            s.subs_map.find_by_service_subs_id(subscription_id).is_some()
        })
        .unwrap_or(false);
    if already_paired {
        return;
    }

    let Some(broker_instance) =
        state
            .subscriptions
            .mark_vendor_layer_subs(notify_type, path, group_id)
    else {
        // Stale: already deleted on the Broker
        subs_to_delete.push(res.resolved_path.clone());
        return;
    };

    state.services.with_service_mut(endpoint_id, |s| {
        s.subs_map
            .add(service_instance, path, subscription_id, broker_instance)
    });
}
