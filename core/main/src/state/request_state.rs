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

use std::sync::{Arc, RwLock};

use usp_sdk::api::usp::{
    Notification, Notify, OperationCompleteResp, Request, ResultParamsEntry, UspMsg,
};
use usp_sdk::log::{error, info};
use usp_sdk::utils::error::UspError;

use crate::state::platform_state::PlatformState;
use crate::state::subscription_state::NotifyType;

pub const REQUEST_TABLE: &str = "Device.LocalAgent.Request.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Requested,
    Active,
}

/// One row of the Broker's Device.LocalAgent.Request table, tracking an
/// asynchronous command issued through the Broker.
#[derive(Debug, Clone)]
pub struct RequestRow {
    pub instance: u32,
    pub command_path: String,
    pub command_key: String,
    pub status: RequestStatus,
}

#[derive(Debug, Default)]
struct Inner {
    rows: Vec<RequestRow>,
    next_instance: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RequestState {
    inner: Arc<RwLock<Inner>>,
}

impl RequestState {
    pub fn add(&self, command_path: &str, command_key: &str) -> u32 {
        let mut inner = self.inner.write().unwrap();
        inner.next_instance += 1;
        let instance = inner.next_instance;
        inner.rows.push(RequestRow {
            instance,
            command_path: command_path.to_string(),
            command_key: command_key.to_string(),
            status: RequestStatus::Requested,
        });
        instance
    }

    pub fn set_active(&self, instance: u32) -> bool {
        let mut inner = self.inner.write().unwrap();
        if let Some(row) = inner.rows.iter_mut().find(|r| r.instance == instance) {
            row.status = RequestStatus::Active;
            return true;
        }
        false
    }

    pub fn command_key(&self, instance: u32) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .find(|r| r.instance == instance)
            .map(|r| r.command_key.clone())
    }

    pub fn row(&self, instance: u32) -> Option<RequestRow> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .find(|r| r.instance == instance)
            .cloned()
    }

    pub fn delete(&self, instance: u32) -> Option<RequestRow> {
        let mut inner = self.inner.write().unwrap();
        let idx = inner.rows.iter().position(|r| r.instance == instance)?;
        Some(inner.rows.remove(idx))
    }

    pub fn rows(&self) -> Vec<RequestRow> {
        self.inner.read().unwrap().rows.clone()
    }
}

fn split_command_path(command_path: &str) -> (String, String) {
    match command_path.rfind('.') {
        Some(idx) => (
            command_path[..=idx].to_string(),
            command_path[idx + 1..].to_string(),
        ),
        None => (String::new(), command_path.to_string()),
    }
}

/// Completes a Request-table row: the row is removed and an
/// OperationComplete notification is delivered to every Controller holding
/// a matching subscription on the Broker.
pub async fn signal_operation_complete(
    state: &PlatformState,
    request_instance: u32,
    failure: Option<(UspError, String)>,
    output_args: Vec<ResultParamsEntry>,
) {
    let row = match state.requests.delete(request_instance) {
        Some(row) => row,
        None => {
            error!(
                "OperationComplete for unknown request instance {}",
                request_instance
            );
            return;
        }
    };

    let (obj_path, command_name) = split_command_path(&row.command_path);
    let operation_resp = match failure {
        Some((err, err_msg)) => OperationCompleteResp::CommandFailure {
            err_code: err.to_wire_code(),
            err_msg,
        },
        None => OperationCompleteResp::OutputArgs(output_args),
    };

    let rows = state
        .subscriptions
        .matching_rows(NotifyType::OperationComplete, &row.command_path);
    if rows.is_empty() {
        info!(
            "No OperationComplete subscription for {}, completion dropped",
            row.command_path
        );
        return;
    }

    for sub in rows {
        let recipient = match sub.recipient {
            Some(r) => r,
            None => continue,
        };
        let msg = UspMsg::request(
            state.mtp.next_msg_id(),
            Request::Notify(Notify {
                subscription_id: sub.id.clone(),
                send_resp: false,
                notification: Notification::OperationComplete {
                    obj_path: obj_path.clone(),
                    command_name: command_name.clone(),
                    command_key: row.command_key.clone(),
                    operation_resp: operation_resp.clone(),
                },
            }),
        );
        if let Err(e) = recipient.mtp.queue_message(recipient.endpoint_id.clone(), msg).await {
            error!(
                "Failed to deliver OperationComplete to {}: {}",
                recipient.endpoint_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rows_lifecycle() {
        let requests = RequestState::default();
        let i1 = requests.add("Device.X.Run()", "K1");
        let i2 = requests.add("Device.X.Run()", "K2");
        assert_ne!(i1, i2);

        assert_eq!(requests.command_key(i1).unwrap(), "K1");
        assert!(requests.set_active(i1));
        assert_eq!(requests.row(i1).unwrap().status, RequestStatus::Active);

        assert!(requests.delete(i1).is_some());
        assert!(requests.delete(i1).is_none());
        assert!(!requests.set_active(i1));
    }

    #[test]
    fn command_path_split() {
        assert_eq!(
            split_command_path("Device.X.Run()"),
            ("Device.X.".to_string(), "Run()".to_string())
        );
    }
}
