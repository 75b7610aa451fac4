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

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use usp_sdk::api::mtp::MtpConn;
use usp_sdk::utils::error::UspError;
use usp_sdk::utils::path_utils::is_path_match;
use usp_sdk::uuid::Uuid;

pub const SUBS_TABLE: &str = "Device.LocalAgent.Subscription.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    ValueChange,
    ObjectCreation,
    ObjectDeletion,
    OperationComplete,
    Event,
}

impl NotifyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyType::ValueChange => "ValueChange",
            NotifyType::ObjectCreation => "ObjectCreation",
            NotifyType::ObjectDeletion => "ObjectDeletion",
            NotifyType::OperationComplete => "OperationComplete",
            NotifyType::Event => "Event",
        }
    }

    pub fn from_str(value: &str) -> Option<NotifyType> {
        match value {
            "ValueChange" => Some(NotifyType::ValueChange),
            "ObjectCreation" => Some(NotifyType::ObjectCreation),
            "ObjectDeletion" => Some(NotifyType::ObjectDeletion),
            "OperationComplete" => Some(NotifyType::OperationComplete),
            "Event" => Some(NotifyType::Event),
            _ => None,
        }
    }
}

/// Where notifications for a subscription row are delivered.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub endpoint_id: String,
    pub mtp: MtpConn,
}

/// One row of the Broker's Device.LocalAgent.Subscription table.
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub instance: u32,
    pub id: String,
    pub enable: bool,
    pub notify_type: NotifyType,
    pub reference_list: Vec<String>,
    pub persistent: bool,
    pub recipient: Option<Recipient>,
    /// Paths of the reference list currently satisfied by a Service's own
    /// subscription table (vendor layer), keyed to the owning group.
    /// Unbound paths are delivered by the core mechanism.
    pub vendor_bound: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: Vec<SubscriptionRow>,
    next_instance: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    inner: Arc<RwLock<Inner>>,
}

impl SubscriptionState {
    /// Creates a row from the parameter settings of an Add request on the
    /// subscription table.
    pub fn add_row_from_params(
        &self,
        params: &[(String, String)],
        recipient: Option<Recipient>,
    ) -> Result<u32, UspError> {
        let lookup = |name: &str| -> Option<&str> {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let notify_type = lookup("NotifType")
            .and_then(NotifyType::from_str)
            .ok_or(UspError::InvalidArguments)?;
        let reference_list: Vec<String> = lookup("ReferenceList")
            .ok_or(UspError::InvalidArguments)?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if reference_list.is_empty() {
            return Err(UspError::InvalidArguments);
        }
        let id = lookup("ID")
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let enable = lookup("Enable").map(|v| v == "true").unwrap_or(false);
        let persistent = lookup("Persistent").map(|v| v == "true").unwrap_or(false);

        let mut inner = self.inner.write().unwrap();
        if inner.rows.iter().any(|r| r.id == id) {
            return Err(UspError::InvalidArguments);
        }
        inner.next_instance += 1;
        let instance = inner.next_instance;
        inner.rows.push(SubscriptionRow {
            instance,
            id,
            enable,
            notify_type,
            reference_list,
            persistent,
            recipient,
            vendor_bound: HashMap::new(),
        });
        Ok(instance)
    }

    pub fn delete_row(&self, instance: u32) -> Option<SubscriptionRow> {
        let mut inner = self.inner.write().unwrap();
        let idx = inner.rows.iter().position(|r| r.instance == instance)?;
        Some(inner.rows.remove(idx))
    }

    pub fn row(&self, instance: u32) -> Option<SubscriptionRow> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .find(|r| r.instance == instance)
            .cloned()
    }

    pub fn rows(&self) -> Vec<SubscriptionRow> {
        self.inner.read().unwrap().rows.clone()
    }

    pub fn instances(&self) -> Vec<u32> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .map(|r| r.instance)
            .collect()
    }

    pub fn param_value(&self, instance: u32, name: &str) -> Option<String> {
        let row = self.row(instance)?;
        match name {
            "ID" => Some(row.id),
            "Enable" => Some(row.enable.to_string()),
            "NotifType" => Some(row.notify_type.as_str().to_string()),
            "ReferenceList" => Some(row.reference_list.join(",")),
            "Persistent" => Some(row.persistent.to_string()),
            _ => None,
        }
    }

    /// Binds the first enabled, unbound subscription matching the type and
    /// path to the vendor layer of `group_id`, returning its instance.
    pub fn mark_vendor_layer_subs(
        &self,
        notify_type: NotifyType,
        path: &str,
        group_id: usize,
    ) -> Option<u32> {
        let mut inner = self.inner.write().unwrap();
        let row = inner.rows.iter_mut().find(|r| {
            r.enable
                && r.notify_type == notify_type
                && r.reference_list.iter().any(|p| p == path)
                && !r.vendor_bound.contains_key(path)
        })?;
        row.vendor_bound.insert(path.to_string(), group_id);
        Some(row.instance)
    }

    /// Updates one parameter of a row. Vendor-layer bookkeeping catches up
    /// at the next reconciliation with the owning Service.
    pub fn set_param(&self, instance: u32, name: &str, value: &str) -> Result<(), UspError> {
        let mut inner = self.inner.write().unwrap();
        let row = inner
            .rows
            .iter_mut()
            .find(|r| r.instance == instance)
            .ok_or(UspError::ObjectDoesNotExist)?;
        match name {
            "ID" => row.id = value.to_string(),
            "Enable" => row.enable = value == "true",
            "Persistent" => row.persistent = value == "true",
            "NotifType" => {
                row.notify_type = NotifyType::from_str(value).ok_or(UspError::InvalidArguments)?
            }
            "ReferenceList" => {
                row.reference_list = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "TimeToLive" | "NotifRetry" | "NotifExpiration" => {}
            _ => return Err(UspError::InvalidArguments),
        }
        Ok(())
    }

    /// Binds one path of a specific row to the vendor layer of a group.
    pub fn bind_path(&self, broker_instance: u32, path: &str, group_id: usize) {
        let mut inner = self.inner.write().unwrap();
        if let Some(row) = inner
            .rows
            .iter_mut()
            .find(|r| r.instance == broker_instance)
        {
            row.vendor_bound.insert(path.to_string(), group_id);
        }
    }

    /// Returns a vendor-bound path of a row to core delivery.
    pub fn remove_vendor_binding(&self, broker_instance: u32, path: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(row) = inner
            .rows
            .iter_mut()
            .find(|r| r.instance == broker_instance)
        {
            row.vendor_bound.remove(path);
        }
    }

    /// Demotes every subscription bound to `group_id` back to core
    /// delivery, used when the owning Service goes away.
    pub fn free_all_for_group(&self, group_id: usize) {
        let mut inner = self.inner.write().unwrap();
        for row in inner.rows.iter_mut() {
            row.vendor_bound.retain(|_, g| *g != group_id);
        }
    }

    /// (instance, notify_type, path) of every enabled subscription path not
    /// yet satisfied by any vendor layer. The caller filters by schema
    /// ownership before creating them on a Service.
    pub fn unbound_enabled_paths(&self) -> Vec<(u32, NotifyType, String)> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for row in &inner.rows {
            if !row.enable {
                continue;
            }
            for path in &row.reference_list {
                if !row.vendor_bound.contains_key(path) {
                    out.push((row.instance, row.notify_type, path.clone()));
                }
            }
        }
        out
    }

    /// Enabled rows of the given type whose reference list covers the
    /// absolute path, for delivering notifications to their creators.
    pub fn matching_rows(&self, notify_type: NotifyType, absolute_path: &str) -> Vec<SubscriptionRow> {
        self.inner
            .read()
            .unwrap()
            .rows
            .iter()
            .filter(|r| {
                r.enable
                    && r.notify_type == notify_type
                    && r.reference_list
                        .iter()
                        .any(|spec| is_path_match(absolute_path, spec))
            })
            .cloned()
            .collect()
    }
}
