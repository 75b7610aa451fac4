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
use usp_sdk::utils::path_utils::is_path_match;

/// Pairs a subscription in the Broker's subscription table with the row the
/// Broker created in the USP Service's subscription table. A Broker
/// subscription with several paths in its reference list produces one entry
/// per path, all with the same broker_instance.
#[derive(Debug, Clone)]
pub struct SubsMapEntry {
    pub broker_instance: u32,
    pub path: String,
    pub service_instance: u32,
    /// Allocated by the Broker; Controllers may pick colliding IDs in the
    /// Broker's own table, so those are never forwarded to Services.
    pub subscription_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SubsMap {
    entries: Vec<SubsMapEntry>,
}

impl SubsMap {
    pub fn add(
        &mut self,
        service_instance: u32,
        path: &str,
        subscription_id: &str,
        broker_instance: u32,
    ) {
        self.entries.push(SubsMapEntry {
            broker_instance,
            path: path.to_string(),
            service_instance,
            subscription_id: subscription_id.to_string(),
        });
    }

    pub fn find_by_service_subs_id(&self, subscription_id: &str) -> Option<&SubsMapEntry> {
        self.entries
            .iter()
            .find(|e| e.subscription_id == subscription_id)
    }

    pub fn find_by_broker_instance_and_path(
        &self,
        broker_instance: u32,
        path: &str,
    ) -> Option<&SubsMapEntry> {
        self.entries
            .iter()
            .find(|e| e.broker_instance == broker_instance && e.path == path)
    }

    /// Finds an entry whose path specification (absolute, partial or
    /// wildcarded) covers the given absolute path.
    pub fn find_by_path(&self, absolute_path: &str) -> Option<&SubsMapEntry> {
        self.entries
            .iter()
            .find(|e| is_path_match(absolute_path, &e.path))
    }

    pub fn remove_by_broker_instance_and_path(
        &mut self,
        broker_instance: u32,
        path: &str,
    ) -> Option<SubsMapEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.broker_instance == broker_instance && e.path == path)?;
        Some(self.entries.remove(idx))
    }

    pub fn entries(&self) -> &[SubsMapEntry] {
        &self.entries
    }

    pub fn drain(&mut self) -> Vec<SubsMapEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pairs a row in the Broker's Request table with the `(command_path,
/// command_key)` of a USP command currently executing on the Service. The
/// pair is unique per Service at any instant.
#[derive(Debug, Clone)]
pub struct ReqMapEntry {
    pub request_instance: u32,
    pub path: String,
    pub command_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReqMap {
    entries: Vec<ReqMapEntry>,
}

impl ReqMap {
    pub fn add(&mut self, request_instance: u32, path: &str, command_key: &str) {
        self.entries.push(ReqMapEntry {
            request_instance,
            path: path.to_string(),
            command_key: command_key.to_string(),
        });
    }

    pub fn find(&self, path: &str, command_key: &str) -> Option<&ReqMapEntry> {
        self.entries
            .iter()
            .find(|e| e.path == path && e.command_key == command_key)
    }

    pub fn remove(&mut self, path: &str, command_key: &str) -> Option<ReqMapEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.path == path && e.command_key == command_key)?;
        Some(self.entries.remove(idx))
    }

    pub fn entries(&self) -> &[ReqMapEntry] {
        &self.entries
    }

    pub fn drain(&mut self) -> Vec<ReqMapEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps a request message passed through to a USP Service back to its
/// originator, so the matching response can be routed on the recorded MTP
/// with the original message id restored.
#[derive(Debug, Clone)]
pub struct MsgMapEntry {
    pub broker_msg_id: String,
    pub original_msg_id: String,
    pub originator: String,
    pub mtp_conn: MtpConn,
}

#[derive(Debug, Clone, Default)]
pub struct MsgMap {
    entries: Vec<MsgMapEntry>,
}

impl MsgMap {
    pub fn add(
        &mut self,
        original_msg_id: &str,
        broker_msg_id: &str,
        originator: &str,
        mtp_conn: MtpConn,
    ) {
        self.entries.push(MsgMapEntry {
            broker_msg_id: broker_msg_id.to_string(),
            original_msg_id: original_msg_id.to_string(),
            originator: originator.to_string(),
            mtp_conn,
        });
    }

    pub fn find(&self, broker_msg_id: &str) -> Option<&MsgMapEntry> {
        self.entries
            .iter()
            .find(|e| e.broker_msg_id == broker_msg_id)
    }

    pub fn remove(&mut self, broker_msg_id: &str) -> Option<MsgMapEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.broker_msg_id == broker_msg_id)?;
        Some(self.entries.remove(idx))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
