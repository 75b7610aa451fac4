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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Marker substring present in every message id and subscription id minted
/// by the Broker. Subscription reconciliation uses it to recognize rows the
/// Broker created on a USP Service.
pub const BROKER_UNIQUE_STR: &str = "BROKER";

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Mints `BROKER-<monotonic>-<unix-seconds>` message ids. Counting starts at
/// 1 and the timestamp keeps ids fresh across a Broker restart, so stale
/// responses from a previous incarnation never match a pending request.
#[derive(Debug, Clone, Default)]
pub struct MessageIdAllocator {
    count: Arc<AtomicU32>,
}

impl MessageIdAllocator {
    pub fn next_id(&self) -> String {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}-{}", BROKER_UNIQUE_STR, count, unix_seconds())
    }
}

/// Mints `<hex-counter>-<hex-unix-seconds>-BROKER` subscription ids, unique
/// on the USP Service even when different Controllers picked the same ID in
/// the Broker's subscription table.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionIdAllocator {
    count: Arc<AtomicU32>,
}

impl SubscriptionIdAllocator {
    pub fn next_id(&self) -> String {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:X}-{:X}-{}", count, unix_seconds(), BROKER_UNIQUE_STR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique_and_marked() {
        let alloc = MessageIdAllocator::default();
        let a = alloc.next_id();
        let b = alloc.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("BROKER-1-"));
        assert!(b.starts_with("BROKER-2-"));
    }

    #[test]
    fn subscription_ids_carry_the_marker() {
        let alloc = SubscriptionIdAllocator::default();
        let id = alloc.next_id();
        assert!(id.ends_with("-BROKER"));
        assert!(id.contains(BROKER_UNIQUE_STR));
    }
}
