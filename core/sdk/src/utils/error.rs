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

#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
pub enum UspError {
    MessageNotUnderstood,
    RequestDenied,
    Internal,
    InvalidArguments,
    ResourcesExceeded,
    PermissionDenied,
    InvalidPath,
    CommandFailure,
    ObjectDoesNotExist,
    CreationFailure,
    RegisterFailure,
    PathAlreadyRegistered,
    DeregisterFailure,
    SenderMissing,
    SendFailure,
    NoResponse,
    Wire(u32),
}

impl std::fmt::Display for UspError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UspError::MessageNotUnderstood => write!(f, "MessageNotUnderstood"),
            UspError::RequestDenied => write!(f, "RequestDenied"),
            UspError::Internal => write!(f, "Internal"),
            UspError::InvalidArguments => write!(f, "InvalidArguments"),
            UspError::ResourcesExceeded => write!(f, "ResourcesExceeded"),
            UspError::PermissionDenied => write!(f, "PermissionDenied"),
            UspError::InvalidPath => write!(f, "InvalidPath"),
            UspError::CommandFailure => write!(f, "CommandFailure"),
            UspError::ObjectDoesNotExist => write!(f, "ObjectDoesNotExist"),
            UspError::CreationFailure => write!(f, "CreationFailure"),
            UspError::RegisterFailure => write!(f, "RegisterFailure"),
            UspError::PathAlreadyRegistered => write!(f, "PathAlreadyRegistered"),
            UspError::DeregisterFailure => write!(f, "DeregisterFailure"),
            UspError::SenderMissing => write!(f, "SenderMissing"),
            UspError::SendFailure => write!(f, "SendFailure"),
            UspError::NoResponse => write!(f, "NoResponse"),
            UspError::Wire(code) => write!(f, "Wire({})", code),
        }
    }
}

impl UspError {
    /// Numeric code carried in USP Error messages and per-path results.
    pub fn to_wire_code(&self) -> u32 {
        match self {
            UspError::MessageNotUnderstood => 7001,
            UspError::RequestDenied => 7002,
            UspError::Internal => 7003,
            UspError::InvalidArguments => 7004,
            UspError::ResourcesExceeded => 7005,
            UspError::PermissionDenied => 7006,
            UspError::InvalidPath => 7008,
            UspError::CommandFailure => 7022,
            UspError::ObjectDoesNotExist => 7016,
            UspError::CreationFailure => 7019,
            UspError::RegisterFailure => 7062,
            UspError::PathAlreadyRegistered => 7063,
            UspError::DeregisterFailure => 7064,
            // Transport failures are reported to peers as internal errors
            UspError::SenderMissing | UspError::SendFailure | UspError::NoResponse => 7003,
            UspError::Wire(code) => *code,
        }
    }

    pub fn from_wire_code(code: u32) -> UspError {
        match code {
            7001 => UspError::MessageNotUnderstood,
            7002 => UspError::RequestDenied,
            7003 => UspError::Internal,
            7004 => UspError::InvalidArguments,
            7005 => UspError::ResourcesExceeded,
            7006 => UspError::PermissionDenied,
            7008 => UspError::InvalidPath,
            7016 => UspError::ObjectDoesNotExist,
            7019 => UspError::CreationFailure,
            7022 => UspError::CommandFailure,
            7062 => UspError::RegisterFailure,
            7063 => UspError::PathAlreadyRegistered,
            7064 => UspError::DeregisterFailure,
            other => UspError::Wire(other),
        }
    }
}
