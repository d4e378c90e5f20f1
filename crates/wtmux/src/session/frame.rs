// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control frames sent to viewers as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Scrollback follows; the viewer should reset before rendering it.
    #[serde(rename = "pty:replay")]
    Replay,
    #[serde(rename = "pty:exit")]
    Exit { code: i32 },
    #[serde(rename = "log:clear")]
    LogCleared,
    #[serde(rename = "log:no-file")]
    LogNoFile,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ControlFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Control frames a viewer may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Resize { cols: u16, rows: u16 },
    Kill,
    Clear,
}

/// A decoded viewer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes for the process, forwarded verbatim.
    Input(Bytes),
    Control(ClientFrame),
}

impl Inbound {
    /// Classify a viewer message.
    ///
    /// Only a message that starts with `{` and parses as a [`ClientFrame`] is
    /// a control frame. Anything else, including other JSON, is input.
    pub fn decode(data: Bytes) -> Self {
        if data.first() == Some(&b'{') {
            if let Ok(frame) = serde_json::from_slice::<ClientFrame>(&data) {
                return Self::Control(frame);
            }
        }
        Self::Input(data)
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
