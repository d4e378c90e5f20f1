// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lock;
pub mod logtail;
pub mod manager;
pub mod ports;
pub mod pty;
pub mod ring;
pub mod session;
pub mod test_support;
pub mod transport;
pub mod worktree;
