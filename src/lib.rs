// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod daemonize;
pub mod helper;
pub mod models;
pub mod server;
pub mod state_machine;
pub mod utils;
