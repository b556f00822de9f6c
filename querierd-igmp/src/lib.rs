//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod consts;
pub mod debug;
pub mod error;
pub mod events;
pub mod group;
pub mod ibus;
pub mod instance;
pub mod interface;
pub mod network;
pub mod northbound;
pub mod packet;
pub mod tasks;
