/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod conference;
pub mod config;
pub mod http;
pub mod media_relay;
pub mod presence;
pub mod registry;
pub mod session;
pub mod webrtc_relay;
