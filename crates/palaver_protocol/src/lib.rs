/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const OBJECT_USER: &str = "User";
pub const OBJECT_CALL: &str = "Call";

pub const ACTION_ADD: &str = "add";
pub const ACTION_REMOVE: &str = "remove";
pub const ACTION_OFFER: &str = "offer";
pub const ACTION_ACCEPTED: &str = "accepted";
pub const ACTION_INVITE: &str = "invite";
pub const ACTION_ANSWER: &str = "answer";
pub const ACTION_FAILED: &str = "failed";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One text frame on the signaling channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SignalEnvelope {
    pub object: String,
    pub action: String,
    #[serde(default)]
    pub data: String,
}

impl SignalEnvelope {
    pub fn new(object: &str, action: &str, data: impl Into<String>) -> Self {
        Self {
            object: object.to_string(),
            action: action.to_string(),
            data: data.into(),
        }
    }

    pub fn user_add(username: &str) -> Self {
        Self::new(OBJECT_USER, ACTION_ADD, username)
    }

    pub fn user_remove(username: &str) -> Self {
        Self::new(OBJECT_USER, ACTION_REMOVE, username)
    }

    /// `Data` is the invitation as plain JSON, not base64.
    pub fn invite(invitation: &Invitation) -> Result<Self, DecodeError> {
        Ok(Self::new(OBJECT_CALL, ACTION_INVITE, serde_json::to_string(invitation)?))
    }

    /// `encoded_answer` is already base64-of-JSON.
    pub fn answer(encoded_answer: &str) -> Self {
        Self::new(OBJECT_CALL, ACTION_ANSWER, encoded_answer)
    }

    pub fn failed(reason: &str) -> Self {
        Self::new(OBJECT_CALL, ACTION_FAILED, reason)
    }

    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SessionOffer {
    #[serde(default)]
    pub users: Vec<String>,
    pub local_description: String,
}

impl SessionOffer {
    pub fn encode(&self) -> Result<String, DecodeError> {
        encode_b64_json(self)
    }

    /// Accepts base64-of-JSON as well as the bare JSON document the browser
    /// client sends.
    pub fn decode(data: &str) -> Result<Self, DecodeError> {
        let trimmed = data.trim();
        if trimmed.starts_with('{') {
            return Ok(serde_json::from_str(trimmed)?);
        }
        decode_b64_json(trimmed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Invitation {
    /// Username of the inviting user.
    pub guest: String,
    pub conference: String,
}

impl Invitation {
    pub fn new(conference: &str, guest: &str) -> Self {
        Self {
            guest: guest.to_string(),
            conference: conference.to_string(),
        }
    }
}

pub fn encode_b64_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DecodeError> {
    let json = serde_json::to_vec(value)?;
    Ok(B64.encode(json))
}

pub fn decode_b64_json<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let bytes = B64.decode(text.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}
