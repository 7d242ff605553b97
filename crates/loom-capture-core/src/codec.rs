// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Length-prefixed record encoding for queued messages.
//!
//! A record is a big-endian `u32` byte count followed by the JSON envelope.
//! Upload batches are JSON arrays assembled from record bodies without
//! re-encoding them.

use crate::error::{CoreError, Result};
use crate::message::Message;

/// Size of the length prefix in bytes.
pub const RECORD_HEADER_LEN: usize = 4;

/// Encodes a message into a length-prefixed record.
pub fn encode_record(message: &Message) -> Result<Vec<u8>> {
	let body = serde_json::to_vec(message)?;
	let len = u32::try_from(body.len())
		.map_err(|_| CoreError::MalformedRecord(format!("body of {} bytes is too large", body.len())))?;

	let mut record = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
	record.extend_from_slice(&len.to_be_bytes());
	record.extend_from_slice(&body);
	Ok(record)
}

/// Returns the envelope bytes of a record after validating its prefix.
pub fn record_body(record: &[u8]) -> Result<&[u8]> {
	if record.len() < RECORD_HEADER_LEN {
		return Err(CoreError::MalformedRecord(format!(
			"record of {} bytes has no length prefix",
			record.len()
		)));
	}
	let (header, body) = record.split_at(RECORD_HEADER_LEN);
	let mut prefix = [0u8; RECORD_HEADER_LEN];
	prefix.copy_from_slice(header);
	let declared = u32::from_be_bytes(prefix) as usize;
	if declared != body.len() {
		return Err(CoreError::MalformedRecord(format!(
			"declared {declared} bytes but found {}",
			body.len()
		)));
	}
	Ok(body)
}

/// Decodes a length-prefixed record back into a message.
pub fn decode_record(record: &[u8]) -> Result<Message> {
	Ok(serde_json::from_slice(record_body(record)?)?)
}

/// Assembles records into a JSON array upload body.
pub fn frame_batch<'a, I>(records: I) -> Result<Vec<u8>>
where
	I: IntoIterator<Item = &'a [u8]>,
{
	let mut body = Vec::new();
	body.push(b'[');
	for (idx, record) in records.into_iter().enumerate() {
		if idx > 0 {
			body.push(b',');
		}
		body.extend_from_slice(record_body(record)?);
	}
	body.push(b']');
	Ok(body)
}
