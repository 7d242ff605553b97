// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Opaque identifiers that scope stored data.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the environment events are recorded into.
///
/// Supplied by the host when recording starts; never generated locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl std::fmt::Display for EnvironmentId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for EnvironmentId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

impl From<String> for EnvironmentId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

macro_rules! uuid_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub Uuid);

		impl $name {
			#[must_use]
			pub fn new() -> Self {
				Self(Uuid::now_v7())
			}

			#[must_use]
			pub fn as_uuid(&self) -> &Uuid {
				&self.0
			}
		}

		impl Default for $name {
			fn default() -> Self {
				Self::new()
			}
		}

		impl std::fmt::Display for $name {
			fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl std::str::FromStr for $name {
			type Err = uuid::Error;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Ok(Self(Uuid::parse_str(s)?))
			}
		}
	};
}

uuid_id!(
	/// Internal identifier of a user; distinct from the host-supplied identity.
	UserId
);
uuid_id!(
	/// Identifier of a single session.
	SessionId
);
uuid_id!(
	/// Identifier of a pageview.
	PageviewId
);
uuid_id!(
	/// Identifier of a message envelope.
	MessageId
);
