// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP delivery of user records and message batches.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

use loom_capture_core::sdk::{SDK_NAME, SDK_VERSION};
use loom_capture_core::{
	CaptureConfig, EnvironmentId, IdentifyPayload, LibraryInfo, UserId, UserPropertiesPayload,
};

use crate::error::CaptureError;

const ADD_USER_PROPERTIES_PATH: &str = "api/capture/v2/add_user_properties";
const IDENTIFY_PATH: &str = "api/capture/v2/identify";
const TRACK_PATH: &str = "api/capture/v2/track";

/// Header carrying the environment id on every upload.
pub const ENV_ID_HEADER: &str = "X-Loom-Env-Id";

/// How an upload request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
	/// The request never got a response (connect error, timeout, broken body).
	#[error("network failure: {0}")]
	NetworkFailure(String),

	/// The server rejected the payload. Sending it again will not help.
	#[error("bad request ({status})")]
	BadRequest { status: u16 },

	/// Any other non-success response.
	#[error("unexpected server response ({status})")]
	UnexpectedServerResponse { status: u16 },

	/// The local queue could not be read or updated.
	#[error("store error: {0}")]
	Store(String),
}

impl UploadError {
	/// True for failures that end the pass and are retried later.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, UploadError::BadRequest { .. })
	}

	pub fn from_status(status: StatusCode) -> Option<Self> {
		if status.is_success() {
			None
		} else if status.is_client_error() {
			Some(UploadError::BadRequest {
				status: status.as_u16(),
			})
		} else {
			Some(UploadError::UnexpectedServerResponse {
				status: status.as_u16(),
			})
		}
	}
}

impl From<loom_capture_store::StoreError> for UploadError {
	fn from(e: loom_capture_store::StoreError) -> Self {
		UploadError::Store(e.to_string())
	}
}

/// Who an upload is for; sent as query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadScope {
	pub env_id: EnvironmentId,
	pub user_id: UserId,
	pub identity: Option<String>,
}

/// Delivers uploads to the ingestion endpoint.
#[async_trait]
pub trait UploadTransport: Send + Sync {
	async fn add_user_properties(
		&self,
		scope: &UploadScope,
		payload: &UserPropertiesPayload,
	) -> Result<(), UploadError>;

	async fn identify(&self, scope: &UploadScope, payload: &IdentifyPayload)
		-> Result<(), UploadError>;

	/// Sends a JSON array of message envelopes, already framed.
	async fn track(&self, scope: &UploadScope, batch: Vec<u8>) -> Result<(), UploadError>;
}

/// [`UploadTransport`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: Client,
	library: LibraryInfo,
	add_user_properties_url: Url,
	identify_url: Url,
	track_url: Url,
}

impl HttpTransport {
	pub fn new(config: &CaptureConfig, library: LibraryInfo) -> Result<Self, CaptureError> {
		let base = Url::parse(&config.base_url)
			.map_err(|e| CaptureError::InvalidBaseUrl(format!("{}: {e}", config.base_url)))?;
		if base.cannot_be_a_base() {
			return Err(CaptureError::InvalidBaseUrl(config.base_url.clone()));
		}
		let endpoint = |path: &str| {
			base
				.join(path)
				.map_err(|e| CaptureError::InvalidBaseUrl(format!("{}: {e}", config.base_url)))
		};

		let client = Client::builder()
			.user_agent(format!("{SDK_NAME}/{SDK_VERSION}"))
			.timeout(config.request_timeout)
			.build()?;

		Ok(Self {
			client,
			library,
			add_user_properties_url: endpoint(ADD_USER_PROPERTIES_PATH)?,
			identify_url: endpoint(IDENTIFY_PATH)?,
			track_url: endpoint(TRACK_PATH)?,
		})
	}

	async fn post(&self, url: &Url, scope: &UploadScope, body: Vec<u8>) -> Result<(), UploadError> {
		let mut query = vec![
			("a", scope.env_id.to_string()),
			("u", scope.user_id.to_string()),
		];
		if let Some(identity) = &scope.identity {
			query.push(("i", identity.clone()));
		}
		query.push(("b", self.library.name.clone()));

		debug!(url = %url, bytes = body.len(), "posting capture upload");
		let response = self
			.client
			.post(url.clone())
			.query(&query)
			.header(header::CONTENT_TYPE, "application/json")
			.header(ENV_ID_HEADER, scope.env_id.as_str())
			.body(body)
			.send()
			.await
			.map_err(|e| UploadError::NetworkFailure(e.to_string()))?;

		match UploadError::from_status(response.status()) {
			None => Ok(()),
			Some(e) => {
				debug!(url = %url, status = response.status().as_u16(), "capture upload rejected");
				Err(e)
			}
		}
	}
}

#[async_trait]
impl UploadTransport for HttpTransport {
	async fn add_user_properties(
		&self,
		scope: &UploadScope,
		payload: &UserPropertiesPayload,
	) -> Result<(), UploadError> {
		let body = serde_json::to_vec(payload).map_err(|_| UploadError::BadRequest { status: 0 })?;
		self.post(&self.add_user_properties_url, scope, body).await
	}

	async fn identify(
		&self,
		scope: &UploadScope,
		payload: &IdentifyPayload,
	) -> Result<(), UploadError> {
		let body = serde_json::to_vec(payload).map_err(|_| UploadError::BadRequest { status: 0 })?;
		self.post(&self.identify_url, scope, body).await
	}

	async fn track(&self, scope: &UploadScope, batch: Vec<u8>) -> Result<(), UploadError> {
		self.post(&self.track_url, scope, batch).await
	}
}
