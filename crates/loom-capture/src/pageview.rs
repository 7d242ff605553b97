// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Pageview handles returned to hosts and integrations.

use std::fmt;
use std::sync::{Arc, Weak};

use loom_capture_core::{LibraryInfo, PageviewInfo, Properties, SessionInfo};

use crate::sources::RuntimeBridge;

/// Details supplied when tracking a pageview.
#[derive(Debug, Clone, Default)]
pub struct PageviewProperties {
	pub component: Option<String>,
	pub title: Option<String>,
	pub url: Option<String>,
	/// Source-specific properties, sanitized like event properties.
	pub source_properties: Properties,
}

/// A pageview reference used to attribute events.
///
/// [`Pageview::None`] requests the session's unattributed pageview explicitly,
/// as opposed to passing no pageview at all.
#[derive(Clone, Default)]
pub enum Pageview {
	#[default]
	None,
	Concrete(Arc<ConcretePageview>),
}

/// A pageview that was tracked in some session.
pub struct ConcretePageview {
	pub session_info: SessionInfo,
	pub pageview_info: PageviewInfo,
	pub source_library: Option<LibraryInfo>,
	pub properties: PageviewProperties,
	bridge: Option<Weak<dyn RuntimeBridge>>,
}

impl Pageview {
	pub(crate) fn new(
		session_info: SessionInfo,
		pageview_info: PageviewInfo,
		source_library: Option<LibraryInfo>,
		properties: PageviewProperties,
		bridge: Option<&Arc<dyn RuntimeBridge>>,
	) -> Self {
		Pageview::Concrete(Arc::new(ConcretePageview {
			session_info,
			pageview_info,
			source_library,
			properties,
			bridge: bridge.map(Arc::downgrade),
		}))
	}

	pub fn is_none(&self) -> bool {
		matches!(self, Pageview::None)
	}

	pub fn concrete(&self) -> Option<&ConcretePageview> {
		match self {
			Pageview::None => None,
			Pageview::Concrete(inner) => Some(inner),
		}
	}

	pub fn session_info(&self) -> Option<&SessionInfo> {
		self.concrete().map(|p| &p.session_info)
	}

	pub fn pageview_info(&self) -> Option<&PageviewInfo> {
		self.concrete().map(|p| &p.pageview_info)
	}
}

impl ConcretePageview {
	/// The bridge that tracked this pageview, if it is still alive.
	pub fn bridge(&self) -> Option<Arc<dyn RuntimeBridge>> {
		self.bridge.as_ref().and_then(Weak::upgrade)
	}

	/// True when a bridge tracked this pageview, alive or not.
	pub fn is_from_bridge(&self) -> bool {
		self.bridge.is_some()
	}
}

impl fmt::Debug for Pageview {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Pageview::None => f.write_str("Pageview::None"),
			Pageview::Concrete(inner) => f
				.debug_struct("Pageview")
				.field("session_id", &inner.session_info.id)
				.field("pageview_id", &inner.pageview_info.id)
				.field("source", &inner.source_library.as_ref().map(|l| &l.name))
				.field("from_bridge", &inner.is_from_bridge())
				.finish(),
		}
	}
}
