//! Execution contexts - the isolated runtime surfaces being observed.

use std::fmt;
use std::str::FromStr;

/// Logical role of an execution context.
///
/// The bridge reports contexts as loosely-typed kind strings. They are mapped
/// onto this closed set at ingestion; anything unrecognised is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ContextRole {
    /// Long-lived background worker (service worker, background page).
    BackgroundWorker,
    /// Script running inside a page (content script, frame).
    PageScript,
    /// Worker without a visible surface (offscreen document, dedicated worker).
    OffscreenWorker,
    /// User-facing surface (popup, side panel, options page).
    UiSurface,
}

impl ContextRole {
    /// All roles, in display order.
    pub const ALL: [ContextRole; 4] = [
        ContextRole::BackgroundWorker,
        ContextRole::PageScript,
        ContextRole::OffscreenWorker,
        ContextRole::UiSurface,
    ];

    /// Map a bridge kind string onto a role.
    ///
    /// Matching is case-insensitive and treats `-` and `_` alike.
    pub fn from_bridge_kind(kind: &str) -> Option<Self> {
        let normalized = kind.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "service_worker" | "background_page" | "background" | "background_worker" => {
                Some(ContextRole::BackgroundWorker)
            }
            "page" | "content_script" | "iframe" | "page_script" => Some(ContextRole::PageScript),
            "offscreen" | "offscreen_document" | "worker" | "shared_worker"
            | "offscreen_worker" => Some(ContextRole::OffscreenWorker),
            "popup" | "side_panel" | "options" | "devtools" | "ui_surface" => {
                Some(ContextRole::UiSurface)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextRole::BackgroundWorker => "background_worker",
            ContextRole::PageScript => "page_script",
            ContextRole::OffscreenWorker => "offscreen_worker",
            ContextRole::UiSurface => "ui_surface",
        }
    }
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role string is not part of the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown context role '{}'", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for ContextRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContextRole::from_bridge_kind(s).ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// A tracked execution context.
///
/// Identity persists for the whole session so that alerts, routes and
/// propagation chains can keep referring to it after it goes quiet.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutionContext {
    /// Stable identifier assigned by the bridge.
    pub id: String,
    pub role: ContextRole,
    /// URL or document the context is attached to, when the bridge reports one.
    pub url: Option<String>,
    pub is_active: bool,
    /// Last successful probe, in milliseconds since Unix epoch.
    pub last_activity_ms: u64,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
}

impl ExecutionContext {
    /// Create a context from its first successful probe.
    pub fn new(id: impl Into<String>, role: ContextRole, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            role,
            url: None,
            is_active: true,
            last_activity_ms: now_ms,
            consecutive_failures: 0,
        }
    }

    /// Attach the URL reported by the bridge.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Record a successful probe. Reactivates an inactive context.
    pub fn record_success(&mut self, now_ms: u64) {
        self.is_active = true;
        self.consecutive_failures = 0;
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
    }

    /// Record a failed probe.
    ///
    /// Returns `true` if this failure is the one that deactivated the context.
    pub fn record_failure(&mut self, inactive_after: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.is_active && self.consecutive_failures >= inactive_after.max(1) {
            self.is_active = false;
            return true;
        }
        false
    }
}
