// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::NativeErrorAction;

/// Capability class that identifies the dedicated communication locale by default.
pub const DEFAULT_LOCALE_KIND: &str = "Interconnect";

/// Special role tag applied to the dedicated communication locale by default.
pub const DEFAULT_SPECIAL_TAG: &str = "COMM";

/// Name given to the dedicated communication thread by default.
pub const DEFAULT_THREAD_NAME: &str = "comm-funnel";

/// Collects the settings of one communication subsystem instance before it is started.
///
/// # Examples
///
/// ```
/// use comm_funnel::{FunnelConfig, NativeErrorAction};
///
/// let config = FunnelConfig::new()
///     .with_thread_name("rank0-comm")
///     .with_native_error_action(NativeErrorAction::Panic)
///     .with_instrumentation(true);
///
/// assert_eq!(config.thread_name(), "rank0-comm");
/// assert_eq!(config.locale_kind(), "Interconnect");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunnelConfig {
    locale_kind: String,
    special_tag: String,
    thread_name: String,
    native_error_action: NativeErrorAction,
    instrumentation: bool,
}

impl FunnelConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locale_kind: DEFAULT_LOCALE_KIND.to_string(),
            special_tag: DEFAULT_SPECIAL_TAG.to_string(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            native_error_action: NativeErrorAction::default(),
            instrumentation: false,
        }
    }

    /// Sets the capability class that the dedicated locale is discovered by.
    #[must_use]
    pub fn with_locale_kind(mut self, kind: impl Into<String>) -> Self {
        self.locale_kind = kind.into();
        self
    }

    /// Sets the role tag applied to the dedicated locale once discovered.
    #[must_use]
    pub fn with_special_tag(mut self, tag: impl Into<String>) -> Self {
        self.special_tag = tag.into();
        self
    }

    /// Sets the name of the dedicated communication thread.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets what happens when a native communication call fails.
    #[must_use]
    pub const fn with_native_error_action(mut self, action: NativeErrorAction) -> Self {
        self.native_error_action = action;
        self
    }

    /// Enables or disables recording of begin/end events around every entry point.
    #[must_use]
    pub const fn with_instrumentation(mut self, enabled: bool) -> Self {
        self.instrumentation = enabled;
        self
    }

    #[must_use]
    pub fn locale_kind(&self) -> &str {
        &self.locale_kind
    }

    #[must_use]
    pub fn special_tag(&self) -> &str {
        &self.special_tag
    }

    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    #[must_use]
    pub const fn native_error_action(&self) -> NativeErrorAction {
        self.native_error_action
    }

    #[must_use]
    pub const fn instrumentation(&self) -> bool {
        self.instrumentation
    }
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self::new()
    }
}
