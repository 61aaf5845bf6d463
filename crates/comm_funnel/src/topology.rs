// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal locality graph: the host runtime's view of where work can be placed.
//!
//! The communication subsystem only needs two queries from it: enumerate the locales of a
//! capability class, and mark one locale with a special role tag.

use std::fmt;

use crate::{Error, Result};

/// Identifies a locale within a [`Topology`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocaleId(usize);

impl fmt::Display for LocaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A capability class registered with a [`Topology`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocaleKind(String);

impl LocaleKind {
    /// Name of the capability class.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A place where work can run, e.g. a group of cores or a network interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locale {
    id: LocaleId,
    name: String,
    kind: String,
    special: Option<String>,
}

impl Locale {
    /// Position of this locale within its topology.
    #[must_use]
    pub const fn id(&self) -> LocaleId {
        self.id
    }

    /// Human-readable name supplied by the host.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the capability class this locale belongs to.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The special role tag this locale carries, if any.
    #[must_use]
    pub fn special(&self) -> Option<&str> {
        self.special.as_deref()
    }
}

/// The set of locales known to the host runtime.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    locales: Vec<Locale>,
    kinds: Vec<String>,
}

impl Topology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-node topology with one `Core` locale for application tasks and one
    /// `Interconnect` locale for the network.
    #[must_use]
    pub fn single_node() -> Self {
        Self::new()
            .with_locale("cores", "Core")
            .with_locale("nic", crate::DEFAULT_LOCALE_KIND)
    }

    /// Adds a locale and returns its id.
    pub fn add_locale(&mut self, name: impl Into<String>, kind: impl Into<String>) -> LocaleId {
        let id = LocaleId(self.locales.len());

        self.locales.push(Locale {
            id,
            name: name.into(),
            kind: kind.into(),
            special: None,
        });

        id
    }

    /// Adds a locale, builder-style.
    #[must_use]
    pub fn with_locale(mut self, name: impl Into<String>, kind: impl Into<String>) -> Self {
        self.add_locale(name, kind);
        self
    }

    /// Registers a capability class so it can be queried. Registering a class twice is harmless.
    pub fn register_kind(&mut self, name: &str) -> LocaleKind {
        if !self.kinds.iter().any(|k| k == name) {
            self.kinds.push(name.to_string());
        }

        LocaleKind(name.to_string())
    }

    /// Whether a capability class with this name has been registered.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.kinds.iter().any(|k| k == name)
    }

    /// Every locale that belongs to `kind`, in the order they were added.
    #[must_use]
    pub fn locales_of_kind(&self, kind: &LocaleKind) -> Vec<LocaleId> {
        self.locales.iter().filter(|l| l.kind == kind.0).map(|l| l.id).collect()
    }

    /// Tags `id` with a special role.
    ///
    /// # Errors
    ///
    /// Fails if the locale does not exist or already carries a tag.
    pub fn mark_special(&mut self, id: LocaleId, tag: impl Into<String>) -> Result<()> {
        let locale = self.locales.get_mut(id.0).ok_or(Error::UnknownLocale(id))?;

        if let Some(existing) = &locale.special {
            return Err(Error::AlreadyMarked {
                locale: locale.name.clone(),
                tag: existing.clone(),
            });
        }

        locale.special = Some(tag.into());
        Ok(())
    }

    /// The locale carrying `tag`, if any.
    #[must_use]
    pub fn special(&self, tag: &str) -> Option<&Locale> {
        self.locales.iter().find(|l| l.special.as_deref() == Some(tag))
    }

    /// The locale with `id`, if it exists in this topology.
    #[must_use]
    pub fn locale(&self, id: LocaleId) -> Option<&Locale> {
        self.locales.get(id.0)
    }

    /// Every locale, in the order they were added.
    #[must_use]
    pub fn locales(&self) -> &[Locale] {
        &self.locales
    }
}
