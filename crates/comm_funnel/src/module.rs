// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::debug;

use crate::{Error, Fabric, Funnel, FunnelConfig, FunnelStats, LocaleId, LocaleKind, Result, Topology};

/// Lifecycle hooks through which a host runtime integrates the communication subsystem.
///
/// The host calls [`pre_initialize()`][Self::pre_initialize] while it is still assembling its
/// topology, [`post_initialize()`][Self::post_initialize] once the topology is final, and
/// [`finalize()`][Self::finalize] at shutdown.
///
/// Every error returned by these hooks describes a host integration mistake or an environment
/// failure. The subsystem cannot run in that state and hosts are expected to treat the errors
/// as fatal.
///
/// # Examples
///
/// ```
/// use comm_funnel::{CommModule, FunnelConfig, LocalCluster, Topology};
///
/// let mut topology = Topology::new()
///     .with_locale("cores", "Core")
///     .with_locale("nic0", "Interconnect");
///
/// let mut module = CommModule::new(FunnelConfig::new());
/// module.pre_initialize(&mut topology);
///
/// let cluster = LocalCluster::new(1);
/// let funnel = module.post_initialize(&mut topology, cluster.fabric(0)).unwrap();
///
/// assert_eq!(topology.special("COMM").unwrap().name(), "nic0");
///
/// CommModule::finalize(funnel);
/// ```
#[derive(Debug)]
pub struct CommModule {
    config: FunnelConfig,
    kind: Option<LocaleKind>,
    bound: Option<LocaleId>,
}

impl CommModule {
    /// Name under which the module registers with a host runtime.
    pub const NAME: &'static str = "comm";

    /// Creates a module that will bind the dedicated locale described by `config`.
    #[must_use]
    pub const fn new(config: FunnelConfig) -> Self {
        Self {
            config,
            kind: None,
            bound: None,
        }
    }

    /// Registers the capability class of the dedicated communication locale.
    pub fn pre_initialize(&mut self, topology: &mut Topology) {
        let kind = topology.register_kind(self.config.locale_kind());
        debug!(kind = kind.name(), "registered dedicated communication locale class");

        self.kind = Some(kind);
    }

    /// Discovers and binds the single dedicated communication locale, starts the dedicated
    /// resource on it and initializes the native library there in funneled mode.
    ///
    /// # Errors
    ///
    /// Fails if pre-initialization was skipped, if this module or another one already bound a
    /// dedicated locale in `topology`, if the topology does not contain exactly one locale of
    /// the capability class, if the dedicated thread cannot be started or if the native library
    /// does not provide funneled thread support.
    pub fn post_initialize<F: Fabric>(&mut self, topology: &mut Topology, fabric: F) -> Result<Funnel<F>> {
        let kind = self.kind.as_ref().ok_or(Error::NotPreInitialized)?;

        if let Some(bound) = self.bound {
            return Err(Error::AlreadyInitialized(bound));
        }

        if let Some(existing) = topology.special(self.config.special_tag()) {
            return Err(Error::AlreadyInitialized(existing.id()));
        }

        let candidates = topology.locales_of_kind(kind);
        let [id] = candidates[..] else {
            return Err(Error::DedicatedLocaleCount {
                kind: kind.name().to_string(),
                found: candidates.len(),
            });
        };

        topology.mark_special(id, self.config.special_tag())?;
        let locale = topology.locale(id).cloned().ok_or(Error::UnknownLocale(id))?;

        let funnel = Funnel::launch(self.config.clone(), fabric, locale)?;
        self.bound = Some(id);

        Ok(funnel)
    }

    /// Waits for outstanding operations, shuts the native library down and stops the dedicated
    /// resource. Returns the final completion-tracking counters.
    pub fn finalize<F: Fabric>(funnel: Funnel<F>) -> FunnelStats {
        funnel.finalize()
    }
}
