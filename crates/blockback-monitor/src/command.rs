//! Logical-to-concrete command resolution.
//!
//! Some commands spend time under a provisional `x-`-prefixed name before
//! stabilizing. The registry below records, per logical command, the stable
//! verb, whether an experimental spelling exists, and which optional fields
//! carry the experimental marker. The negotiator probes the monitor's
//! advertised command set once and caches each resolution for the lifetime
//! of the session.

use crate::error::{MonitorError, Result};
use crate::{qmp, Monitor};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::OnceCell;

/// Default experimental-verb marker.
pub const EXPERIMENTAL_PREFIX: &str = "x-";

/// Registry entry for one logical command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Logical name used by the engine.
    pub logical: &'static str,
    /// Stable protocol verb.
    pub stable: &'static str,
    /// Whether a prefixed experimental spelling may exist.
    pub has_experimental: bool,
    /// Optional fields that carry the experimental marker while the verb is
    /// experimental.
    pub experimental_fields: &'static [&'static str],
}

const fn spec(logical: &'static str) -> CommandSpec {
    CommandSpec {
        logical,
        stable: logical,
        has_experimental: false,
        experimental_fields: &[],
    }
}

const fn spec_experimental(
    logical: &'static str,
    experimental_fields: &'static [&'static str],
) -> CommandSpec {
    CommandSpec {
        logical,
        stable: logical,
        has_experimental: true,
        experimental_fields,
    }
}

/// Every command the engine issues, by logical name.
pub const REGISTRY: &[CommandSpec] = &[
    spec("blockdev-create"),
    spec("blockdev-add"),
    spec("blockdev-backup"),
    spec_experimental("block-dirty-bitmap-add", &["disabled"]),
    spec_experimental("block-dirty-bitmap-disable", &[]),
    spec("block-dirty-bitmap-clear"),
    spec("block-dirty-bitmap-remove"),
    spec_experimental("block-dirty-bitmap-merge", &[]),
    spec("query-named-block-nodes"),
    spec("query-block"),
    spec("query-jobs"),
    spec("job-dismiss"),
    spec("transaction"),
    spec("debug-block-dirty-bitmap-sha256"),
];

/// Which spelling of a command the monitor supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandForm {
    /// The stable verb.
    Stable,
    /// The prefixed experimental verb.
    Experimental,
}

/// A logical command resolved against one monitor session.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    /// Concrete verb to send.
    pub verb: String,
    /// Which spelling `verb` is.
    pub form: CommandForm,
    /// Experimental marker in effect for field normalization.
    pub prefix: String,
    /// Fields promoted to the marked form while experimental.
    pub experimental_fields: &'static [&'static str],
}

impl ResolvedCommand {
    /// Returns true when the resolved verb is the experimental spelling.
    #[must_use]
    pub const fn is_experimental(&self) -> bool {
        matches!(self.form, CommandForm::Experimental)
    }
}

/// Resolves logical command names against one monitor session.
///
/// The advertised command set is fetched once; each resolution is cached so
/// repeated lookups never re-probe the monitor.
pub struct CommandNegotiator {
    prefix: String,
    available: OnceCell<HashSet<String>>,
    cache: Mutex<HashMap<&'static str, ResolvedCommand>>,
}

impl Default for CommandNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandNegotiator {
    /// Creates a negotiator with the standard `x-` experimental marker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(EXPERIMENTAL_PREFIX)
    }

    /// Creates a negotiator with a custom experimental marker.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            available: OnceCell::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The experimental marker in effect.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolves a logical command name to the concrete verb this monitor
    /// supports.
    ///
    /// Fails with [`MonitorError::UnsupportedCommand`] when the logical name
    /// is unknown to the registry or neither spelling is advertised.
    pub async fn resolve(&self, monitor: &dyn Monitor, logical: &str) -> Result<ResolvedCommand> {
        let spec = REGISTRY
            .iter()
            .find(|s| s.logical == logical)
            .ok_or_else(|| MonitorError::UnsupportedCommand(logical.to_string()))?;

        {
            let cache = self
                .cache
                .lock()
                .map_err(|_| MonitorError::protocol("negotiator cache lock poisoned"))?;
            if let Some(hit) = cache.get(spec.logical) {
                return Ok(hit.clone());
            }
        }

        let available = self
            .available
            .get_or_try_init(|| async {
                let verbs = qmp::query_commands(monitor).await?;
                Ok::<_, MonitorError>(verbs.into_iter().collect::<HashSet<_>>())
            })
            .await?;

        let resolved = if available.contains(spec.stable) {
            ResolvedCommand {
                verb: spec.stable.to_string(),
                form: CommandForm::Stable,
                prefix: self.prefix.clone(),
                experimental_fields: spec.experimental_fields,
            }
        } else {
            let experimental = format!("{}{}", self.prefix, spec.stable);
            if spec.has_experimental && available.contains(&experimental) {
                tracing::debug!(
                    logical = spec.logical,
                    verb = %experimental,
                    "using experimental command spelling"
                );
                ResolvedCommand {
                    verb: experimental,
                    form: CommandForm::Experimental,
                    prefix: self.prefix.clone(),
                    experimental_fields: spec.experimental_fields,
                }
            } else {
                return Err(MonitorError::UnsupportedCommand(logical.to_string()));
            }
        };

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| MonitorError::protocol("negotiator cache lock poisoned"))?;
        cache.insert(spec.logical, resolved.clone());
        Ok(resolved)
    }
}
