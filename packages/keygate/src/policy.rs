//! Route policy table: which quota applies to which routes.
//!
//! Every route under `/api` belongs to exactly one [`RouteGroup`], and each
//! group has its own [`QuotaRule`]. A separate global rule is checked for
//! every gated request before the group rule.
//!
//! The table is built once at startup and never changes afterwards. Rules can
//! be overridden from a TOML file:
//!
//! ```toml
//! [global]
//! limit = "200 per hour"
//!
//! [groups.execute]
//! limit = "100 per hour"
//! key = "identity"
//! ```

use std::{collections::HashMap, fmt, path::Path, str::FromStr, time::Duration};

use color_eyre::{
    Result, Section,
    eyre::{Context, bail, ensure, eyre},
};
use serde::Deserialize;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Scope name for the global rule.
pub const GLOBAL_SCOPE: &str = "global";

/// A named set of routes sharing one quota scope.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RouteGroup {
    Auth,
    Apis,
    ApiKeys,
    Logs,
    Execute,
}

impl RouteGroup {
    /// The quota scope name used for this group's counters.
    pub fn scope(self) -> &'static str {
        self.into()
    }
}

/// How a scope derives the identity key its counters are partitioned by.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum KeyFunction {
    /// Count by caller IP, even for authenticated users.
    #[default]
    Ip,

    /// Count by authenticated user when there is one, falling back to IP.
    Identity,
}

/// A request ceiling over a window, e.g. "200 per hour".
///
/// Parses `<count> per <period>` or `<count>/<period>`, where the period is
/// a unit (`second`, `minute`, `hour`, `day`, singular or plural) optionally
/// preceded by a multiplier: `"10 per 5 minutes"`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Limit {
    pub ceiling: u64,
    pub window: Duration,
}

impl Limit {
    pub const fn new(ceiling: u64, window: Duration) -> Self {
        Self { ceiling, window }
    }

    pub const fn per_hour(ceiling: u64) -> Self {
        Self::new(ceiling, Duration::from_secs(60 * 60))
    }
}

impl FromStr for Limit {
    type Err = color_eyre::Report;

    fn from_str(input: &str) -> Result<Self> {
        let normalized = input.trim().to_ascii_lowercase();
        let Some((count, period)) = normalized
            .split_once(" per ")
            .or_else(|| normalized.split_once('/'))
        else {
            bail!("expected `<count> per <period>`, got {input:?}");
        };

        let ceiling = count
            .trim()
            .parse::<u64>()
            .with_context(|| format!("parse request count in {input:?}"))?;
        ensure!(ceiling > 0, "request count must be positive in {input:?}");

        let period = period.trim();
        let (multiplier, unit) = match period.split_once(char::is_whitespace) {
            Some((multiplier, unit)) => {
                let multiplier = multiplier
                    .parse::<u64>()
                    .with_context(|| format!("parse period multiplier in {input:?}"))?;
                (multiplier, unit.trim())
            }
            None => (1, period),
        };
        ensure!(multiplier > 0, "period must be positive in {input:?}");

        let unit_secs = match unit.strip_suffix('s').unwrap_or(unit) {
            "second" | "sec" => 1,
            "minute" | "min" => 60,
            "hour" => 60 * 60,
            "day" => 24 * 60 * 60,
            other => bail!("unknown period unit {other:?} in {input:?}"),
        };

        Ok(Self::new(ceiling, Duration::from_secs(multiplier * unit_secs)))
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.window.as_secs();
        let (amount, unit) = [(86_400, "day"), (3_600, "hour"), (60, "minute")]
            .into_iter()
            .find(|(unit_secs, _)| secs % unit_secs == 0)
            .map(|(unit_secs, unit)| (secs / unit_secs, unit))
            .unwrap_or((secs, "second"));
        match amount {
            1 => write!(f, "{} per {unit}", self.ceiling),
            _ => write!(f, "{} per {amount} {unit}s", self.ceiling),
        }
    }
}

/// A quota applied to one scope.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct QuotaRule {
    pub scope: String,
    pub ceiling: u64,
    pub window: Duration,
    pub key: KeyFunction,
}

impl QuotaRule {
    pub fn new(scope: impl Into<String>, limit: Limit, key: KeyFunction) -> Self {
        Self {
            scope: scope.into(),
            ceiling: limit.ceiling,
            window: limit.window,
            key,
        }
    }

    pub fn limit(&self) -> Limit {
        Limit::new(self.ceiling, self.window)
    }
}

impl fmt::Display for QuotaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} by {}", self.scope, self.limit(), self.key)
    }
}

/// The group rules, one field per [`RouteGroup`] so lookups can't miss.
#[derive(Clone, Debug)]
struct GroupRules {
    auth: QuotaRule,
    apis: QuotaRule,
    api_keys: QuotaRule,
    logs: QuotaRule,
    execute: QuotaRule,
}

/// Static mapping from route group to quota rule, plus the global rule.
#[derive(Clone, Debug)]
pub struct PolicyTable {
    global: QuotaRule,
    groups: GroupRules,
}

impl PolicyTable {
    /// Build a table from a global rule and one rule per route group.
    ///
    /// Every [`RouteGroup`] must have a rule; a missing group is a
    /// configuration error rather than something discovered per request.
    pub fn new(global: QuotaRule, mut groups: HashMap<RouteGroup, QuotaRule>) -> Result<Self> {
        let missing = RouteGroup::iter()
            .filter(|group| !groups.contains_key(group))
            .map(|group| group.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(eyre!("route groups without a quota rule: {}", missing.join(", "))
                .suggestion("Add a `[groups.<name>]` table for each group to the policy file"));
        }

        let mut take = |group: RouteGroup| {
            groups
                .remove(&group)
                .ok_or_else(|| eyre!("route group without a quota rule: {group}"))
        };
        let groups = GroupRules {
            auth: take(RouteGroup::Auth)?,
            apis: take(RouteGroup::Apis)?,
            api_keys: take(RouteGroup::ApiKeys)?,
            logs: take(RouteGroup::Logs)?,
            execute: take(RouteGroup::Execute)?,
        };

        Ok(Self { global, groups })
    }

    /// Load the default table with overrides from a TOML policy file.
    #[tracing::instrument(name = "PolicyTable::load")]
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read policy file {path:?}"))?;
        Self::from_toml(&content).with_context(|| format!("parse policy file {path:?}"))
    }

    /// Parse a TOML policy document and apply it over the defaults.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file = toml::from_str::<PolicyFile>(content)?;
        let defaults = Self::default();

        let global = match file.global {
            Some(config) => config.apply(defaults.global.clone())?,
            None => defaults.global.clone(),
        };

        let mut overrides = file.groups;
        let groups = RouteGroup::iter()
            .map(|group| {
                let base = defaults.lookup(group).clone();
                let rule = match overrides.remove(&group) {
                    Some(config) => config
                        .apply(base)
                        .with_context(|| format!("rule for group {group}"))?,
                    None => base,
                };
                Ok((group, rule))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Self::new(global, groups)
    }

    /// The rule checked for every gated request.
    pub fn global(&self) -> &QuotaRule {
        &self.global
    }

    /// The rule for a route group.
    pub fn lookup(&self, group: RouteGroup) -> &QuotaRule {
        match group {
            RouteGroup::Auth => &self.groups.auth,
            RouteGroup::Apis => &self.groups.apis,
            RouteGroup::ApiKeys => &self.groups.api_keys,
            RouteGroup::Logs => &self.groups.logs,
            RouteGroup::Execute => &self.groups.execute,
        }
    }

    /// All rules, global first, then groups in declaration order.
    pub fn rules(&self) -> impl Iterator<Item = &QuotaRule> {
        std::iter::once(&self.global).chain(RouteGroup::iter().map(|group| self.lookup(group)))
    }
}

impl Default for PolicyTable {
    /// The baseline policy; every scope counts by caller IP.
    fn default() -> Self {
        let rule = |scope: &str, per_hour: u64| {
            QuotaRule::new(scope, Limit::per_hour(per_hour), KeyFunction::Ip)
        };
        let group = |group: RouteGroup, per_hour: u64| rule(group.scope(), per_hour);
        Self {
            global: rule(GLOBAL_SCOPE, 200),
            groups: GroupRules {
                auth: group(RouteGroup::Auth, 50),
                apis: group(RouteGroup::Apis, 150),
                api_keys: group(RouteGroup::ApiKeys, 200),
                logs: group(RouteGroup::Logs, 200),
                execute: group(RouteGroup::Execute, 100),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    #[serde(default)]
    global: Option<RuleConfig>,

    #[serde(default)]
    groups: HashMap<RouteGroup, RuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleConfig {
    limit: Option<String>,
    key: Option<KeyFunction>,
}

impl RuleConfig {
    fn apply(self, base: QuotaRule) -> Result<QuotaRule> {
        let limit = match self.limit {
            Some(limit) => limit.parse::<Limit>()?,
            None => base.limit(),
        };
        Ok(QuotaRule::new(base.scope, limit, self.key.unwrap_or(base.key)))
    }
}
