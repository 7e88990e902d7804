//! Cron scheduler: materializes tasks from schedule rules.
//!
//! Each enabled rule owns a live entry (parsed expression, timezone,
//! next fire time). A 1 s tick fires due entries: the referenced template
//! task is cloned into a fresh submission (name prefixed `[scheduled]`)
//! and handed to the dispatcher through the narrow [`TaskSubmitter`]
//! interface, which also breaks the manager <-> scheduler construction
//! cycle. A 5-minute self-heal pass re-checks that every enabled rule
//! still has a live entry and that no stale entries linger.
//!
//! Expressions use the 6/7-field format of the `cron` crate; standard
//! 5-field input is normalized by prepending a seconds field.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dragnet_store::{ScheduleRule, Store, StoreError, Task};

use crate::config::CronConfig;
use crate::dispatch::{Dispatcher, NewTask};
use crate::error::{OrchestrateError, Result};

/// Prefix applied to task names materialized from schedule rules.
pub const SCHEDULED_NAME_PREFIX: &str = "[scheduled]";

/// Narrow submission interface the cron scheduler depends on.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit(&self, new_task: NewTask) -> Result<Task>;
}

#[async_trait]
impl TaskSubmitter for Dispatcher {
    async fn submit(&self, new_task: NewTask) -> Result<Task> {
        self.submit_task(new_task).await
    }
}

// ---------------------------------------------------------------------------
// Expression helpers
// ---------------------------------------------------------------------------

/// Normalize a cron expression to the 6/7-field format. Standard 5-field
/// input gets a `0` seconds field prepended.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a cron expression, normalizing 5-field input.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|e| OrchestrateError::Validation(format!("invalid cron expression {expr:?}: {e}")))
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| OrchestrateError::Validation(format!("invalid timezone {name:?}")))
}

/// Next fire time after `after`, evaluated in the rule's timezone and
/// reported in UTC.
fn next_run_after(schedule: &cron::Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Rule CRUD payloads
// ---------------------------------------------------------------------------

/// Payload for creating a schedule rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScheduleRule {
    pub name: String,
    pub cron_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub template_id: Uuid,
    #[serde(default)]
    pub max_runs: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Partial update for a schedule rule; unset fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleRuleUpdate {
    pub name: Option<String>,
    pub cron_expr: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub max_runs: Option<Option<u32>>,
}

/// Per-rule view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Aggregate scheduler stats.
#[derive(Debug, Clone, Serialize)]
pub struct CronStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub live_entries: usize,
    pub total_fires: u64,
    pub rules: Vec<RuleStats>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct CronEntry {
    schedule: cron::Schedule,
    tz: Tz,
    next_run: Option<DateTime<Utc>>,
}

/// The cron scheduler. Owns the entry table; rules live in the store.
pub struct CronScheduler {
    store: Arc<dyn Store>,
    submitter: Arc<dyn TaskSubmitter>,
    config: CronConfig,
    entries: RwLock<HashMap<Uuid, CronEntry>>,
    cancel: CancellationToken,
}

impl CronScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        submitter: Arc<dyn TaskSubmitter>,
        config: CronConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            submitter,
            config,
            entries: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Load every rule from the store and install entries for the enabled
    /// ones. Call once before [`Self::start`].
    pub async fn load(&self) -> Result<usize> {
        let rules = self.store.list_schedule_rules().await?;
        let mut installed = 0;
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            match self.install_entry(&rule).await {
                Ok(()) => installed += 1,
                Err(e) => {
                    error!(rule_id = %rule.id, rule = %rule.name, error = %e, "failed to install rule entry");
                }
            }
        }
        info!(installed, "cron scheduler loaded");
        Ok(installed)
    }

    /// Spawn the tick loop and the self-heal loop.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.tick_loop().await });
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.self_heal_loop().await });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // -- rule CRUD --------------------------------------------------------

    pub async fn create_rule(&self, new: NewScheduleRule) -> Result<ScheduleRule> {
        if new.name.trim().is_empty() {
            return Err(OrchestrateError::Validation(
                "rule name must not be empty".to_string(),
            ));
        }
        let schedule = parse_schedule(&new.cron_expr)?;
        let tz = parse_timezone(&new.timezone)?;
        if self.store.find_task(new.template_id).await?.is_none() {
            return Err(OrchestrateError::Validation(format!(
                "template task {} does not exist",
                new.template_id
            )));
        }

        let rule = ScheduleRule {
            id: Uuid::new_v4(),
            name: new.name,
            cron_expr: new.cron_expr,
            timezone: new.timezone,
            enabled: new.enabled,
            template_id: new.template_id,
            next_run_at: next_run_after(&schedule, tz, Utc::now()),
            last_run_at: None,
            run_count: 0,
            max_runs: new.max_runs,
            created_at: Utc::now(),
        };
        self.store.insert_schedule_rule(&rule).await?;
        if rule.enabled {
            self.install_entry(&rule).await?;
        }
        info!(rule_id = %rule.id, rule = %rule.name, cron = %rule.cron_expr, "schedule rule created");
        Ok(rule)
    }

    /// Apply a partial update, removing the prior entry and reinstalling
    /// a fresh one when the rule stays enabled.
    pub async fn update_rule(&self, id: Uuid, update: ScheduleRuleUpdate) -> Result<ScheduleRule> {
        let mut rule = self.find_rule(id).await?;

        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(cron_expr) = update.cron_expr {
            parse_schedule(&cron_expr)?;
            rule.cron_expr = cron_expr;
        }
        if let Some(timezone) = update.timezone {
            parse_timezone(&timezone)?;
            rule.timezone = timezone;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        if let Some(max_runs) = update.max_runs {
            rule.max_runs = max_runs;
        }

        self.entries.write().await.remove(&id);
        if rule.enabled {
            let schedule = parse_schedule(&rule.cron_expr)?;
            let tz = parse_timezone(&rule.timezone)?;
            rule.next_run_at = next_run_after(&schedule, tz, Utc::now());
            self.store.update_schedule_rule(&rule).await?;
            self.install_entry(&rule).await?;
        } else {
            rule.next_run_at = None;
            self.store.update_schedule_rule(&rule).await?;
        }
        debug!(rule_id = %id, "schedule rule updated");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<()> {
        self.entries.write().await.remove(&id);
        self.store.delete_schedule_rule(id).await?;
        info!(rule_id = %id, "schedule rule deleted");
        Ok(())
    }

    /// Enable or disable a rule.
    pub async fn toggle_rule(&self, id: Uuid, enabled: bool) -> Result<ScheduleRule> {
        self.update_rule(
            id,
            ScheduleRuleUpdate {
                enabled: Some(enabled),
                ..ScheduleRuleUpdate::default()
            },
        )
        .await
    }

    /// Fire a rule immediately, outside its schedule. Still counts
    /// against `max_runs`.
    pub async fn trigger_now(&self, id: Uuid) -> Result<Task> {
        let rule = self.find_rule(id).await?;
        self.fire(rule)
            .await?
            .ok_or_else(|| OrchestrateError::Cron(format!("rule {id} refused to fire")))
    }

    pub async fn list_rules(&self) -> Result<Vec<ScheduleRule>> {
        Ok(self.store.list_schedule_rules().await?)
    }

    pub async fn stats(&self) -> Result<CronStats> {
        let rules = self.store.list_schedule_rules().await?;
        let entries = self.entries.read().await;
        let stats: Vec<RuleStats> = rules
            .iter()
            .map(|r| RuleStats {
                id: r.id,
                name: r.name.clone(),
                enabled: r.enabled,
                run_count: r.run_count,
                max_runs: r.max_runs,
                last_run_at: r.last_run_at,
                next_run_at: entries
                    .get(&r.id)
                    .and_then(|e| e.next_run)
                    .or(r.next_run_at),
            })
            .collect();
        Ok(CronStats {
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            live_entries: entries.len(),
            total_fires: rules.iter().map(|r| r.run_count as u64).sum(),
            rules: stats,
        })
    }

    // -- firing -----------------------------------------------------------

    async fn find_rule(&self, id: Uuid) -> Result<ScheduleRule> {
        self.store
            .find_schedule_rule(id)
            .await?
            .ok_or_else(|| StoreError::not_found("schedule rule", id).into())
    }

    async fn install_entry(&self, rule: &ScheduleRule) -> Result<()> {
        let schedule = parse_schedule(&rule.cron_expr)?;
        let tz = parse_timezone(&rule.timezone)?;
        let next_run = next_run_after(&schedule, tz, Utc::now());
        self.entries.write().await.insert(
            rule.id,
            CronEntry {
                schedule,
                tz,
                next_run,
            },
        );
        Ok(())
    }

    /// Materialize and submit one task from a rule's template.
    ///
    /// Returns `Ok(None)` when the rule refused to fire (disabled or
    /// exhausted); exhaustion auto-disables the rule.
    async fn fire(&self, rule: ScheduleRule) -> Result<Option<Task>> {
        if !rule.enabled {
            self.entries.write().await.remove(&rule.id);
            return Ok(None);
        }
        if let Some(max_runs) = rule.max_runs {
            if rule.run_count >= max_runs {
                self.disable_exhausted(rule).await?;
                return Ok(None);
            }
        }

        let template = match self.store.find_task(rule.template_id).await? {
            Some(template) => template,
            None => {
                error!(
                    rule_id = %rule.id,
                    template_id = %rule.template_id,
                    "template task vanished, disabling rule"
                );
                self.toggle_rule(rule.id, false).await?;
                return Ok(None);
            }
        };

        let new_task = NewTask {
            name: format!("{SCHEDULED_NAME_PREFIX} {}", template.name),
            task_type: template.task_type,
            priority: template.priority,
            config: template.config.clone(),
            depends_on: Vec::new(),
            project_id: template.project_id.clone(),
            max_retries: template.max_retries,
            timeout_secs: template.timeout_secs,
            callback_url: template.callback_url.clone(),
        };
        let task = self.submitter.submit(new_task).await?;
        info!(rule_id = %rule.id, task_id = %task.id, "schedule rule fired");

        let mut rule = rule;
        rule.run_count += 1;
        rule.last_run_at = Some(Utc::now());

        let exhausted = rule.max_runs.is_some_and(|max| rule.run_count >= max);
        if exhausted {
            rule.enabled = false;
            rule.next_run_at = None;
            self.store.update_schedule_rule(&rule).await?;
            self.entries.write().await.remove(&rule.id);
            info!(rule_id = %rule.id, run_count = rule.run_count, "rule exhausted max runs, disabled");
        } else {
            let mut entries = self.entries.write().await;
            let next_run = match entries.get_mut(&rule.id) {
                Some(entry) => {
                    entry.next_run = next_run_after(&entry.schedule, entry.tz, Utc::now());
                    entry.next_run
                }
                None => None,
            };
            rule.next_run_at = next_run;
            drop(entries);
            self.store.update_schedule_rule(&rule).await?;
        }

        Ok(Some(task))
    }

    async fn disable_exhausted(&self, mut rule: ScheduleRule) -> Result<()> {
        rule.enabled = false;
        rule.next_run_at = None;
        self.store.update_schedule_rule(&rule).await?;
        self.entries.write().await.remove(&rule.id);
        warn!(rule_id = %rule.id, "rule at max runs, auto-disabled");
        Ok(())
    }

    /// One pass over the entry table, firing everything due.
    pub async fn tick_once(&self) -> Result<usize> {
        let now = Utc::now();
        let due: Vec<Uuid> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| e.next_run.is_some_and(|next| next <= now))
                .map(|(id, _)| *id)
                .collect()
        };

        let mut fired = 0;
        for rule_id in due {
            match self.find_rule(rule_id).await {
                Ok(rule) => match self.fire(rule).await {
                    Ok(Some(_)) => fired += 1,
                    Ok(None) => {}
                    Err(e) => error!(rule_id = %rule_id, error = %e, "rule fire failed"),
                },
                Err(_) => {
                    // Rule deleted under the entry; drop it.
                    self.entries.write().await.remove(&rule_id);
                }
            }
        }
        Ok(fired)
    }

    /// Reconcile the entry table against the store: install missing
    /// entries for enabled rules, drop entries for gone/disabled rules.
    pub async fn self_heal_once(&self) -> Result<usize> {
        let rules = self.store.list_schedule_rules().await?;
        let mut healed = 0;

        for rule in &rules {
            let has_entry = self.entries.read().await.contains_key(&rule.id);
            if rule.enabled && !has_entry {
                warn!(rule_id = %rule.id, rule = %rule.name, "enabled rule lost its entry, reinstalling");
                self.install_entry(rule).await?;
                healed += 1;
            } else if !rule.enabled && has_entry {
                self.entries.write().await.remove(&rule.id);
                healed += 1;
            }
        }

        let known: std::collections::HashSet<Uuid> = rules.iter().map(|r| r.id).collect();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, _| known.contains(id));
        healed += before - entries.len();
        Ok(healed)
    }

    async fn tick_loop(self: Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.tick_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("cron scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            if let Err(e) = self.tick_once().await {
                error!(error = %e, "cron tick failed");
            }
        }
        info!("cron scheduler stopped");
    }

    async fn self_heal_loop(self: Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.self_heal_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            match self.self_heal_once().await {
                Ok(0) => {}
                Ok(healed) => info!(healed, "cron self-heal reconciled entries"),
                Err(e) => error!(error = %e, "cron self-heal failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expression_normalized() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 30 9 * * 1-5").is_ok());
    }

    #[test]
    fn garbage_expression_rejected() {
        assert!(matches!(
            parse_schedule("not a cron"),
            Err(OrchestrateError::Validation(_))
        ));
    }

    #[test]
    fn timezone_parsing() {
        assert!(parse_timezone("UTC").is_ok());
        assert!(parse_timezone("Europe/Berlin").is_ok());
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(OrchestrateError::Validation(_))
        ));
    }

    #[test]
    fn next_run_is_in_the_future() {
        let schedule = parse_schedule("* * * * *").unwrap();
        let now = Utc::now();
        let next = next_run_after(&schedule, chrono_tz::UTC, now).unwrap();
        assert!(next > now);
        assert!(next <= now + chrono::Duration::seconds(61));
    }

    #[test]
    fn timezone_affects_daily_fire_time() {
        // 09:00 daily in Berlin is 07:00 or 08:00 UTC depending on DST,
        // never 09:00 UTC.
        let schedule = parse_schedule("0 0 9 * * *").unwrap();
        let after = Utc::now();
        let berlin = next_run_after(&schedule, chrono_tz::Europe::Berlin, after).unwrap();
        let utc = next_run_after(&schedule, chrono_tz::UTC, after).unwrap();
        assert_ne!(berlin, utc);
    }
}
