//! Pipeline configuration and the stage lifecycle state machine (§4.5, §6).
//!
//! Grounded on `sipag-core/src/worker/work_config.rs`'s env-over-file-over-
//! default resolution order, reused here for `workflow.defaults`; parses the
//! nested YAML shape with the Frontmatter Gateway's own map parser instead of
//! introducing a second YAML engine.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use crate::frontmatter::{FrontmatterMap, Value};
use crate::workitem::{STATUS_COMPLETE, STATUS_NOT_STARTED};

/// What a phase does when a stage sits in it: spawn a worker, or run a pure
/// resolver function. A phase carries exactly one of the two (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseKind {
    Skill(String),
    Resolver(String),
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub status: String,
    pub kind: PhaseKind,
    pub transitions_to: Vec<String>,
}

impl Phase {
    pub fn skill_name(&self) -> Option<&str> {
        match &self.kind {
            PhaseKind::Skill(s) => Some(s),
            PhaseKind::Resolver(_) => None,
        }
    }

    pub fn resolver_name(&self) -> Option<&str> {
        match &self.kind {
            PhaseKind::Resolver(r) => Some(r),
            PhaseKind::Skill(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub entry_phase: String,
    pub phases: Vec<Phase>,
    pub defaults: HashMap<String, String>,
    pub mr_comment_poll: CronJobConfig,
    pub insights_threshold: CronJobConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct CronJobConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl Default for CronJobConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 300,
        }
    }
}

/// Reserved statuses outside the configured phase list (§3).
pub fn is_reserved_status(status: &str) -> bool {
    status == STATUS_NOT_STARTED || status == STATUS_COMPLETE
}

impl PipelineConfig {
    /// Read and parse the pipeline config file at `path` (§10.3). Thin
    /// wrapper over `parse`; kept separate so a CLI driver has one call that
    /// covers both disk I/O and validation errors.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let doc = crate::frontmatter::read(path)
            .with_context(|| format!("failed to read pipeline config at {}", path.display()))?;
        Self::parse(&doc.data)
    }

    /// Parse from the frontmatter-style YAML map under a top-level
    /// `workflow:` key, the shape described in §6.
    pub fn parse(data: &FrontmatterMap) -> Result<Self> {
        let workflow = data
            .get("workflow")
            .and_then(Value::as_map)
            .context("pipeline config: missing top-level `workflow` key")?;

        let entry_phase = workflow
            .get_str("entry_phase")
            .context("pipeline config: missing `workflow.entry_phase`")?
            .to_string();

        let phase_values = workflow
            .get("phases")
            .and_then(Value::as_list)
            .context("pipeline config: missing `workflow.phases`")?;

        let mut phases = Vec::with_capacity(phase_values.len());
        for (i, pv) in phase_values.iter().enumerate() {
            let pm = pv
                .as_map()
                .with_context(|| format!("pipeline config: phases[{i}] is not a map"))?;
            let name = pm
                .get_str("name")
                .with_context(|| format!("pipeline config: phases[{i}] missing `name`"))?
                .to_string();
            let status = pm
                .get_str("status")
                .with_context(|| format!("pipeline config: phases[{i}] missing `status`"))?
                .to_string();
            if is_reserved_status(&status) {
                bail!(
                    "pipeline config: phase `{name}` uses reserved status `{status}` \
                     (Not Started / Complete are forbidden as phase statuses)"
                );
            }
            let skill = pm.get_str("skill");
            let resolver = pm.get_str("resolver");
            let kind = match (skill, resolver) {
                (Some(s), None) => PhaseKind::Skill(s.to_string()),
                (None, Some(r)) => PhaseKind::Resolver(r.to_string()),
                (Some(_), Some(_)) => {
                    bail!("pipeline config: phase `{name}` has both `skill` and `resolver`")
                }
                (None, None) => {
                    bail!("pipeline config: phase `{name}` has neither `skill` nor `resolver`")
                }
            };
            let transitions_to = pm.get_string_list("transitions_to");
            phases.push(Phase {
                name,
                status,
                kind,
                transitions_to,
            });
        }

        if !phases.iter().any(|p| p.name == entry_phase) {
            bail!("pipeline config: entry_phase `{entry_phase}` does not name a configured phase");
        }

        let mut defaults = HashMap::new();
        if let Some(dm) = workflow.get("defaults").and_then(Value::as_map) {
            for (k, v) in dm.iter() {
                if let Some(s) = v.as_str() {
                    defaults.insert(k.to_string(), s.to_string());
                } else if let Some(n) = v.as_int() {
                    defaults.insert(k.to_string(), n.to_string());
                } else if let Some(b) = v.as_bool() {
                    defaults.insert(k.to_string(), b.to_string());
                }
            }
        }

        let mut mr_comment_poll = CronJobConfig::default();
        let mut insights_threshold = CronJobConfig::default();
        if let Some(cron) = data.get("cron").and_then(Value::as_map) {
            if let Some(job) = cron.get("mr_comment_poll").and_then(Value::as_map) {
                mr_comment_poll = parse_cron_job(job, "mr_comment_poll")?;
            }
            if let Some(job) = cron.get("insights_threshold").and_then(Value::as_map) {
                insights_threshold = parse_cron_job(job, "insights_threshold")?;
            }
        }

        Ok(Self {
            entry_phase,
            phases,
            defaults,
            mr_comment_poll,
            insights_threshold,
        })
    }

    pub fn entry_phase(&self) -> &Phase {
        self.phases
            .iter()
            .find(|p| p.name == self.entry_phase)
            .expect("constructor validated entry_phase names a configured phase")
    }

    /// Resolve the phase whose `status` matches, or `None` if `status` is
    /// reserved or unrecognised (§4.5).
    pub fn lookup(&self, status: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.status == status)
    }

    /// `lookupSkill(status) -> name | none`: `None` if the phase is a
    /// resolver phase, signalling "run a resolver instead" (§4.5).
    pub fn lookup_skill(&self, status: &str) -> Option<&str> {
        self.lookup(status).and_then(Phase::skill_name)
    }

    /// A layered config read: env var override, then `workflow.defaults`,
    /// then the caller-supplied fallback. Mirrors
    /// `worker/work_config.rs`'s env-over-file-over-default order.
    pub fn resolve_default(&self, key: &str, fallback: &str) -> String {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return v;
            }
        }
        self.defaults
            .get(key)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn max_parallel(&self) -> usize {
        self.resolve_default("WORKFLOW_MAX_PARALLEL", "3")
            .parse()
            .unwrap_or(3)
    }
}

fn parse_cron_job(job: &FrontmatterMap, name: &str) -> Result<CronJobConfig> {
    let enabled = job.get_bool("enabled");
    let interval_seconds = job.get_int("interval_seconds", 300);
    if !(30..=3600).contains(&interval_seconds) {
        bail!("pipeline config: cron.{name}.interval_seconds must be in [30, 3600], got {interval_seconds}");
    }
    Ok(CronJobConfig {
        enabled,
        interval_seconds: interval_seconds as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontmatter;

    fn sample_config() -> FrontmatterMap {
        let content = "---\n\
workflow:\n\
  entry_phase: Design\n\
  phases:\n\
    - name: Design\n\
      status: Design\n\
      skill: phase-design\n\
      transitions_to: [Build]\n\
    - name: Build\n\
      status: Build\n\
      skill: phase-build\n\
      transitions_to: [Done]\n\
    - name: Check\n\
      status: Checking\n\
      resolver: pr-status\n\
      transitions_to: [Done]\n\
  defaults:\n\
    WORKFLOW_MAX_PARALLEL: 3\n\
cron:\n\
  mr_comment_poll:\n\
    enabled: true\n\
    interval_seconds: 60\n\
---\n";
        frontmatter::parse(content).unwrap().data
    }

    #[test]
    fn parses_phases_and_entry() {
        let cfg = PipelineConfig::parse(&sample_config()).unwrap();
        assert_eq!(cfg.entry_phase, "Design");
        assert_eq!(cfg.phases.len(), 3);
        assert_eq!(cfg.entry_phase().status, "Design");
    }

    #[test]
    fn lookup_skill_none_for_resolver_phase() {
        let cfg = PipelineConfig::parse(&sample_config()).unwrap();
        assert_eq!(cfg.lookup_skill("Build"), Some("phase-build"));
        assert_eq!(cfg.lookup_skill("Checking"), None);
        assert!(cfg.lookup("Checking").is_some());
    }

    #[test]
    fn reserved_status_rejected() {
        let content = "---\nworkflow:\n  entry_phase: X\n  phases:\n    - name: X\n      status: Complete\n      skill: s\n---\n";
        let data = frontmatter::parse(content).unwrap().data;
        assert!(PipelineConfig::parse(&data).is_err());
    }

    #[test]
    fn cron_interval_out_of_range_rejected() {
        let content = "---\nworkflow:\n  entry_phase: X\n  phases:\n    - name: X\n      status: Design\n      skill: s\ncron:\n  mr_comment_poll:\n    enabled: true\n    interval_seconds: 10\n---\n";
        let data = frontmatter::parse(content).unwrap().data;
        assert!(PipelineConfig::parse(&data).is_err());
    }

    #[test]
    fn max_parallel_defaults_to_three() {
        let cfg = PipelineConfig::parse(&sample_config()).unwrap();
        std::env::remove_var("WORKFLOW_MAX_PARALLEL");
        assert_eq!(cfg.max_parallel(), 3);
    }
}
