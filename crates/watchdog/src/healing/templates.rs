//! Issue bodies and remediation briefs rendered with Handlebars.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::collaborators::GatheredContext;
use super::redact::redact_secrets;
use crate::alerts::Alert;

pub const ISSUE_TEMPLATE: &str = "issue";
pub const REMEDIATION_TEMPLATE: &str = "remediation";

const DEFAULT_ISSUE_TEMPLATE: &str = r"## {{kind_name}}

**Subject:** `{{subject}}`
**Workflow family:** `{{workflow_family}}`
**Severity:** {{severity}}
{{#if task_id}}**Task:** {{task_id}}
{{/if}}**Detected:** {{detected_at}}

{{message}}

### Details

| Key | Value |
|-----|-------|
{{#each context}}| {{@key}} | {{this}} |
{{/each}}
{{#if stage}}
### Stage

Current stage `{{stage.current_stage}}` since {{stage.stage_entered_at}}
{{/if}}
### Recent Logs

```
{{logs}}
```
";

const DEFAULT_REMEDIATION_TEMPLATE: &str = r"# Remediation: {{kind_name}}

You are fixing a problem detected in `{{subject}}` (workflow family `{{workflow_family}}`).
{{#if task_id}}The affected task is {{task_id}}.
{{/if}}
## What was detected

{{message}}

{{#each context}}- {{@key}}: {{this}}
{{/each}}
Audit record: {{issue_ref}}

## Recent Logs

```
{{logs}}
```

Diagnose the root cause, fix it, and leave a comment on the audit record when done.
";

/// Values available to templates
#[derive(Debug, Serialize)]
struct BriefData<'a> {
    kind: &'static str,
    kind_name: &'static str,
    severity: String,
    subject: &'a str,
    workflow_family: &'a str,
    task_id: Option<&'a str>,
    message: &'a str,
    detected_at: String,
    context: BTreeMap<&'a str, &'a str>,
    stage: Option<&'a crate::stage::StageState>,
    logs: String,
    issue_ref: Option<&'a str>,
}

impl<'a> BriefData<'a> {
    fn new(alert: &'a Alert, gathered: &'a GatheredContext, issue_ref: Option<&'a str>) -> Self {
        Self {
            kind: alert.kind.as_str(),
            kind_name: alert.kind.name(),
            severity: format!("{:?}", alert.severity).to_lowercase(),
            subject: &alert.subject,
            workflow_family: &alert.workflow_family,
            task_id: alert.task_id.as_deref(),
            message: &alert.message,
            detected_at: alert.detected_at.to_rfc3339(),
            context: alert
                .context
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            stage: gathered.stage.as_ref(),
            logs: redact_secrets(&gathered.logs_or_marker()),
            issue_ref,
        }
    }
}

/// Template engine for issue bodies and remediation briefs
pub struct BriefRenderer {
    handlebars: Handlebars<'static>,
}

impl BriefRenderer {
    /// Renderer with the built-in templates.
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(ISSUE_TEMPLATE, DEFAULT_ISSUE_TEMPLATE)
            .context("Failed to register issue template")?;
        handlebars
            .register_template_string(REMEDIATION_TEMPLATE, DEFAULT_REMEDIATION_TEMPLATE)
            .context("Failed to register remediation template")?;
        Ok(Self { handlebars })
    }

    /// Override built-in templates with `issue.hbs` / `remediation.hbs` from a
    /// directory, when present.
    pub fn with_overrides(dir: &Path) -> Result<Self> {
        let mut renderer = Self::new()?;
        for name in [ISSUE_TEMPLATE, REMEDIATION_TEMPLATE] {
            let path = dir.join(format!("{name}.hbs"));
            if path.exists() {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read template: {}", path.display()))?;
                renderer
                    .handlebars
                    .register_template_string(name, &content)
                    .with_context(|| format!("Failed to register template: {name}"))?;
                tracing::debug!(template = name, "Loaded template override");
            }
        }
        Ok(renderer)
    }

    pub fn render_issue(&self, alert: &Alert, gathered: &GatheredContext) -> Result<String> {
        self.handlebars
            .render(ISSUE_TEMPLATE, &BriefData::new(alert, gathered, None))
            .context("Failed to render issue body")
    }

    pub fn render_remediation(
        &self,
        alert: &Alert,
        gathered: &GatheredContext,
        issue_ref: &str,
    ) -> Result<String> {
        self.handlebars
            .render(
                REMEDIATION_TEMPLATE,
                &BriefData::new(alert, gathered, Some(issue_ref)),
            )
            .context("Failed to render remediation brief")
    }
}

/// Issue title: `[HEAL-<KIND>] <Kind Name>: <subject>`
pub fn issue_title(alert: &Alert) -> String {
    format!(
        "[HEAL-{}] {}: {}",
        alert.kind.as_str().to_uppercase(),
        alert.kind.name(),
        alert.subject
    )
}
