//! Failure analysis and remediation planning
//!
//! Recorded errors are matched against a registry of named failure
//! patterns by their structured error code. The pattern that explains the
//! most recent error wins; its confidence grows with how much of the recent
//! history it also explains.

use crate::error::ErrorKind;
use crate::state::{BoundedLog, DeploymentError, Phase};
use serde::Serialize;
use std::fmt;

/// Number of most recent errors considered
pub const DEFAULT_ANALYSIS_WINDOW: usize = 5;

/// Confidence reported when no pattern matches
pub const UNKNOWN_CONFIDENCE: f64 = 0.3;

/// Remediation the engine knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    /// Give back the current envelope so the next cycle reserves afresh
    ReleaseResources,
    /// Run the pipeline again from validation
    RetryPipeline,
    /// Drop the remote deployment so the next cycle creates a new one
    RecreateDeployment,
}

impl fmt::Display for RemediationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationKind::ReleaseResources => write!(f, "release_resources"),
            RemediationKind::RetryPipeline => write!(f, "retry_pipeline"),
            RemediationKind::RecreateDeployment => write!(f, "recreate_deployment"),
        }
    }
}

/// A remediation step proposed by the analyzer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationAction {
    pub kind: RemediationKind,
    pub description: String,
    pub auto_execute: bool,
}

/// A named failure signature
#[derive(Debug, Clone)]
pub struct FailurePattern {
    pub name: String,
    pub root_cause: String,
    /// Error codes this pattern explains
    pub codes: Vec<&'static str>,
    /// Lowercase message fragments, only consulted for untagged internal errors
    pub indicators: Vec<&'static str>,
    /// Restrict matching to errors recorded in these phases; empty = any
    pub phases: Vec<Phase>,
    pub probability: f64,
    pub auto_remediation: Vec<RemediationKind>,
    pub manual_actions: Vec<String>,
}

impl FailurePattern {
    fn matches(&self, error: &DeploymentError) -> bool {
        if !self.phases.is_empty() && !self.phases.contains(&error.phase) {
            return false;
        }
        if self.codes.contains(&error.code.as_str()) {
            return true;
        }
        if error.kind == ErrorKind::Internal {
            let message = error.message.to_lowercase();
            return self.indicators.iter().any(|i| message.contains(i));
        }
        false
    }
}

/// Outcome of analysing a VNF's error history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAnalysis {
    pub root_cause: String,
    pub pattern: Option<String>,
    pub confidence: f64,
    pub auto_remediation: Vec<RemediationAction>,
    pub manual_actions: Vec<String>,
}

impl FailureAnalysis {
    fn unknown() -> Self {
        Self {
            root_cause: "unknown failure".to_string(),
            pattern: None,
            confidence: UNKNOWN_CONFIDENCE,
            auto_remediation: Vec::new(),
            manual_actions: vec!["Check logs".to_string(), "Verify resources".to_string()],
        }
    }

    pub fn has_auto_remediation(&self) -> bool {
        self.auto_remediation.iter().any(|a| a.auto_execute)
    }
}

/// Pattern registry
#[derive(Debug, Clone)]
pub struct FailureAnalyzer {
    patterns: Vec<FailurePattern>,
    window: usize,
}

impl Default for FailureAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureAnalyzer {
    /// Analyzer with the built-in pattern set
    pub fn new() -> Self {
        Self {
            patterns: default_patterns(),
            window: DEFAULT_ANALYSIS_WINDOW,
        }
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            window: DEFAULT_ANALYSIS_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Add a pattern; earlier registrations win ties
    pub fn register(&mut self, pattern: FailurePattern) {
        self.patterns.push(pattern);
    }

    pub fn patterns(&self) -> &[FailurePattern] {
        &self.patterns
    }

    pub fn analyze(&self, history: &BoundedLog<DeploymentError>) -> FailureAnalysis {
        let recent: Vec<&DeploymentError> = history.iter().rev().take(self.window).collect();
        let latest = match recent.first() {
            Some(latest) => *latest,
            None => return FailureAnalysis::unknown(),
        };

        let mut best: Option<(&FailurePattern, f64)> = None;
        for pattern in self.patterns.iter().filter(|p| p.matches(latest)) {
            let matched = recent.iter().filter(|e| pattern.matches(e)).count();
            let confidence = pattern.probability * matched as f64 / recent.len() as f64;
            if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                best = Some((pattern, confidence));
            }
        }

        match best {
            Some((pattern, confidence)) => FailureAnalysis {
                root_cause: pattern.root_cause.clone(),
                pattern: Some(pattern.name.clone()),
                confidence: confidence.clamp(0.0, 1.0),
                auto_remediation: pattern
                    .auto_remediation
                    .iter()
                    .map(|kind| RemediationAction {
                        kind: *kind,
                        description: describe(*kind).to_string(),
                        auto_execute: true,
                    })
                    .collect(),
                manual_actions: pattern.manual_actions.clone(),
            },
            None => FailureAnalysis::unknown(),
        }
    }
}

fn describe(kind: RemediationKind) -> &'static str {
    match kind {
        RemediationKind::ReleaseResources => "Release the current resource envelope",
        RemediationKind::RetryPipeline => "Retry the deployment pipeline",
        RemediationKind::RecreateDeployment => "Delete the remote deployment and create it again",
    }
}

fn default_patterns() -> Vec<FailurePattern> {
    vec![
        FailurePattern {
            name: "resource_exhaustion".to_string(),
            root_cause: "resource exhaustion on a target site".to_string(),
            codes: vec!["insufficient_capacity"],
            indicators: vec!["quota", "capacity"],
            phases: Vec::new(),
            probability: 0.9,
            auto_remediation: vec![RemediationKind::ReleaseResources],
            manual_actions: vec!["Increase the site quota or add target sites".to_string()],
        },
        FailurePattern {
            name: "remote_timeout".to_string(),
            root_cause: "remote deployment service timed out or was unreachable".to_string(),
            codes: vec!["timeout", "unavailable"],
            indicators: vec!["timeout", "connection", "temporary"],
            phases: Vec::new(),
            probability: 0.8,
            auto_remediation: vec![RemediationKind::RetryPipeline],
            manual_actions: vec!["Check DMS reachability and load".to_string()],
        },
        FailurePattern {
            name: "remote_deployment_failure".to_string(),
            root_cause: "remote deployment failed or disappeared".to_string(),
            codes: vec!["remote_failed", "not_found"],
            indicators: Vec::new(),
            phases: Vec::new(),
            probability: 0.7,
            auto_remediation: vec![RemediationKind::RecreateDeployment],
            manual_actions: vec!["Inspect the DMS deployment logs".to_string()],
        },
        FailurePattern {
            name: "invalid_configuration".to_string(),
            root_cause: "invalid VNF configuration".to_string(),
            codes: vec!["validation", "packaging"],
            indicators: Vec::new(),
            phases: Vec::new(),
            probability: 0.95,
            auto_remediation: Vec::new(),
            manual_actions: vec!["Fix the VNF specification".to_string()],
        },
        FailurePattern {
            name: "remote_rejected".to_string(),
            root_cause: "remote deployment service rejected the request".to_string(),
            codes: vec!["rejected", "already_exists"],
            indicators: Vec::new(),
            phases: Vec::new(),
            probability: 0.85,
            auto_remediation: Vec::new(),
            manual_actions: vec![
                "Review the DMS rejection message".to_string(),
                "Verify credentials and deployment parameters".to_string(),
            ],
        },
    ]
}
