//! Static pre-execution checks: syntax validation, security-risk scanning
//! and heuristic resource estimation.
//!
//! The security scan is a linter over a fixed risk catalogue, independent
//! of the configured policy; enforcement happens at runtime in the
//! capability set and the resource monitor. Code that fails validation
//! never starts an execution context.

use crate::lang::{self, AstMetrics};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyntaxSeverity {
    Error,
    Warning,
}

/// One finding from the parse pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntaxIssue {
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: SyntaxSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntaxReport {
    /// False only when an error-severity issue is present; warnings alone
    /// leave the code valid.
    pub valid: bool,
    pub issues: Vec<SyntaxIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One match from the risk catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRisk {
    pub class: String,
    pub severity: RiskSeverity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    /// False iff at least one critical risk was found.
    pub safe: bool,
    pub risks: Vec<SecurityRisk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeComplexity {
    Trivial,
    Low,
    Moderate,
    High,
}

/// Heuristic pre-flight estimate. Never authoritative; the resource
/// monitor enforces the real limits at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEstimate {
    pub estimated_memory_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub estimated_execution_time: Duration,
    pub complexity: CodeComplexity,
}

struct RiskPattern {
    class: &'static str,
    severity: RiskSeverity,
    regex: Regex,
    description: &'static str,
    suggestion: Option<&'static str>,
}

/// Static validator. Cheap to construct once and share per manager.
pub struct Validator {
    catalogue: Vec<RiskPattern>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        let pattern = |class, severity, pattern: &str, description, suggestion| RiskPattern {
            class,
            severity,
            regex: Regex::new(pattern).expect("static risk pattern"),
            description,
            suggestion,
        };

        let catalogue = vec![
            pattern(
                "dynamic-eval",
                RiskSeverity::Critical,
                r"\beval\s*\(",
                "dynamic evaluation of generated code",
                Some("compute the value directly instead of evaluating a string"),
            ),
            pattern(
                "dynamic-eval",
                RiskSeverity::Critical,
                r"\bFunction\s*\(",
                "code generation through the Function constructor",
                Some("declare the function in source"),
            ),
            pattern(
                "scope-escape",
                RiskSeverity::Critical,
                r"\bglobalThis\b",
                "reference to the host global scope",
                None,
            ),
            pattern(
                "scope-escape",
                RiskSeverity::Critical,
                r"constructor\s*\.\s*constructor",
                "constructor-chain walk out of the sandbox scope",
                None,
            ),
            pattern(
                "prototype-mutation",
                RiskSeverity::High,
                r"__proto__",
                "direct prototype access",
                Some("use plain objects instead of mutating prototypes"),
            ),
            pattern(
                "prototype-mutation",
                RiskSeverity::High,
                r"\.prototype\b",
                "prototype access on a constructor",
                None,
            ),
            pattern(
                "system-access",
                RiskSeverity::High,
                r"\b(process|child_process)\b",
                "reference to a host process API",
                None,
            ),
            pattern(
                "module-load",
                RiskSeverity::Medium,
                r"\b(require\s*\(|import\s)",
                "third-party module load",
                Some("declare dependencies through the sandbox configuration"),
            ),
            pattern(
                "dom-mutation",
                RiskSeverity::Medium,
                r"document\s*\.\s*(write|cookie)",
                "direct document mutation",
                None,
            ),
            pattern(
                "unbounded-loop",
                RiskSeverity::Low,
                r"while\s*\(\s*true\s*\)",
                "loop with no termination condition",
                Some("add a termination condition or rely on the sandbox timeout"),
            ),
        ];

        Self { catalogue }
    }

    /// Parse-only pass. Warnings (lint findings) do not invalidate.
    pub fn validate_syntax(&self, code: &str) -> SyntaxReport {
        match lang::parse(code) {
            Ok(parsed) => SyntaxReport {
                valid: true,
                issues: parsed
                    .warnings
                    .into_iter()
                    .map(|w| SyntaxIssue {
                        line: w.line,
                        column: w.column,
                        message: w.message,
                        severity: SyntaxSeverity::Warning,
                    })
                    .collect(),
            },
            Err(err) => SyntaxReport {
                valid: false,
                issues: vec![SyntaxIssue {
                    line: err.line,
                    column: err.column,
                    message: err.message,
                    severity: SyntaxSeverity::Error,
                }],
            },
        }
    }

    /// Scan against the fixed risk catalogue.
    pub fn check_security(&self, code: &str) -> SecurityReport {
        let mut risks = Vec::new();
        for pattern in &self.catalogue {
            if let Some(m) = pattern.regex.find(code) {
                risks.push(SecurityRisk {
                    class: pattern.class.to_string(),
                    severity: pattern.severity,
                    description: pattern.description.to_string(),
                    suggestion: pattern.suggestion.map(str::to_string),
                    line: line_of_offset(code, m.start()),
                });
            }
        }
        let safe = !risks.iter().any(|r| r.severity == RiskSeverity::Critical);
        SecurityReport { safe, risks }
    }

    /// Heuristic estimate from the static shape of the program. Falls back
    /// to a length-based guess when the code does not parse.
    pub fn estimate_resource_usage(&self, code: &str) -> ResourceEstimate {
        let metrics = match lang::parse(code) {
            Ok(parsed) => AstMetrics::of(&parsed.program),
            Err(_) => {
                return ResourceEstimate {
                    estimated_memory_bytes: 4096 + code.len() as u64,
                    estimated_execution_time: Duration::from_micros(50 + code.len() as u64),
                    complexity: CodeComplexity::Low,
                }
            }
        };

        let depth_factor = 4u64.pow(metrics.max_loop_depth.min(3));
        let estimated_memory_bytes = 4096 + metrics.literal_bytes * depth_factor;

        let time_factor = 10u64.pow(metrics.max_loop_depth.min(3));
        let estimated_execution_time =
            Duration::from_micros(50 + metrics.node_count * time_factor);

        let complexity = match (metrics.max_loop_depth, metrics.node_count) {
            (0, n) if n < 50 => CodeComplexity::Trivial,
            (0, _) => CodeComplexity::Low,
            (1, _) => CodeComplexity::Moderate,
            _ => CodeComplexity::High,
        };

        ResourceEstimate {
            estimated_memory_bytes,
            estimated_execution_time,
            complexity,
        }
    }
}

fn line_of_offset(code: &str, offset: usize) -> u32 {
    1 + code[..offset].bytes().filter(|b| *b == b'\n').count() as u32
}
