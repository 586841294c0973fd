//! Helpers for building protocol diagnostics

use crate::tfplugin6::attribute_path::{step::Selector, Step};
use crate::tfplugin6::{diagnostic::Severity, AttributePath, Diagnostic};

/// Path step naming an attribute or block
pub fn attr_step(name: &str) -> Step {
    Step {
        selector: Some(Selector::AttributeName(name.to_string())),
    }
}

/// Path step indexing into a list
pub fn index_step(index: usize) -> Step {
    Step {
        selector: Some(Selector::ElementKeyInt(index as i64)),
    }
}

pub fn path(steps: Vec<Step>) -> AttributePath {
    AttributePath { steps }
}

pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error as i32,
        summary: summary.into(),
        detail: detail.into(),
        attribute: None,
    }
}

pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning as i32,
        summary: summary.into(),
        detail: detail.into(),
        attribute: None,
    }
}

pub fn attribute_error(
    steps: Vec<Step>,
    summary: impl Into<String>,
    detail: impl Into<String>,
) -> Diagnostic {
    Diagnostic {
        attribute: Some(path(steps)),
        ..error(summary, detail)
    }
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics
        .iter()
        .any(|d| d.severity == Severity::Error as i32)
}
