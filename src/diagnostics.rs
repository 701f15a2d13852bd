use crate::transform::errors::PassError;
use miette::{Diagnostic, Report};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, Clone)]
#[error("{message}")]
pub struct PassDiagnostic {
    message: String,
    #[help]
    help: Option<String>,
}

impl PassDiagnostic {
    pub fn from_error(err: &PassError) -> Self {
        let help = if err.is_internal() {
            Some("this points at a compiler bug, not at the source program".to_string())
        } else {
            err.symbol
                .clone()
                .map(|symbol| format!("while lowering `{symbol}`"))
        };
        Self {
            message: err.to_string(),
            help,
        }
    }
}

pub fn emit_pass_errors(errors: &[PassError]) {
    for err in errors {
        let diagnostic = PassDiagnostic::from_error(err);
        eprintln!("{:?}", Report::new(diagnostic));
    }
}

pub fn report_io_error(path: &Path, error: &str) {
    eprintln!("Failed to access {}: {}", path.display(), error);
}
