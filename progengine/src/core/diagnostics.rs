//! Remapping of compiler diagnostics onto the program's logical fragments.

use crate::core::types::{CodeBlock, ProgramError, RawDiagnostic};

/// Offsets needed to translate a composed-unit line back to a fragment line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOffsets {
    pub main_offset: i64,
    pub trigger_offset: i64,
    pub main_line_count: i64,
}

impl LineOffsets {
    /// Classify a composed-unit line.
    ///
    /// Anything at or past `main_line_count + trigger_offset` (relative to the
    /// main body start) belongs to the trigger condition.
    pub fn classify(&self, raw_line: i64) -> (CodeBlock, i64) {
        let row = raw_line - self.main_offset;
        let trigger_start = self.main_line_count + self.trigger_offset;
        if row >= trigger_start {
            (CodeBlock::TriggerCondition, row - trigger_start)
        } else {
            (CodeBlock::MainBody, row)
        }
    }
}

/// Diagnostics split into compile failures and warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedDiagnostics {
    pub errors: Vec<ProgramError>,
    pub warnings: Vec<ProgramError>,
}

/// Map every raw diagnostic, keeping the compiler's order within each bucket.
pub fn map_diagnostics(diagnostics: &[RawDiagnostic], offsets: &LineOffsets) -> MappedDiagnostics {
    let mut mapped = MappedDiagnostics::default();
    for diagnostic in diagnostics {
        let (code_block, line) = offsets.classify(diagnostic.line);
        let error = ProgramError {
            line,
            column: diagnostic.column,
            error_message: diagnostic.message.clone(),
            error_number: diagnostic.code.clone(),
            code_block,
        };
        if diagnostic.warning {
            mapped.warnings.push(error);
        } else {
            mapped.errors.push(error);
        }
    }
    mapped
}

/// Notification text for a compiler warning: `{block},{line},{column}: {message}`.
pub fn format_warning(warning: &ProgramError) -> String {
    format!(
        "{},{},{}: {}",
        warning.code_block, warning.line, warning.column, warning.error_message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(line: i64, warning: bool) -> RawDiagnostic {
        RawDiagnostic {
            line,
            column: 4,
            message: format!("at {line}"),
            code: "CS0001".to_string(),
            warning,
        }
    }

    #[test]
    fn main_body_line_at_offset_maps_to_zero() {
        let offsets = LineOffsets {
            main_offset: 10,
            trigger_offset: 2,
            main_line_count: 1,
        };
        let mapped = map_diagnostics(&[diag(10, false)], &offsets);
        assert_eq!(mapped.errors.len(), 1);
        assert_eq!(mapped.errors[0].code_block, CodeBlock::MainBody);
        assert_eq!(mapped.errors[0].line, 0);
        assert_eq!(mapped.errors[0].column, 4);
        assert_eq!(mapped.errors[0].error_number, "CS0001");
    }

    #[test]
    fn trigger_line_past_main_body_maps_to_trigger() {
        let offsets = LineOffsets {
            main_offset: 10,
            trigger_offset: 2,
            main_line_count: 5,
        };
        assert_eq!(offsets.classify(17), (CodeBlock::TriggerCondition, 0));
        assert_eq!(offsets.classify(19), (CodeBlock::TriggerCondition, 2));
    }

    #[test]
    fn every_main_body_line_stays_in_main_body() {
        let offsets = LineOffsets {
            main_offset: 7,
            trigger_offset: 3,
            main_line_count: 4,
        };
        for k in 0..offsets.main_line_count {
            assert_eq!(offsets.classify(7 + k), (CodeBlock::MainBody, k));
        }
        // Boilerplate between the fragments is still reported against the main body.
        assert_eq!(offsets.classify(7 + 4 + 2), (CodeBlock::MainBody, 6));
        assert_eq!(offsets.classify(7 + 4 + 3), (CodeBlock::TriggerCondition, 0));
    }

    #[test]
    fn lines_before_main_body_go_negative() {
        let offsets = LineOffsets {
            main_offset: 10,
            trigger_offset: 2,
            main_line_count: 1,
        };
        assert_eq!(offsets.classify(3), (CodeBlock::MainBody, -7));
    }

    #[test]
    fn warnings_are_separated_from_errors() {
        let offsets = LineOffsets {
            main_offset: 0,
            trigger_offset: 0,
            main_line_count: 10,
        };
        let mapped = map_diagnostics(&[diag(1, true), diag(2, false), diag(3, false)], &offsets);
        assert_eq!(mapped.errors.len(), 2);
        assert_eq!(mapped.warnings.len(), 1);
        assert_eq!(mapped.errors[0].line, 2);
        assert_eq!(mapped.errors[1].line, 3);
        assert_eq!(format_warning(&mapped.warnings[0]), "CR,1,4: at 1");
    }
}
