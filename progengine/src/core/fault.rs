//! Mapping of runtime faults back to the program author's line numbers.

use crate::core::diagnostics::LineOffsets;
use crate::core::types::{CodeBlock, ProgramError, ScriptFault};

/// Build the `ProgramError` for a fault raised by a bound operation.
///
/// The raw line comes from the first frame declared by `entry_type` (matched
/// as a suffix of the frame's fully-qualified type), falling back to the
/// innermost frame, and to 0 when the fault carries no stack. The caller says
/// which fragment was executing; the fault alone cannot tell.
pub fn format_fault(
    fault: &ScriptFault,
    entry_type: &str,
    offsets: &LineOffsets,
    is_trigger_block: bool,
) -> ProgramError {
    let raw_line = fault_line(fault, entry_type);
    let (code_block, line) = if is_trigger_block {
        (
            CodeBlock::TriggerCondition,
            raw_line - (offsets.trigger_offset + offsets.main_offset + offsets.main_line_count),
        )
    } else {
        (CodeBlock::MainBody, raw_line - offsets.main_offset)
    };
    ProgramError {
        line,
        column: 0,
        error_message: fault.message.clone(),
        error_number: ProgramError::SYNTHETIC_CODE.to_string(),
        code_block,
    }
}

fn fault_line(fault: &ScriptFault, entry_type: &str) -> i64 {
    let Some(first) = fault.frames.first() else {
        return 0;
    };
    fault
        .frames
        .iter()
        .find(|frame| {
            frame
                .declaring_type
                .as_deref()
                .is_some_and(|name| name.ends_with(entry_type))
        })
        .unwrap_or(first)
        .line
}
