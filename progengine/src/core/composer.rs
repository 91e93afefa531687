//! Composition of a program's fragments into a single compilation unit.
//!
//! A wrapper template carries the boilerplate around the two user fragments.
//! Each fragment replaces a marker line, so the number of template lines in
//! front of a fragment is fixed by the template alone. Those counts are the
//! offsets the diagnostic and fault mappers subtract to get back to
//! fragment-relative lines.

use thiserror::Error;

use crate::core::types::fragment_line_count;

/// Marker line replaced by the main program body.
pub const PROGRAM_MARKER: &str = "{{program}}";
/// Marker line replaced by the trigger condition.
pub const CONDITION_MARKER: &str = "{{condition}}";

/// Wrapper used when no template file is configured.
pub const DEFAULT_TEMPLATE: &str = r#"// Generated program unit. Edits are overwritten on every compile.
import host.prelude.*;
import host.net.*;
import host.data.*;

namespace automation.scripting {

class ScriptingInstance extends ProgramBase {

    function main(options) {
{{program}}
    }

    function condition() {
        return (
{{condition}}
        );
    }

    function setup() {
        return condition();
    }

    function run(options) {
        main(options);
        return true;
    }
}

}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template is missing the `{0}` marker line")]
    MissingMarker(&'static str),
    #[error("template has more than one `{0}` marker line")]
    DuplicateMarker(&'static str),
    #[error("the `{{{{program}}}}` marker must come before `{{{{condition}}}}`")]
    MarkersOutOfOrder,
}

/// Parsed wrapper template with its two insertion points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperTemplate {
    head: Vec<String>,
    middle: Vec<String>,
    tail: Vec<String>,
}

/// Composed compilation unit and the offsets of its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    pub text: String,
    /// Template lines preceding the main body.
    pub main_offset: i64,
    /// Template lines between the end of the main body and the trigger condition.
    pub trigger_offset: i64,
    /// Line count of the main body as inserted.
    pub main_line_count: i64,
}

impl WrapperTemplate {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let lines: Vec<&str> = text.split('\n').collect();
        let program = find_marker(&lines, PROGRAM_MARKER)?;
        let condition = find_marker(&lines, CONDITION_MARKER)?;
        if condition < program {
            return Err(TemplateError::MarkersOutOfOrder);
        }
        let owned = |slice: &[&str]| slice.iter().map(|line| line.to_string()).collect();
        Ok(Self {
            head: owned(&lines[..program]),
            middle: owned(&lines[program + 1..condition]),
            tail: owned(&lines[condition + 1..]),
        })
    }

    pub fn main_offset(&self) -> i64 {
        self.head.len() as i64
    }

    pub fn trigger_offset(&self) -> i64 {
        self.middle.len() as i64
    }

    /// Insert both fragments. A missing trigger condition becomes one empty line.
    ///
    /// Output is a pure function of the inputs.
    pub fn compose(&self, main_source: &str, trigger_source: Option<&str>) -> Composition {
        let trigger = trigger_source.unwrap_or("");
        let mut parts: Vec<&str> =
            Vec::with_capacity(self.head.len() + self.middle.len() + self.tail.len() + 2);
        parts.extend(self.head.iter().map(String::as_str));
        parts.push(main_source);
        parts.extend(self.middle.iter().map(String::as_str));
        parts.push(trigger);
        parts.extend(self.tail.iter().map(String::as_str));
        Composition {
            text: parts.join("\n"),
            main_offset: self.main_offset(),
            trigger_offset: self.trigger_offset(),
            main_line_count: fragment_line_count(main_source),
        }
    }
}

impl Default for WrapperTemplate {
    fn default() -> Self {
        match Self::parse(DEFAULT_TEMPLATE) {
            Ok(template) => template,
            Err(err) => unreachable!("built-in template is invalid: {err}"),
        }
    }
}

fn find_marker(lines: &[&str], marker: &'static str) -> Result<usize, TemplateError> {
    let mut found = None;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim() == marker {
            if found.is_some() {
                return Err(TemplateError::DuplicateMarker(marker));
            }
            found = Some(idx);
        }
    }
    found.ok_or(TemplateError::MissingMarker(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(head: usize, middle: usize) -> String {
        let mut lines = Vec::new();
        lines.extend((0..head).map(|i| format!("// head {i}")));
        lines.push(PROGRAM_MARKER.to_string());
        lines.extend((0..middle).map(|i| format!("// middle {i}")));
        lines.push(CONDITION_MARKER.to_string());
        lines.push("// tail".to_string());
        lines.join("\n")
    }

    #[test]
    fn offsets_count_template_lines_before_each_fragment() {
        let wrapper = WrapperTemplate::parse(&template(10, 2)).expect("parse");
        assert_eq!(wrapper.main_offset(), 10);
        assert_eq!(wrapper.trigger_offset(), 2);
    }

    #[test]
    fn compose_places_fragments_at_offsets() {
        let wrapper = WrapperTemplate::parse(&template(3, 2)).expect("parse");
        let composed = wrapper.compose("a\nb", Some("true && false"));
        let lines: Vec<&str> = composed.text.split('\n').collect();

        assert_eq!(composed.main_line_count, 2);
        assert_eq!(lines[3], "a");
        assert_eq!(lines[4], "b");
        let trigger_idx = (composed.main_offset + composed.main_line_count + composed.trigger_offset)
            as usize;
        assert_eq!(lines[trigger_idx], "true && false");
        assert_eq!(lines.last().copied(), Some("// tail"));
    }

    #[test]
    fn compose_is_deterministic() {
        let wrapper = WrapperTemplate::default();
        let first = wrapper.compose("x = 1;", None);
        let second = wrapper.compose("x = 1;", None);
        assert_eq!(first, second);
    }

    #[test]
    fn missing_trigger_is_single_empty_line() {
        let wrapper = WrapperTemplate::parse(&template(0, 0)).expect("parse");
        let composed = wrapper.compose("main", None);
        assert_eq!(composed.text, "main\n\n// tail");
    }

    #[test]
    fn markers_tolerate_indentation() {
        let text = format!("  {PROGRAM_MARKER}\n\t{CONDITION_MARKER}  ");
        let wrapper = WrapperTemplate::parse(&text).expect("parse");
        assert_eq!(wrapper.main_offset(), 0);
        assert_eq!(wrapper.trigger_offset(), 0);
    }

    #[test]
    fn parse_rejects_bad_templates() {
        assert_eq!(
            WrapperTemplate::parse("nothing here"),
            Err(TemplateError::MissingMarker(PROGRAM_MARKER))
        );
        let duplicated = format!("{PROGRAM_MARKER}\n{PROGRAM_MARKER}\n{CONDITION_MARKER}");
        assert_eq!(
            WrapperTemplate::parse(&duplicated),
            Err(TemplateError::DuplicateMarker(PROGRAM_MARKER))
        );
        let reversed = format!("{CONDITION_MARKER}\n{PROGRAM_MARKER}");
        assert_eq!(
            WrapperTemplate::parse(&reversed),
            Err(TemplateError::MarkersOutOfOrder)
        );
    }

    #[test]
    fn default_template_parses() {
        let wrapper = WrapperTemplate::default();
        assert!(wrapper.main_offset() > 0);
        assert!(wrapper.trigger_offset() > 0);
    }
}
