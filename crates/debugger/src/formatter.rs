//! Rendering of engine values into display strings.

use config::FormattingSettings;

use crate::engine::{ChildKey, EngineValue};

/// Display text plus whether the value has children worth a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedValue {
    pub display: String,
    pub is_expandable: bool,
}

impl FormattedValue {
    fn leaf(display: impl Into<String>) -> Self {
        Self {
            display: display.into(),
            is_expandable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValueFormatter {
    true_literal: String,
    false_literal: String,
    null_literal: String,
}

impl Default for ValueFormatter {
    fn default() -> Self {
        Self::new(&FormattingSettings::default())
    }
}

impl ValueFormatter {
    pub fn new(settings: &FormattingSettings) -> Self {
        Self {
            true_literal: settings.true_literal.clone(),
            false_literal: settings.false_literal.clone(),
            null_literal: settings.null_literal.clone(),
        }
    }

    pub fn format(&self, value: &EngineValue) -> FormattedValue {
        match value {
            EngineValue::Null => FormattedValue::leaf(&self.null_literal),
            EngineValue::NullSentinel { type_tag } => FormattedValue::leaf(format!("[{type_tag}]")),
            EngineValue::Bool(b) => FormattedValue::leaf(self.bool_literal(*b)),
            EngineValue::Int(i) => FormattedValue::leaf(i.to_string()),
            EngineValue::Float(f) => FormattedValue::leaf(f.to_string()),
            EngineValue::String(s) => FormattedValue::leaf(format!("\"{s}\"")),
            EngineValue::Enum { name, .. } => FormattedValue::leaf(name),
            EngineValue::Sequence { type_tag, len, .. }
            | EngineValue::Mapping { type_tag, len, .. } => FormattedValue {
                display: format!("[{type_tag}: {len}]"),
                is_expandable: *len > 0,
            },
            EngineValue::Record { fields, .. } => {
                let summary = fields
                    .iter()
                    .map(|(name, value)| format!("{name}={}", self.summary_text(value)))
                    .collect::<Vec<_>>()
                    .join("; ");
                FormattedValue {
                    display: format!("@{{{summary}}}"),
                    is_expandable: !fields.is_empty(),
                }
            }
            EngineValue::Object {
                display,
                child_count,
                ..
            } => FormattedValue {
                display: display.clone(),
                is_expandable: *child_count > 0,
            },
        }
    }

    /// Display name of a child entry under its parent
    pub fn child_name(&self, key: &ChildKey) -> String {
        match key {
            ChildKey::Index(i) => format!("[{i}]"),
            ChildKey::Key(k) => k.clone(),
            ChildKey::Field(f) => f.clone(),
        }
    }

    fn bool_literal(&self, b: bool) -> &str {
        if b {
            &self.true_literal
        } else {
            &self.false_literal
        }
    }

    // strings are not quoted inside a record summary
    fn summary_text(&self, value: &EngineValue) -> String {
        match value {
            EngineValue::String(s) => s.clone(),
            other => self.format(other).display,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ValueRef;

    fn formatter() -> ValueFormatter {
        ValueFormatter::default()
    }

    #[test]
    fn scalars() {
        let f = formatter();
        assert_eq!(f.format(&EngineValue::Int(42)), FormattedValue::leaf("42"));
        assert_eq!(f.format(&EngineValue::Bool(true)).display, "$true");
        assert_eq!(f.format(&EngineValue::Bool(false)).display, "$false");
        assert_eq!(
            f.format(&EngineValue::String("Hello".to_string())).display,
            "\"Hello\""
        );
        assert_eq!(f.format(&EngineValue::Float(1.5)).display, "1.5");
        assert!(!f.format(&EngineValue::String("x".into())).is_expandable);
    }

    #[test]
    fn null_like_values() {
        let f = formatter();
        assert_eq!(f.format(&EngineValue::Null).display, "$null");
        let sentinel = f.format(&EngineValue::NullSentinel {
            type_tag: "NullString".to_string(),
        });
        assert_eq!(sentinel.display, "[NullString]");
        assert!(!sentinel.is_expandable);
    }

    #[test]
    fn enum_renders_symbolic_name() {
        let formatted = formatter().format(&EngineValue::Enum {
            type_name: "ActionPreference".to_string(),
            name: "Continue".to_string(),
        });
        assert_eq!(formatted, FormattedValue::leaf("Continue"));
    }

    #[test]
    fn collections_report_count() {
        let f = formatter();
        let empty = f.format(&EngineValue::Mapping {
            type_tag: "Hashtable".to_string(),
            len: 0,
            reference: ValueRef(1),
        });
        assert_eq!(empty.display, "[Hashtable: 0]");
        assert!(!empty.is_expandable);

        let full = f.format(&EngineValue::Mapping {
            type_tag: "Hashtable".to_string(),
            len: 2,
            reference: ValueRef(2),
        });
        assert_eq!(full.display, "[Hashtable: 2]");
        assert!(full.is_expandable);

        let seq = f.format(&EngineValue::Sequence {
            type_tag: "Object[]".to_string(),
            len: 3,
            reference: ValueRef(3),
        });
        assert_eq!(seq.display, "[Object[]: 3]");
        assert!(seq.is_expandable);
    }

    #[test]
    fn record_summary() {
        let formatted = formatter().format(&EngineValue::Record {
            type_name: "PSCustomObject".to_string(),
            fields: vec![
                ("Name".to_string(), EngineValue::String("Paul".to_string())),
                ("Age".to_string(), EngineValue::Int(73)),
            ],
            reference: ValueRef(4),
        });
        assert_eq!(formatted.display, "@{Name=Paul; Age=73}");
        assert!(formatted.is_expandable);
    }

    #[test]
    fn custom_literals() {
        let f = ValueFormatter::new(&FormattingSettings {
            true_literal: "True".to_string(),
            false_literal: "False".to_string(),
            null_literal: "null".to_string(),
        });
        assert_eq!(f.format(&EngineValue::Bool(true)).display, "True");
        assert_eq!(f.format(&EngineValue::Null).display, "null");
    }

    #[test]
    fn child_names() {
        let f = formatter();
        assert_eq!(f.child_name(&ChildKey::Index(0)), "[0]");
        assert_eq!(f.child_name(&ChildKey::Key("firstChild".into())), "firstChild");
        assert_eq!(f.child_name(&ChildKey::Field("Age".into())), "Age");
    }
}
