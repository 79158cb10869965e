use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed placeholder at byte {offset}")]
    Unclosed { offset: usize },

    #[error("empty placeholder at byte {offset}")]
    Empty { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(Vec<String>),
}

/// `{{field}}` / `{{a.b}}` substitution against a JSON payload.
///
/// Strings are inserted verbatim, other values as compact JSON, and missing
/// paths render as nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(TemplateError::Unclosed {
                offset: offset + start,
            })?;
            let path = after[..end].trim();
            if path.is_empty() {
                return Err(TemplateError::Empty {
                    offset: offset + start,
                });
            }
            segments.push(Segment::Field(
                path.split('.').map(str::to_string).collect(),
            ));
            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, data: &Value) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(path) => {
                    let value = path
                        .iter()
                        .try_fold(data, |current, key| current.get(key.as_str()));
                    match value {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(Value::Null) | None => {}
                        Some(other) => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        out
    }

    /// Dotted paths referenced by the template, in order of appearance.
    pub fn variables(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Field(path) => Some(path.join(".")),
                Segment::Text(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("Cancel {{orderId}}?", "Cancel o1?")]
    #[case("{{customer.name}} owes {{amount}}", "Ada owes 12.5")]
    #[case("{{missing}}!", "!")]
    #[case("Items: {{ items }}", "Items: [1,2]")]
    #[case("plain text", "plain text")]
    fn renders(#[case] source: &str, #[case] expected: &str) {
        let data = json!({
            "orderId": "o1",
            "customer": {"name": "Ada"},
            "amount": 12.5,
            "items": [1, 2]
        });
        let template = PromptTemplate::parse(source).unwrap();
        assert_eq!(template.render(&data), expected);
    }

    #[test]
    fn rejects_unclosed_and_empty_placeholders() {
        assert_eq!(
            PromptTemplate::parse("hello {{name"),
            Err(TemplateError::Unclosed { offset: 6 })
        );
        assert_eq!(
            PromptTemplate::parse("a {{ }}"),
            Err(TemplateError::Empty { offset: 2 })
        );
    }

    #[test]
    fn lists_variables() {
        let template = PromptTemplate::parse("{{a}} and {{b.c}}").unwrap();
        assert_eq!(template.variables(), vec!["a", "b.c"]);
    }
}
