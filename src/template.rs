//! Template Engine
//!
//! Header and parameter templates are parsed once, when a model is loaded,
//! into tagged values (literal text, placeholder slots, list items, verbatim
//! JSON). Rendering walks that structure and never rescans substituted text,
//! so a prompt that itself contains `$PROMPT` is inserted as-is.
//!
//! Substitution rules:
//! - header values: `$API_TOKEN` is replaced with the caller's token
//! - string params: `$PROMPT` is replaced with the prompt text
//! - list params: elements equal to `$PROMPT` become `{"role": "user", "content": <prompt>}`
//! - everything else passes through unchanged

use serde_json::{Map, Value};
use thiserror::Error;

pub const API_TOKEN_PLACEHOLDER: &str = "$API_TOKEN";
pub const PROMPT_PLACEHOLDER: &str = "$PROMPT";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("header {0:?} must be a string template")]
    NonStringHeader(String),
}

/// Reserved markers recognised inside template strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    ApiToken,
    Prompt,
}

impl Placeholder {
    pub fn token(self) -> &'static str {
        match self {
            Placeholder::ApiToken => API_TOKEN_PLACEHOLDER,
            Placeholder::Prompt => PROMPT_PLACEHOLDER,
        }
    }
}

/// Values bound to placeholders for a single render.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub api_token: &'a str,
    pub prompt: &'a str,
}

impl<'a> Bindings<'a> {
    pub fn new(api_token: &'a str, prompt: &'a str) -> Self {
        Self { api_token, prompt }
    }

    fn value(&self, placeholder: Placeholder) -> &'a str {
        match placeholder {
            Placeholder::ApiToken => self.api_token,
            Placeholder::Prompt => self.prompt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// A string split into literal runs and placeholder slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemplateString {
    segments: Vec<Segment>,
}

impl TemplateString {
    /// Parse `raw`, recognising only `placeholder`. Other `$NAME` text stays literal.
    pub fn parse(raw: &str, placeholder: Placeholder) -> Self {
        let token = placeholder.token();
        let mut segments = Vec::new();
        let mut rest = raw;

        while let Some(pos) = rest.find(token) {
            if pos > 0 {
                segments.push(Segment::Literal(rest[..pos].to_string()));
            }
            segments.push(Segment::Slot(placeholder));
            rest = &rest[pos + token.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Self { segments }
    }

    /// True when the whole string is exactly one placeholder.
    pub fn is_bare(&self, placeholder: Placeholder) -> bool {
        matches!(self.segments.as_slice(), [Segment::Slot(p)] if *p == placeholder)
    }

    pub fn render(&self, bindings: &Bindings<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(p) => out.push_str(bindings.value(*p)),
            }
        }
        out
    }
}

/// One element of a list-valued param.
#[derive(Debug, Clone, PartialEq)]
pub enum ListItem {
    /// Element equal to `$PROMPT`; renders as a user message object.
    UserMessage,
    Verbatim(Value),
}

/// Compiled form of a single top-level param.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamTemplate {
    Text(TemplateString),
    List(Vec<ListItem>),
    Verbatim(Value),
}

impl ParamTemplate {
    pub fn compile(value: &Value) -> Self {
        match value {
            Value::String(s) => ParamTemplate::Text(TemplateString::parse(s, Placeholder::Prompt)),
            Value::Array(items) => ParamTemplate::List(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s)
                            if TemplateString::parse(s, Placeholder::Prompt)
                                .is_bare(Placeholder::Prompt) =>
                        {
                            ListItem::UserMessage
                        }
                        other => ListItem::Verbatim(other.clone()),
                    })
                    .collect(),
            ),
            other => ParamTemplate::Verbatim(other.clone()),
        }
    }

    pub fn render(&self, bindings: &Bindings<'_>) -> Value {
        match self {
            ParamTemplate::Text(t) => Value::String(t.render(bindings)),
            ParamTemplate::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        ListItem::UserMessage => user_message(bindings.prompt),
                        ListItem::Verbatim(v) => v.clone(),
                    })
                    .collect(),
            ),
            ParamTemplate::Verbatim(v) => v.clone(),
        }
    }
}

/// Build the `{"role": "user", "content": ...}` message object.
pub fn user_message(content: &str) -> Value {
    serde_json::json!({ "role": "user", "content": content })
}

/// Headers and params of one model, ready to render per call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestTemplate {
    headers: Vec<(String, TemplateString)>,
    params: Vec<(String, ParamTemplate)>,
}

impl RequestTemplate {
    pub fn compile(
        headers: &Map<String, Value>,
        params: &Map<String, Value>,
    ) -> Result<Self, TemplateError> {
        let headers = headers
            .iter()
            .map(|(name, value)| match value {
                Value::String(s) => Ok((
                    name.clone(),
                    TemplateString::parse(s, Placeholder::ApiToken),
                )),
                _ => Err(TemplateError::NonStringHeader(name.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let params = params
            .iter()
            .map(|(key, value)| (key.clone(), ParamTemplate::compile(value)))
            .collect();

        Ok(Self { headers, params })
    }

    pub fn render(&self, bindings: &Bindings<'_>) -> RenderedRequest {
        RenderedRequest {
            headers: self
                .headers
                .iter()
                .map(|(name, t)| (name.clone(), t.render(bindings)))
                .collect(),
            params: self
                .params
                .iter()
                .map(|(key, t)| (key.clone(), t.render(bindings)))
                .collect(),
        }
    }
}

/// Output of a render: concrete headers (in config order) and JSON body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderedRequest {
    pub headers: Vec<(String, String)>,
    pub params: Map<String, Value>,
}

impl RenderedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Render a compiled template with the caller's token and prompt.
pub fn render(template: &RequestTemplate, api_token: &str, prompt: &str) -> RenderedRequest {
    template.render(&Bindings::new(api_token, prompt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(headers: Value, params: Value) -> RequestTemplate {
        RequestTemplate::compile(
            headers.as_object().unwrap(),
            params.as_object().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn renders_bearer_header_and_message_list() {
        let template = compile(
            json!({"Authorization": "Bearer $API_TOKEN"}),
            json!({"messages": ["$PROMPT"]}),
        );

        let rendered = render(&template, "abc", "hi");

        assert_eq!(
            rendered.headers,
            vec![("Authorization".to_string(), "Bearer abc".to_string())]
        );
        assert_eq!(
            Value::Object(rendered.params),
            json!({"messages": [{"role": "user", "content": "hi"}]})
        );
    }

    #[test]
    fn placeholder_free_input_renders_unchanged() {
        let headers = json!({"Content-Type": "application/json", "X-Plain": "$OTHER"});
        let params = json!({
            "model": "claude-2",
            "max_tokens_to_sample": 300,
            "stop": ["\n\nHuman:"],
            "nested": {"a": [1, 2, {"b": "c"}]},
            "stream": false
        });
        let template = compile(headers.clone(), params.clone());

        let rendered = render(&template, "tok", "prompt");

        let rendered_headers: Map<String, Value> = rendered
            .headers
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        assert_eq!(Value::Object(rendered_headers), headers);
        assert_eq!(Value::Object(rendered.params), params);
    }

    #[test]
    fn changing_the_token_only_changes_the_token_header() {
        let template = compile(
            json!({"Authorization": "Bearer $API_TOKEN", "Accept": "application/json"}),
            json!({"prompt": "Q: $PROMPT"}),
        );

        let first = render(&template, "T1", "same");
        let second = render(&template, "T2", "same");

        assert_eq!(first.params, second.params);
        assert_eq!(first.header("Accept"), second.header("Accept"));
        assert_eq!(first.header("Authorization"), Some("Bearer T1"));
        assert_eq!(second.header("Authorization"), Some("Bearer T2"));
    }

    #[test]
    fn template_is_reusable_across_calls() {
        let template = compile(json!({}), json!({"prompt": "$PROMPT"}));
        let before = template.clone();

        let a = render(&template, "t", "first");
        let b = render(&template, "t", "second");

        assert_eq!(template, before);
        assert_eq!(a.params["prompt"], "first");
        assert_eq!(b.params["prompt"], "second");
    }

    #[test]
    fn list_substitution_preserves_length_and_order() {
        let template = compile(
            json!({}),
            json!({"messages": [
                {"role": "system", "content": "be brief"},
                "$PROMPT",
                "Say: $PROMPT",
                "$PROMPT"
            ]}),
        );

        let rendered = render(&template, "t", "hello");
        let messages = rendered.params["messages"].as_array().unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(messages[1], user_message("hello"));
        // Only bare placeholders are replaced inside lists.
        assert_eq!(messages[2], json!("Say: $PROMPT"));
        assert_eq!(messages[3], user_message("hello"));
    }

    #[test]
    fn string_params_replace_every_occurrence() {
        let template = compile(
            json!({}),
            json!({"prompt": "\n\nHuman: $PROMPT\n\nAssistant: ($PROMPT)"}),
        );

        let rendered = render(&template, "t", "2+2?");

        assert_eq!(
            rendered.params["prompt"],
            "\n\nHuman: 2+2?\n\nAssistant: (2+2?)"
        );
    }

    #[test]
    fn substituted_text_is_not_expanded_again() {
        let template = compile(
            json!({"Authorization": "$API_TOKEN"}),
            json!({"prompt": "$PROMPT"}),
        );

        let rendered = render(&template, "$API_TOKEN", "$PROMPT $PROMPT");

        assert_eq!(rendered.header("Authorization"), Some("$API_TOKEN"));
        assert_eq!(rendered.params["prompt"], "$PROMPT $PROMPT");
    }

    #[test]
    fn headers_ignore_prompt_and_params_ignore_token() {
        let template = compile(
            json!({"X-Prompt": "$PROMPT"}),
            json!({"token": "$API_TOKEN"}),
        );

        let rendered = render(&template, "secret", "hi");

        assert_eq!(rendered.header("X-Prompt"), Some("$PROMPT"));
        assert_eq!(rendered.params["token"], "$API_TOKEN");
    }

    #[test]
    fn nested_objects_pass_through() {
        let template = compile(json!({}), json!({"extra": {"inner": "$PROMPT"}}));

        let rendered = render(&template, "t", "hi");

        assert_eq!(rendered.params["extra"], json!({"inner": "$PROMPT"}));
    }

    #[test]
    fn non_string_header_is_rejected() {
        let err = RequestTemplate::compile(
            json!({"X-Retries": 3}).as_object().unwrap(),
            &Map::new(),
        )
        .unwrap_err();
        assert_eq!(err, TemplateError::NonStringHeader("X-Retries".to_string()));
    }

    #[test]
    fn parse_tracks_slots() {
        let t = TemplateString::parse("Bearer $API_TOKEN", Placeholder::ApiToken);
        assert!(!t.is_bare(Placeholder::ApiToken));
        assert_eq!(
            t.render(&Bindings::new("x", "unused")),
            "Bearer x"
        );
        assert!(TemplateString::parse("$PROMPT", Placeholder::Prompt).is_bare(Placeholder::Prompt));
        assert!(!TemplateString::parse("$PROMPT", Placeholder::ApiToken).is_bare(Placeholder::Prompt));
    }
}
