//! User-prompt assembly shared by the walk and by prompt reconstruction.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template references unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),
    #[error("template has an unclosed '{{' at byte {0}")]
    UnclosedBrace(usize),
    #[error("template has an unmatched '}}' at byte {0}")]
    UnmatchedBrace(usize),
}

/// Values substituted into a walk template for one step.
#[derive(Debug, Clone, Copy)]
pub struct PromptFields<'a> {
    pub profile: &'a str,
    pub style: &'a str,
    pub current_state: &'a str,
}

impl<'a> PromptFields<'a> {
    fn lookup(&self, name: &str) -> Option<&'a str> {
        match name {
            "profile" => Some(self.profile),
            "style" => Some(self.style),
            "current_state" => Some(self.current_state),
            _ => None,
        }
    }
}

pub fn render(template: &str, fields: &PromptFields<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                if !closed {
                    return Err(TemplateError::UnclosedBrace(idx));
                }
                let value = fields
                    .lookup(name.trim())
                    .ok_or_else(|| TemplateError::UnknownPlaceholder(name.clone()))?;
                out.push_str(value);
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                    out.push('}');
                    continue;
                }
                return Err(TemplateError::UnmatchedBrace(idx));
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Checks a template before any model call is made.
pub fn validate(template: &str) -> Result<(), TemplateError> {
    render(
        template,
        &PromptFields {
            profile: "",
            style: "",
            current_state: "",
        },
    )
    .map(|_| ())
}

/// Renders the template and appends the image caption as a factual note.
pub fn assemble_user_prompt(
    template: &str,
    fields: &PromptFields<'_>,
    caption: Option<&str>,
) -> Result<String, TemplateError> {
    let mut prompt = render(template, fields)?;
    if let Some(caption) = caption.filter(|value| !value.is_empty()) {
        prompt.push_str(&format!("\n\nThe image caption: \"{caption}\""));
    }
    Ok(prompt)
}
