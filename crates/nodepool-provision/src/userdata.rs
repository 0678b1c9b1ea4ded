//! Boot payload rendering.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` stand for literal
//! braces so shell snippets like `${{HOME}}` survive.

use std::io::Write;

use tempfile::NamedTempFile;

use nodepool_core::OpenStackConfig;

use crate::error::{ProvisionError, ProvisionResult};
use crate::probe::UP_MARKER;

/// Substitute `values` into `template`.
///
/// Unknown placeholders and unbalanced braces are errors.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => key.push(c),
                        None => return Err(format!("unterminated placeholder {{{key}")),
                    }
                }
                let value = values
                    .iter()
                    .find(|(name, _)| *name == key)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| format!("unknown placeholder {{{key}}}"))?;
                out.push_str(value);
            }
            '}' => return Err("single '}' in template".to_string()),
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Render the user-data for one OS into a temp file.
///
/// The file is removed when the returned handle is dropped.
pub fn write_user_data(
    settings: &OpenStackConfig,
    lab_domain: &str,
    os_type: &str,
    os_version: &str,
) -> ProvisionResult<NamedTempFile> {
    let path = settings.user_data_path(os_type, os_version);
    let template_error = |message: String| ProvisionError::Template {
        path: path.clone(),
        message,
    };

    let template = std::fs::read_to_string(&path).map_err(|e| template_error(e.to_string()))?;
    let rendered = render_template(
        &template,
        &[
            ("up", UP_MARKER),
            ("nameserver", &settings.nameserver),
            ("username", &settings.username),
            ("lab_domain", lab_domain),
        ],
    )
    .map_err(template_error)?;

    let mut file = NamedTempFile::new()?;
    file.write_all(rendered.as_bytes())?;
    file.flush()?;
    Ok(file)
}
