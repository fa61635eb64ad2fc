use crate::task::Template;

/// Wrap `text` with the template, then fill `{{key}}` placeholders from
/// `context`. Placeholders with no matching key are left as they are.
pub fn apply_template(text: &str, template: &Template, context: &[(&str, &str)]) -> String {
    let mut out = format!("{}{}{}", template.prefix, text, template.suffix);
    for (key, value) in context {
        let placeholder = format!("{{{{{}}}}}", key);
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, value);
        }
    }
    out
}
