//! Capture command construction.

use std::path::Path;

use process_utils::{expand_template, split_command_line};

/// Values substituted into the capture command template.
#[derive(Debug, Clone, Copy)]
pub struct CommandValues<'a> {
    pub server: &'a str,
    pub channel: &'a str,
    pub auth_token: &'a str,
    pub output_path: &'a Path,
}

/// Expand `template` into capture tool arguments.
///
/// The template is split into words before substitution so that values
/// containing whitespace stay a single argument.
pub fn build_capture_args(template: &str, values: CommandValues<'_>) -> Vec<String> {
    let output = values.output_path.to_string_lossy();
    let substitutions = [
        ("SERVER", values.server),
        ("CHANNEL", values.channel),
        ("AUTHTOKEN", values.auth_token),
        ("FULLOUTPUTPATH", output.as_ref()),
    ];

    split_command_line(template)
        .iter()
        .map(|word| expand_template(word, &substitutions))
        .collect()
}
