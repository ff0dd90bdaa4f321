//! Child-process helpers for the capture supervisor.
//!
//! - `tokio_command` builds a command that never opens a console window on Windows.
//! - `expand_template` / `split_command_line` turn a configured capture command
//!   line (with `[PLACEHOLDER]` tokens) into a program plus argument vector.
//! - `kill_and_reap` terminates a child and collects its exit code.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Kill a running child and wait for it to exit.
///
/// Returns the exit code if the platform reports one (signals yield `None`).
/// A child that already exited is simply reaped.
#[cfg(feature = "tokio")]
pub async fn kill_and_reap(child: &mut tokio::process::Child) -> std::io::Result<Option<i32>> {
    if let Some(status) = child.try_wait()? {
        return Ok(status.code());
    }
    // `start_kill` fails with InvalidInput when the child exited in between.
    if let Err(e) = child.start_kill()
        && e.kind() != std::io::ErrorKind::InvalidInput
    {
        return Err(e);
    }
    let status = child.wait().await?;
    Ok(status.code())
}

/// Replace every `[NAME]` placeholder in `template` with its value.
///
/// Unknown placeholders are left untouched.
pub fn expand_template(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("[{name}]"), value)
        })
}

/// Split a command line into words.
///
/// Whitespace separates words. Single quotes keep their content verbatim,
/// double quotes keep whitespace and allow `\"` and `\\` escapes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_word = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                        }
                        _ => current.push(q),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }
    words
}
