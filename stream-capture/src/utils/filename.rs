//! Capture file naming.
//!
//! Show descriptions come straight from the schedule feed and frequently carry
//! punctuation that shells, ffmpeg's `concat:` protocol or Windows refuse.

/// Characters dropped from capture file names.
const STRIPPED_CHARS: &[char] = &[
    '|', '\'', '/', '\\', ' ', ',', '<', '>', '#', '@', '!', '+', '&', '^', '*', '(', ')', '~',
    '`', ';', ':', '"', '?',
];

/// Build the base file name (no extension) for a show.
///
/// Spaces become underscores, unsafe characters are dropped and starred shows
/// get a leading underscore so they sort first in the output directory.
///
/// ```
/// use stream_capture::utils::filename::capture_file_name;
///
/// assert_eq!(capture_file_name("EPL: Arsenal vs. Spurs", false), "EPL_Arsenal_vs._Spurs");
/// assert_eq!(capture_file_name("Final (Live)", true), "_Final_Live");
/// assert_eq!(capture_file_name("???", false), "unnamed");
/// ```
pub fn capture_file_name(description: &str, starred: bool) -> String {
    let name: String = description
        .replace(' ', "_")
        .chars()
        .filter(|c| !c.is_control() && !STRIPPED_CHARS.contains(c))
        .collect();

    let name = if name.trim_matches('_').is_empty() {
        "unnamed".to_string()
    } else {
        name
    };

    if starred { format!("_{name}") } else { name }
}
