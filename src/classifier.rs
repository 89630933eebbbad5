//! Light/heavy classification of incoming video file names.
//!
//! A "light" file already carries subtitles in the target script, so it skips
//! transcription and translation. The decision is a pure function of the file
//! name and is taken exactly once, at admission.

use regex::Regex;
use std::sync::LazyLock;

use crate::job::JobKind;

/// Release-name marker for an embedded subtitle track, e.g. `SONE-269-C.mp4`.
static MARKER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^[:alnum:]])c(?:[^[:alnum:]]|$)").expect("valid marker pattern")
});

static LANGUAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let codes = LANGUAGE_CODES
        .iter()
        .map(|code| regex::escape(code))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?i)(?:^|[^[:alnum:]])(?:{})(?:[^[:alnum:]]|$)",
        codes
    ))
    .expect("valid language pattern")
});

/// Longer codes first so `zh-cn` is not shadowed by `zh`.
const LANGUAGE_CODES: &[&str] = &[
    "zh-hans", "zh-hant", "zh-cn", "zh-tw", "big5", "chs", "cht", "chi", "zho", "zh", "gb",
];

const SCRIPT_TERMS: &[&str] = &["中文", "中字", "字幕", "简体", "繁体", "繁體", "简中", "繁中"];

/// True when the name says the video already carries target-script subtitles.
pub fn is_light(file_name: &str) -> bool {
    MARKER_PATTERN.is_match(file_name)
        || LANGUAGE_PATTERN.is_match(file_name)
        || SCRIPT_TERMS.iter().any(|term| file_name.contains(term))
}

pub fn classify(file_name: &str) -> JobKind {
    if is_light(file_name) {
        JobKind::Light
    } else {
        JobKind::Heavy
    }
}
