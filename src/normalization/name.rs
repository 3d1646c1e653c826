use regex::Regex;
use std::sync::OnceLock;

/// Edition-style suffixes removed from the end of a name. Longer phrases come
/// first so "digital deluxe edition" is not left behind as "digital".
pub const EDITION_SUFFIXES: &[&str] = &[
    "game of the year edition",
    "digital deluxe edition",
    "definitive edition",
    "collector's edition",
    "collectors edition",
    "anniversary edition",
    "complete edition",
    "enhanced edition",
    "ultimate edition",
    "standard edition",
    "special edition",
    "premium edition",
    "deluxe edition",
    "goty edition",
    "gold edition",
    "game of the year",
    "director's cut",
    "remastered",
    "goty",
];

/// Words that mark a parenthetical group as a release tag rather than part of the name.
pub const PARENTHETICAL_TAGS: &[&str] = &["legacy", "classic", "remastered", "digital", "anniversary"];

fn parenthetical_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^()]*\)").expect("static regex"))
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}\b").expect("static regex"))
}

/// Build the matching key for a provider-reported game name.
///
/// Steps, in order:
/// - lowercase
/// - smart quotes and dashes to ASCII
/// - ™ ® © ℠ and `: - _ . ,` to spaces
/// - `&` to `and`
/// - drop parenthetical groups holding a 4-digit year or a release tag word
/// - drop trailing edition suffixes (repeated until none is left)
/// - collapse whitespace and trim
///
/// The function is pure and idempotent. Different names may share a key on
/// purpose; that collision is what groups provider records onto one title.
pub fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();

    let mut ascii = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' | '`' => ascii.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => ascii.push('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => ascii.push('-'),
            _ => ascii.push(ch),
        }
    }

    let spaced: String = ascii
        .chars()
        .map(|c| match c {
            '\u{2122}' | '\u{00AE}' | '\u{00A9}' | '\u{2120}' => ' ',
            ':' | '-' | '_' | '.' | ',' => ' ',
            _ => c,
        })
        .collect::<String>()
        // tag words and suffixes glued to an ampersand must be visible to the stages below
        .replace('&', " and ");

    let mut without_tags = spaced;
    loop {
        let next = parenthetical_re()
            .replace_all(&without_tags, |caps: &regex::Captures| {
                let group = &caps[0];
                if is_release_tag_group(group) {
                    " ".to_string()
                } else {
                    group.to_string()
                }
            })
            .into_owned();
        if next == without_tags {
            break;
        }
        without_tags = next;
    }

    strip_edition_suffixes(collapse_whitespace(&without_tags))
}

fn strip_edition_suffixes(mut key: String) -> String {
    while let Some(stripped) = strip_edition_suffix(&key) {
        key = stripped;
    }
    key
}

fn is_release_tag_group(group: &str) -> bool {
    if year_re().is_match(group) {
        return true;
    }
    group
        .trim_matches(|c| c == '(' || c == ')')
        .split_whitespace()
        .any(|word| PARENTHETICAL_TAGS.contains(&word))
}

/// Removes one trailing suffix, only when something precedes it.
fn strip_edition_suffix(key: &str) -> Option<String> {
    for suffix in EDITION_SUFFIXES {
        if let Some(head) = key.strip_suffix(suffix) {
            if head.ends_with(' ') && !head.trim().is_empty() {
                return Some(head.trim_end().to_string());
            }
        }
    }
    None
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
