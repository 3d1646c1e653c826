use sha1::{Digest, Sha1};

pub const MAX_SLUG_LEN: usize = 255;
const SLUG_CHECKSUM_HEX_LEN: usize = 8;
const FALLBACK_SLUG: &str = "title";

fn clamp_to_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

fn slug_checksum_fragment(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{:x}", digest);
    hex.chars().take(SLUG_CHECKSUM_HEX_LEN).collect::<String>()
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify_token(input: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Slug for a Product/Title keyed by `key`.
///
/// The checksum suffix keeps slugs unique per key even when two keys slugify
/// to the same text ("foo+bar" vs "foo bar").
pub fn slug_for_key(key: &str) -> String {
    let mut base = slugify_token(key);
    if base.is_empty() {
        base = FALLBACK_SLUG.to_string();
    }

    let checksum = slug_checksum_fragment(key);
    let max_base_chars = MAX_SLUG_LEN.saturating_sub(checksum.len() + 1).max(1);
    if base.chars().count() > max_base_chars {
        base = clamp_to_chars(&base, max_base_chars)
            .trim_matches('-')
            .to_string();
        if base.is_empty() {
            base = FALLBACK_SLUG.to_string();
        }
    }

    format!("{}-{}", base, checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_stable_and_checksummed() {
        let a = slug_for_key("grand theft auto v");
        assert!(a.starts_with("grand-theft-auto-v-"));
        assert_eq!(a, slug_for_key("grand theft auto v"));
        assert_eq!(a.len(), "grand-theft-auto-v-".len() + SLUG_CHECKSUM_HEX_LEN);
    }

    #[test]
    fn colliding_slugify_output_gets_distinct_slugs() {
        assert_eq!(slugify_token("foo+bar"), slugify_token("foo bar"));
        assert_ne!(slug_for_key("foo+bar"), slug_for_key("foo bar"));
    }

    #[test]
    fn long_and_symbol_only_keys_are_bounded() {
        let long = "x".repeat(600);
        assert!(slug_for_key(&long).chars().count() <= MAX_SLUG_LEN);
        assert!(slug_for_key("™").starts_with("title-"));
    }
}
