//! URL-safe record names and collision handling.

use tracing::debug;

use geoharvest_shared::{HarvestError, Result};
use geoharvest_storage::Storage;

/// Longest name the record store accepts.
pub const MAX_NAME_LENGTH: usize = 100;

/// Lowercase ASCII slug: Latin accents are folded to their base letters and
/// every run of other non-alphanumerics becomes one `-`.
pub fn slugify(title: &str) -> String {
    let mut folded = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            folded.push(c);
        } else if let Some(ascii) = fold_latin(c) {
            folded.push_str(ascii);
        } else {
            folded.push('-');
        }
    }
    let slug = folded
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    truncate_name(&slug)
}

/// ASCII spelling of a lowercase Latin-1 or Latin Extended-A letter.
fn fold_latin(c: char) -> Option<&'static str> {
    let ascii = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => "c",
        'ď' | 'đ' | 'ð' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => "e",
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => "g",
        'ĥ' | 'ħ' => "h",
        'ì' | 'í' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => "i",
        'ĵ' => "j",
        'ķ' => "k",
        'ĺ' | 'ļ' | 'ľ' | 'ŀ' | 'ł' => "l",
        'ñ' | 'ń' | 'ņ' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => "o",
        'œ' => "oe",
        'ŕ' | 'ŗ' | 'ř' => "r",
        'ś' | 'ŝ' | 'ş' | 'š' => "s",
        'ß' => "ss",
        'ţ' | 'ť' | 'ŧ' => "t",
        'þ' => "th",
        'ù' | 'ú' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => "u",
        'ŵ' => "w",
        'ý' | 'ÿ' | 'ŷ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    };
    Some(ascii)
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LENGTH {
        return name.to_string();
    }
    name[..MAX_NAME_LENGTH].trim_end_matches('-').to_string()
}

/// Pick `base` or the first free `base1`, `base2`, ... up to `max_attempts`.
///
/// `taken` holds the existing names sharing the prefix.
pub fn pick_free_name(base: &str, taken: &[String], max_attempts: u32) -> Option<String> {
    let is_taken = |candidate: &str| taken.iter().any(|t| t == candidate);
    if !is_taken(base) {
        return Some(base.to_string());
    }
    (1..=max_attempts)
        .map(|n| format!("{base}{n}"))
        .find(|candidate| !is_taken(candidate))
}

/// Generate a unique name from a title, falling back to the GUID.
pub async fn unique_name(
    storage: &Storage,
    title: &str,
    guid: &str,
    max_attempts: u32,
) -> Result<String> {
    for seed in [title, guid] {
        let base = slugify(seed);
        if base.is_empty() {
            continue;
        }
        let taken = storage.names_like(&base).await?;
        if let Some(name) = pick_free_name(&base, &taken, max_attempts) {
            debug!(%name, "assigned record name");
            return Ok(name);
        }
    }
    Err(HarvestError::NameExhausted {
        title: title.to_string(),
    })
}
