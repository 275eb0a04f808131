//! Unit name generation
//!
//! Units are named `<group>-<suffix>` with an 8 character random suffix. The
//! alphabet leaves out vowels and easily confused characters, giving 27^8
//! (about 2.8e11) possible suffixes per group.

use std::collections::HashSet;

use rand::Rng;
use replicant_common::Error;

/// Characters a suffix is drawn from
pub const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Length of the random suffix
pub const SUFFIX_LEN: usize = 8;

/// Longest unit name we generate (DNS label length)
pub const MAX_NAME_LEN: usize = 63;

/// Candidate names tried before giving up on a unique one
pub const MAX_NAME_ATTEMPTS: usize = 16;

/// Source of name suffixes
pub trait SuffixSource: Send + Sync {
    /// Produce a fresh suffix
    fn suffix(&self) -> String;
}

/// Random suffixes from [`SUFFIX_ALPHABET`]
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSuffix;

impl SuffixSource for RandomSuffix {
    fn suffix(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect()
    }
}

/// Join a group name and a suffix, truncating the group name if needed
pub fn unit_name(group: &str, suffix: &str) -> String {
    let max_base = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    let mut base: &str = group;
    if base.len() > max_base {
        let mut cut = max_base;
        while !base.is_char_boundary(cut) {
            cut -= 1;
        }
        base = &base[..cut];
    }
    let base = base.trim_end_matches(['-', '.']);
    format!("{}-{}", base, suffix)
}

/// Generate a name for a new unit that is not already in `taken`
///
/// `taken` holds names visible in the current listing plus names handed out
/// earlier in the same pass. The store still enforces uniqueness; this only
/// avoids knowingly walking into a collision.
pub fn generate_unique_name(
    group: &str,
    taken: &HashSet<String>,
    source: &dyn SuffixSource,
) -> Result<String, Error> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let candidate = unit_name(group, &source.suffix());
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::internal_with_context(
        "naming",
        format!(
            "no free unit name for {} after {} attempts",
            group, MAX_NAME_ATTEMPTS
        ),
    ))
}
