//! Key Authorization Check
//!
//! The candidate key is compared against every allow-list entry with a
//! constant-time comparison, and the loop never stops early, so neither the
//! position of a match nor whether one happened shows up in the timing.

use subtle::{Choice, ConstantTimeEq};

/// True iff `candidate` byte-equals at least one entry of `allow_list`.
pub fn is_authorized<S: AsRef<str>>(candidate: &str, allow_list: &[S]) -> bool {
    authorize_with(candidate, allow_list, |allowed, candidate| {
        allowed.ct_eq(candidate)
    })
}

fn authorize_with<S, F>(candidate: &str, allow_list: &[S], mut compare: F) -> bool
where
    S: AsRef<str>,
    F: FnMut(&[u8], &[u8]) -> Choice,
{
    let mut authorized = Choice::from(0u8);
    for allowed in allow_list {
        authorized |= compare(allowed.as_ref().as_bytes(), candidate.as_bytes());
    }
    authorized.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&str; 4] = [
        "certdist1first",
        "certdist1second",
        "certdist1third",
        "certdist1fourth",
    ];

    #[test]
    fn test_listed_key_is_authorized() {
        for key in KEYS {
            assert!(is_authorized(key, &KEYS[..]));
        }
    }

    #[test]
    fn test_unlisted_key_is_rejected() {
        assert!(!is_authorized("certdist1fifth", &KEYS[..]));
        assert!(!is_authorized("certdist1firs", &KEYS[..]));
        assert!(!is_authorized("certdist1first ", &KEYS[..]));
        assert!(!is_authorized("", &KEYS[..]));
    }

    #[test]
    fn test_empty_allow_list_rejects_everything() {
        let empty: [&str; 0] = [];
        assert!(!is_authorized("certdist1first", &empty[..]));
    }

    #[test]
    fn test_every_entry_is_compared_regardless_of_match_position() {
        let mut candidates: Vec<&str> = KEYS.to_vec();
        candidates.push("certdist1unlisted");

        for candidate in candidates {
            let mut comparisons = 0;
            let authorized = authorize_with(candidate, &KEYS[..], |allowed, candidate| {
                comparisons += 1;
                allowed.ct_eq(candidate)
            });
            assert_eq!(authorized, KEYS.contains(&candidate));
            assert_eq!(comparisons, KEYS.len());
        }
    }

    #[test]
    fn test_accepts_owned_strings() {
        let allow_list: Vec<String> = KEYS.iter().map(|k| k.to_string()).collect();
        assert!(is_authorized("certdist1third", &allow_list));
    }
}
