//! CBM file name pattern matching.
//!
//! Two dialects are implemented.  Classic matching is what the 1541
//! does: `*` matches everything from its position on and any further
//! pattern characters are ignored; `?` matches exactly one character.
//! Advanced matching (introduced with the 1581) makes `*` greedy but
//! keeps matching the pattern characters behind it.
//!
//! [`match_dir_pattern`] is the path-separator aware variant used by
//! the resolver: a `/` ends the component and the unmatched tail of
//! the pattern is returned so the caller can consume one directory
//! level per call.
#![warn(missing_docs)]
#![warn(unsafe_code)]

use crate::charset::{to_match_char, Charset};

/// The path separator in host file patterns.
pub const PATH_SEPARATOR: u8 = b'/';

/// Classic Commodore pattern matching.
///
/// `*` only works as the last effective pattern char and matches
/// everything; further chars in the pattern are ignored.  `?` skips a
/// single character, which must exist.
fn classic_match(name: &[char], pattern: &[char]) -> bool {
    let mut i = 0;
    loop {
        let n = name.get(i).copied();
        let p = pattern.get(i).copied();
        i += 1;
        match (n, p) {
            (None, None) => return true,
            (_, Some('*')) => return true,
            (Some(_), Some('?')) => continue,
            (n, p) if n == p && n.is_some() => continue,
            _ => return false,
        }
    }
}

/// Advanced pattern matching (CBM 1581).
///
/// `*` matches any number of characters, including none, and the
/// characters after it must still match.  `?` skips one character.
fn advanced_match(name: &[char], pattern: &[char]) -> bool {
    let mut ni = 0;
    let mut pi = 0;
    // backtrack positions after the last `*`
    let mut after_name: Option<usize> = None;
    let mut after_pattern = 0;

    loop {
        let n = name.get(ni).copied();
        let p = pattern.get(pi).copied();
        match n {
            None => match p {
                None => return true,
                Some('*') => {
                    pi += 1;
                }
                Some(_) => match after_name {
                    Some(an) if an < name.len() => {
                        ni = an;
                        after_name = Some(an + 1);
                        pi = after_pattern;
                    }
                    _ => return false,
                },
            },
            Some(nc) => {
                if p == Some(nc) || p == Some('?') {
                    ni += 1;
                    pi += 1;
                } else if p == Some('*') {
                    pi += 1;
                    after_pattern = pi;
                    after_name = Some(ni);
                    if pi >= pattern.len() {
                        return true;
                    }
                } else if after_name.is_some() {
                    // resume behind the last star, retry one name char on
                    if after_pattern != pi {
                        pi = after_pattern;
                        if pattern.get(pi).copied() == Some(nc) {
                            pi += 1;
                        }
                    }
                    ni += 1;
                } else {
                    return false;
                }
            }
        }
    }
}

/// Compare a name against a pattern, charset aware.
///
/// Both byte strings are folded through their charset's match table so
/// a PETSCII pattern can be applied to an ASCII name and vice versa.
pub fn match_pattern(
    pattern: &[u8],
    pattern_cset: Charset,
    name: &[u8],
    name_cset: Charset,
    advanced: bool,
) -> bool {
    let p: Vec<char> = pattern.iter().map(|c| to_match_char(pattern_cset, *c)).collect();
    let n: Vec<char> = name.iter().map(|c| to_match_char(name_cset, *c)).collect();
    if advanced {
        advanced_match(&n, &p)
    } else {
        classic_match(&n, &p)
    }
}

/// Compare a name against one path component of a pattern.
///
/// Matching here is always classic (the directory walk of the DOS
/// predates the 1581 semantics).  On a match the unmatched tail of the
/// pattern is returned: either the empty slice, or the rest beginning
/// with the `/` that ended the component.  A `*` consumes pattern
/// characters up to the next separator.
pub fn match_dir_pattern<'a>(
    name: &[u8],
    name_cset: Charset,
    pattern: &'a [u8],
    pattern_cset: Charset,
) -> Option<&'a [u8]> {
    let mut i = 0;
    loop {
        let n = name.get(i).map(|c| to_match_char(name_cset, *c));
        let p = pattern.get(i).map(|c| to_match_char(pattern_cset, *c));
        match (n, p) {
            (None, None) => return Some(&pattern[i..]),
            (a, b) if a == Some('*') || b == Some('*') => {
                // move on to the path separator (if any)
                let mut rest = i;
                while rest < pattern.len() && pattern[rest] != PATH_SEPARATOR {
                    rest += 1;
                }
                return Some(&pattern[rest..]);
            }
            (None, Some('/')) => return Some(&pattern[i..]),
            (Some(_), Some('?')) | (Some('?'), Some(_)) => {
                i += 1;
            }
            (Some(a), Some(b)) if a == b => {
                i += 1;
            }
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{match_dir_pattern, match_pattern};
    use crate::charset::Charset;
    use pretty_assertions::assert_eq;

    fn classic(name: &str, pattern: &str) -> bool {
        match_pattern(
            pattern.as_bytes(),
            Charset::Ascii,
            name.as_bytes(),
            Charset::Ascii,
            false,
        )
    }

    fn advanced(name: &str, pattern: &str) -> bool {
        match_pattern(
            pattern.as_bytes(),
            Charset::Ascii,
            name.as_bytes(),
            Charset::Ascii,
            true,
        )
    }

    #[test]
    fn classic_star_matches_everything() {
        assert!(classic("FOO", "F*"));
        assert!(classic("FOO", "*"));
        assert!(classic("", "*"));
        // bug-compatible: chars after the star are ignored
        assert!(classic("FAB", "F*O"));
    }

    #[test]
    fn classic_question_mark() {
        assert!(classic("A", "?"));
        assert!(!classic("", "?"));
        assert!(!classic("AB", "?"));
        assert!(classic("ABC", "A?C"));
    }

    #[test]
    fn exact_patterns_agree_with_equality() {
        assert!(classic("README", "README"));
        assert!(!classic("README", "READM"));
        assert!(!classic("READM", "README"));
        assert!(advanced("README", "README"));
        assert!(!advanced("README", "READM"));
    }

    #[test]
    fn advanced_star_is_greedy_but_keeps_matching() {
        assert!(advanced("FOO", "F*O"));
        assert!(!advanced("FAB", "F*O"));
        assert!(advanced("FOO", "F*"));
        assert!(advanced("ABCX", "*X"));
        assert!(!advanced("ABCY", "*X"));
        assert!(advanced("X", "*X"));
        assert!(advanced("AXBXC", "*X*C"));
    }

    #[test]
    fn charset_folding() {
        // PETSCII pattern against an ASCII name
        let pattern = crate::charset::convert(b"f*", Charset::Ascii, Charset::Petscii);
        assert!(match_pattern(
            &pattern,
            Charset::Petscii,
            b"foo",
            Charset::Ascii,
            false
        ));
    }

    #[test]
    fn dir_pattern_returns_the_tail() {
        let rest = match_dir_pattern(b"SUB", Charset::Ascii, b"SUB/FILE", Charset::Ascii);
        assert_eq!(rest, Some(&b"/FILE"[..]));

        let rest = match_dir_pattern(b"FILE", Charset::Ascii, b"FILE", Charset::Ascii);
        assert_eq!(rest, Some(&b""[..]));

        assert_eq!(
            match_dir_pattern(b"OTHER", Charset::Ascii, b"SUB/FILE", Charset::Ascii),
            None
        );
    }

    #[test]
    fn dir_pattern_star_skips_to_separator() {
        let rest = match_dir_pattern(b"ANYTHING", Charset::Ascii, b"*/FILE", Charset::Ascii);
        assert_eq!(rest, Some(&b"/FILE"[..]));

        let rest = match_dir_pattern(b"ANYTHING", Charset::Ascii, b"*", Charset::Ascii);
        assert_eq!(rest, Some(&b""[..]));
    }
}
