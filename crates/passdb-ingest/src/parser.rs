//! Line parsers for credential dumps
//!
//! Dump lines are free-form. The seeding parser ([`parse`]) never fails: any
//! field it cannot derive is left as [`SENTINEL`]. Only the first `@`, and
//! then the first `:` (or failing that the first `;`), are treated as
//! delimiters, because passwords routinely contain all three characters.
//!
//! [`parse_strict`] is the stricter variant used by the dimension splitter:
//! the line must start with an email-shaped token.

use passdb_common::{Credential, SENTINEL};
use regex::Regex;
use std::sync::OnceLock;

/// Parse one dump line into a credential triple
///
/// ```
/// use passdb_ingest::parser::parse;
///
/// let cred = parse("alice@example.com:s3cr:et");
/// assert_eq!(cred.username, "alice");
/// assert_eq!(cred.domain, "example.com");
/// assert_eq!(cred.password, "s3cr:et");
/// ```
pub fn parse(line: &str) -> Credential {
    parse_line(line).unwrap_or_else(Credential::sentinel)
}

/// Like [`parse`], but `None` when the line holds no credential at all
///
/// A line such as `nil@nil:nil` yields a triple equal to
/// [`Credential::sentinel`]; only this function tells it apart from a line
/// without an `@`.
pub fn parse_line(line: &str) -> Option<Credential> {
    let (username, rest) = line.split_once('@')?;

    let (domain, password) = rest
        .split_once(':')
        .or_else(|| rest.split_once(';'))
        .unwrap_or((rest, SENTINEL));

    Some(Credential::new(username, domain, password))
}

fn email_prefix() -> &'static Regex {
    static EMAIL_PREFIX: OnceLock<Regex> = OnceLock::new();
    EMAIL_PREFIX.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^([a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9.-]+)(.*)$")
            .expect("email prefix pattern is valid")
    })
}

/// Parse a line that must begin with a well-formed email address
///
/// The single character following the address is taken as the separator,
/// whatever it is, and the remainder is the password.
pub fn parse_strict(line: &str) -> Credential {
    let Some(caps) = email_prefix().captures(line) else {
        return Credential::sentinel();
    };

    let email = &caps[1];
    let Some((username, domain)) = email.split_once('@') else {
        return Credential::sentinel();
    };

    let tail = &caps[2];
    let password = match tail.char_indices().nth(1) {
        Some((idx, _)) => &tail[idx..],
        None => SENTINEL,
    };

    Credential::new(username, domain, password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn triple(cred: &Credential) -> (&str, &str, &str) {
        (&cred.username, &cred.domain, &cred.password)
    }

    #[test]
    fn test_colon_separator() {
        assert_eq!(triple(&parse("a@b.com:p1")), ("a", "b.com", "p1"));
    }

    #[test]
    fn test_semicolon_separator() {
        assert_eq!(triple(&parse("c@d.com;p2")), ("c", "d.com", "p2"));
    }

    #[test]
    fn test_no_at_sign_is_sentinel() {
        assert!(parse("bad-line").is_sentinel());
        assert!(parse("").is_sentinel());
    }

    #[test]
    fn test_literal_sentinel_values_are_a_credential() {
        let cred = parse_line("nil@nil:nil").unwrap();
        assert!(cred.is_sentinel());
        assert!(parse_line("bad-line").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn test_missing_password() {
        assert_eq!(triple(&parse("a@b.com")), ("a", "b.com", SENTINEL));
    }

    #[test]
    fn test_only_first_delimiters_count() {
        assert_eq!(triple(&parse("a@b@c.com:x:y")), ("a", "b@c.com", "x:y"));
        assert_eq!(triple(&parse("a@b.com:p;q")), ("a", "b.com", "p;q"));
        // ':' wins over an earlier ';'
        assert_eq!(triple(&parse("a@b;c.com:p")), ("a", "b;c.com", "p"));
        assert_eq!(triple(&parse("a@b.com;p;q@r")), ("a", "b.com", "p;q@r"));
    }

    #[test]
    fn test_empty_fields_are_kept_verbatim() {
        assert_eq!(triple(&parse("@b.com:")), ("", "b.com", ""));
        assert_eq!(triple(&parse("a@")), ("a", "", SENTINEL));
    }

    #[test]
    fn test_strict_parse() {
        assert_eq!(
            triple(&parse_strict("john.doe+x@mail.example.org|hunter2")),
            ("john.doe+x", "mail.example.org", "hunter2")
        );
        assert_eq!(
            triple(&parse_strict("a@b.com")),
            ("a", "b.com", SENTINEL)
        );
        assert_eq!(
            triple(&parse_strict("a@b.com:")),
            ("a", "b.com", SENTINEL)
        );
        assert!(parse_strict("not an email:pw").is_sentinel());
        assert!(parse_strict("a@localhost:pw").is_sentinel());
    }

    #[test]
    fn test_strict_parse_multibyte_separator() {
        assert_eq!(
            triple(&parse_strict("a@b.com\u{2192}pässwörd")),
            ("a", "b.com", "pässwörd")
        );
    }

    proptest! {
        #[test]
        fn prop_colon_lines_round_trip(
            u in "[^@\n]{0,16}",
            d in "[^:;\n]{0,16}",
            p in "[^\n]{0,16}",
        ) {
            let cred = parse(&format!("{u}@{d}:{p}"));
            prop_assert_eq!(triple(&cred), (u.as_str(), d.as_str(), p.as_str()));
        }

        #[test]
        fn prop_semicolon_lines_round_trip(
            u in "[^@\n]{0,16}",
            d in "[^:;\n]{0,16}",
            p in "[^:\n]{0,16}",
        ) {
            let cred = parse(&format!("{u}@{d};{p}"));
            prop_assert_eq!(triple(&cred), (u.as_str(), d.as_str(), p.as_str()));
        }

        #[test]
        fn prop_lines_without_at_are_sentinel(line in "[^@]{0,32}") {
            prop_assert!(parse(&line).is_sentinel());
            prop_assert!(parse_line(&line).is_none());
        }

        #[test]
        fn prop_parse_never_panics(line in any::<String>()) {
            let _ = parse(&line);
            let _ = parse_strict(&line);
        }
    }
}
