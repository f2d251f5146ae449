//! Hierarchical scope strategy
//!
//! Granting `a.b` implicitly authorizes `a.b.c`; the hierarchy separators
//! are `.`, `:` and `/`, so a grant of `scheduler:/WRITE` covers
//! `scheduler:/WRITE/anything` below it.

/// Hierarchy separators recognized by the strategy
const SEPARATORS: [char; 3] = ['.', ':', '/'];

/// True iff `granted` covers `requested` under the hierarchical strategy
#[must_use]
pub fn scope_covers(granted: &str, requested: &str) -> bool {
    if granted.eq_ignore_ascii_case(requested) {
        return true;
    }
    if requested.len() > granted.len() {
        if let (Some(head), Some(tail)) = (
            requested.get(..granted.len()),
            requested.get(granted.len()..),
        ) {
            return head.eq_ignore_ascii_case(granted)
                && tail.starts_with(|c: char| SEPARATORS.contains(&c));
        }
    }
    false
}

/// True iff any scope in `granted` covers `requested`
#[must_use]
pub fn any_scope_covers<'a, I>(granted: I, requested: &str) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    granted.into_iter().any(|g| scope_covers(g, requested))
}

/// Filter `requested` down to the scopes covered by the client's allowed set
#[must_use]
pub fn grantable<'a>(requested: &'a [String], allowed: &[String]) -> Vec<&'a str> {
    requested
        .iter()
        .map(String::as_str)
        .filter(|r| any_scope_covers(allowed.iter().map(String::as_str), r))
        .collect()
}

/// Scopes that carry read capability against the scheduler
#[must_use]
pub fn grants_read<'a, I>(granted: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    granted.into_iter().any(|s| {
        s.eq_ignore_ascii_case("read")
            || s.eq_ignore_ascii_case("write")
            || scope_covers("scheduler:/READ", s)
            || scope_covers("scheduler:/WRITE", s)
            || scope_covers("scheduler:/ADMINISTRATOR", s)
            || scope_covers("scheduler:/OWNER", s)
    })
}

/// Scopes that carry write capability against the scheduler
#[must_use]
pub fn grants_write<'a, I>(granted: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    granted.into_iter().any(|s| {
        s.eq_ignore_ascii_case("write")
            || scope_covers("scheduler:/WRITE", s)
            || scope_covers("scheduler:/ADMINISTRATOR", s)
            || scope_covers("scheduler:/OWNER", s)
    })
}

/// Split a space-delimited scope string into owned scopes
#[must_use]
pub fn split_scopes(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Join scopes back into the wire form
#[must_use]
pub fn join_scopes(scopes: &[String]) -> String {
    scopes.join(" ")
}
