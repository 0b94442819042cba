//! Resolving what the user typed to a stored record.
//!
//! An argument may be an id or a name: exact id first, then exact name
//! (case-insensitive), then the best fuzzy match, which must be confirmed.

use anyhow::{anyhow, bail, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::io::{self, Write};

use crate::models::Record;

#[derive(Debug, PartialEq)]
pub enum Match<'a, T> {
    Exact(&'a T),
    /// Several records carry this exact name.
    Ambiguous(Vec<&'a T>),
    Suggestion { record: &'a T, score: i64 },
    Nothing,
}

pub fn find<'a, T: Record>(records: &'a [T], query: &str) -> Match<'a, T> {
    let query = query.trim();
    if let Some(record) = records.iter().find(|r| r.id() == query) {
        return Match::Exact(record);
    }

    let named: Vec<&T> = records
        .iter()
        .filter(|r| r.label().trim().to_lowercase() == query.to_lowercase())
        .collect();
    match named.len() {
        0 => {}
        1 => return Match::Exact(named[0]),
        _ => return Match::Ambiguous(named),
    }

    let matcher = SkimMatcherV2::default();
    let mut best: Option<(i64, &T)> = None;
    for record in records {
        if let Some(score) = matcher.fuzzy_match(record.label(), query) {
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, record));
            }
        }
    }
    match best {
        Some((score, record)) => Match::Suggestion { record, score },
        None => Match::Nothing,
    }
}

/// Like [`find`], but turns everything short of a single record into an
/// error. Suggestions go through `confirm(query, suggested_label)`.
pub fn resolve<'a, T: Record>(
    records: &'a [T],
    query: &str,
    kind: &str,
    confirm: impl FnOnce(&str, &str) -> Result<bool>,
) -> Result<&'a T> {
    match find(records, query) {
        Match::Exact(record) => Ok(record),
        Match::Ambiguous(matches) => {
            let ids: Vec<&str> = matches.iter().map(|r| r.id()).collect();
            bail!(
                "'{}' matches several {}s ({}); use the id instead",
                query,
                kind,
                ids.join(", ")
            )
        }
        Match::Suggestion { record, .. } => {
            if confirm(query, record.label())? {
                Ok(record)
            } else {
                Err(anyhow!("No {} named '{}'", kind, query))
            }
        }
        Match::Nothing => Err(anyhow!("No {} matches '{}'", kind, query)),
    }
}

/// Asks on the terminal whether the suggestion is what the user meant.
pub fn ask_user_confirmation(input: &str, suggestion: &str) -> Result<bool> {
    print!("'{}' not found. Did you mean '{}'? (y/n): ", input, suggestion);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Member;
    use chrono::Utc;

    fn member(id: &str, name: &str) -> Member {
        Member {
            id: id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    fn team() -> Vec<Member> {
        vec![
            member("1", "Ana Lima"),
            member("2", "Bruno Costa"),
            member("3", "Carla Dias"),
        ]
    }

    #[test]
    fn id_wins_over_name() {
        let mut members = team();
        members.push(member("4", "2"));
        assert_eq!(find(&members, "2"), Match::Exact(&members[1]));
    }

    #[test]
    fn exact_name_ignores_case() {
        let members = team();
        assert_eq!(find(&members, "bruno costa"), Match::Exact(&members[1]));
    }

    #[test]
    fn fuzzy_match_is_only_a_suggestion() {
        let members = team();
        match find(&members, "crla") {
            Match::Suggestion { record, .. } => assert_eq!(record.name, "Carla Dias"),
            other => panic!("expected a suggestion, got {:?}", other),
        }
        assert_eq!(find(&members, "zzz"), Match::Nothing);
    }

    #[test]
    fn duplicate_names_are_ambiguous() {
        let members = vec![member("1", "Ana"), member("2", "Ana")];
        assert!(matches!(find(&members, "Ana"), Match::Ambiguous(m) if m.len() == 2));
        assert!(resolve(&members, "Ana", "member", |_, _| Ok(true)).is_err());
    }

    #[test]
    fn resolve_respects_the_answer() {
        let members = team();
        let accepted = resolve(&members, "crla", "member", |_, _| Ok(true)).unwrap();
        assert_eq!(accepted.id, "3");

        let declined = resolve(&members, "crla", "member", |_, _| Ok(false));
        assert!(declined.is_err());
    }
}
