//! Fuzzy resource name resolution against snapshot lists.

use tracing::{debug, warn};

/// Resolve one reference to a single candidate name.
///
/// Exact case-insensitive match, then a unique substring match, then the first
/// of several substring matches (logged as ambiguous), then a prefix match
/// where the reference starts with a candidate. Unresolved references are
/// returned unchanged.
pub fn resolve_name(reference: &str, candidates: &[String]) -> String {
    let needle = reference.trim().to_lowercase();
    if needle.is_empty() {
        return reference.to_string();
    }

    if let Some(exact) = candidates.iter().find(|c| c.to_lowercase() == needle) {
        return exact.clone();
    }

    let substring: Vec<&String> = candidates
        .iter()
        .filter(|c| c.to_lowercase().contains(&needle))
        .collect();
    match substring.as_slice() {
        [only] => return (*only).clone(),
        [first, ..] => {
            warn!(
                "Ambiguous reference '{}' matches {:?}, using '{}'",
                reference, substring, first
            );
            return (*first).clone();
        }
        [] => {}
    }

    if let Some(prefix) = candidates
        .iter()
        .find(|c| !c.is_empty() && needle.starts_with(&c.to_lowercase()))
    {
        debug!("Resolved '{}' to '{}' by prefix", reference, prefix);
        return prefix.clone();
    }

    debug!("Could not resolve '{}'", reference);
    reference.to_string()
}

/// Every candidate a filter term selects, using the first tier that matches.
///
/// Tiers: exact (case-insensitive), substring, prefix. Order follows the
/// candidate list.
pub fn match_all(filter: &str, candidates: &[String]) -> Vec<String> {
    let needle = filter.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let tiers: [&dyn Fn(&str) -> bool; 3] = [
        &|c: &str| c == needle,
        &|c: &str| c.contains(&needle),
        &|c: &str| !c.is_empty() && needle.starts_with(c),
    ];

    for tier in tiers {
        let matched: Vec<String> = candidates
            .iter()
            .filter(|c| tier(&c.to_lowercase()))
            .cloned()
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// Drop a trailing plural `s` from a resource word
pub fn singular(term: &str) -> &str {
    if term.len() > 3 {
        term.strip_suffix('s').unwrap_or(term)
    } else {
        term
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_wins() {
        let c = names(&["nextcloud", "nextcloud-app"]);
        assert_eq!(resolve_name("NextCloud", &c), "nextcloud");
    }

    #[test]
    fn test_unique_substring() {
        let c = names(&["nextcloud-app", "nginx-proxy"]);
        assert_eq!(resolve_name("proxy", &c), "nginx-proxy");
    }

    #[test]
    fn test_ambiguous_takes_first() {
        let c = names(&["nextcloud-app", "nextcloud-redis"]);
        assert_eq!(resolve_name("nextcloud", &c), "nextcloud-app");
    }

    #[test]
    fn test_prefix_fallback() {
        let c = names(&["nginx"]);
        assert_eq!(resolve_name("nginx.service", &c), "nginx");
    }

    #[test]
    fn test_unresolved_returns_original() {
        let c = names(&["nginx"]);
        assert_eq!(resolve_name("postgres", &c), "postgres");
        assert_eq!(resolve_name("postgres", &[]), "postgres");
    }

    #[test]
    fn test_match_all_tiers() {
        let c = names(&["nextcloud-app", "nextcloud-redis", "nginx-proxy"]);
        assert_eq!(
            match_all("nextcloud", &c),
            vec!["nextcloud-app", "nextcloud-redis"]
        );
        assert_eq!(match_all("nginx-proxy", &c), vec!["nginx-proxy"]);
        assert!(match_all("postgres", &c).is_empty());
        assert!(match_all("", &c).is_empty());
    }

    #[test]
    fn test_match_all_exact_beats_substring() {
        let c = names(&["redis", "nextcloud-redis"]);
        assert_eq!(match_all("redis", &c), vec!["redis"]);
    }

    #[test]
    fn test_singular() {
        assert_eq!(singular("containers"), "container");
        assert_eq!(singular("gas"), "gas");
    }
}
