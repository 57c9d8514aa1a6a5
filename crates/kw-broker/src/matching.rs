//! Which entries answer a request for a URL, best first

use kw_core::config::BrokerConfig;
use kw_db::{Entry, Tree};

use crate::association::SETTINGS_ENTRY_UUID;

/// The pieces of a URL the matcher compares. Hosts are lowercased; the
/// query and fragment are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteUrl {
    /// `None` when the entry URL was written without one
    pub scheme: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl SiteUrl {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, input),
        };
        let rest = rest.split(['?', '#']).next().unwrap_or_default();
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let authority = authority.rsplit('@').next().unwrap_or_default();
        let (host, port) = split_port(authority)?;
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return None;
        }
        Some(Self {
            scheme,
            host,
            port,
            path: path.to_string(),
        })
    }
}

fn split_port(authority: &str) -> Option<(&str, Option<u16>)> {
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        return Some((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}

/// How well an entry URL fits a requested URL. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchRank {
    /// The entry is for a parent domain of the requested host
    ParentDomain,
    SameHost,
    /// Same host and the requested path extends the entry's path
    PathPrefix,
    Exact,
}

pub fn rank(entry: &SiteUrl, request: &SiteUrl, match_scheme: bool) -> Option<MatchRank> {
    if match_scheme {
        if let (Some(a), Some(b)) = (&entry.scheme, &request.scheme) {
            if a != b {
                return None;
            }
        }
    }
    if let (Some(a), Some(b)) = (entry.port, request.port) {
        if a != b {
            return None;
        }
    }
    if entry.host == request.host {
        if entry.path == request.path && entry.port == request.port {
            return Some(MatchRank::Exact);
        }
        // the prefix must end on a path segment boundary
        let prefix = entry.path.trim_end_matches('/');
        let extends = request
            .path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
        if !prefix.is_empty() && extends {
            return Some(MatchRank::PathPrefix);
        }
        return Some(MatchRank::SameHost);
    }
    let parent = format!(".{}", entry.host);
    if request.host.ends_with(&parent) && entry.host.contains('.') {
        return Some(MatchRank::ParentDomain);
    }
    None
}

/// Entries matching `url` (or `submit_url`), best first. Recycled, expired
/// (unless allowed) and the broker's own settings entry never match.
pub fn find_logins<'a>(
    tree: &'a Tree,
    url: &str,
    submit_url: Option<&str>,
    config: &BrokerConfig,
) -> Vec<(MatchRank, &'a Entry)> {
    let requests: Vec<SiteUrl> = std::iter::once(url)
        .chain(submit_url)
        .filter_map(SiteUrl::parse)
        .collect();
    if requests.is_empty() {
        return Vec::new();
    }
    let now = kw_core::time::now();

    let mut found: Vec<(MatchRank, &Entry)> = tree
        .iter_entries()
        .filter(|e| e.uuid != SETTINGS_ENTRY_UUID)
        .filter(|e| !tree.is_in_recycle_bin(e.uuid))
        .filter(|e| config.allow_expired || !e.times.is_expired(now))
        .filter_map(|e| {
            let site = SiteUrl::parse(e.url())?;
            requests
                .iter()
                .filter_map(|r| rank(&site, r, config.match_url_scheme))
                .max()
                .map(|rank| (rank, e))
        })
        .collect();

    found.sort_by(|(ra, a), (rb, b)| {
        rb.cmp(ra)
            .then_with(|| a.title().cmp(b.title()))
            .then_with(|| a.uuid.cmp(&b.uuid))
    });
    if config.best_match_only {
        if let Some(best) = found.first().map(|(r, _)| *r) {
            found.retain(|(r, _)| *r == best);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kw_core::config::HistoryConfig;
    use kw_db::DeleteMode;

    fn url(s: &str) -> SiteUrl {
        SiteUrl::parse(s).unwrap()
    }

    #[test]
    fn test_parse() {
        let u = url("HTTPS://user:pw@Login.Example.com:8443/a/b?x=1#frag");
        assert_eq!(u.scheme.as_deref(), Some("https"));
        assert_eq!(u.host, "login.example.com");
        assert_eq!(u.port, Some(8443));
        assert_eq!(u.path, "/a/b");

        let bare = url("example.com");
        assert_eq!(bare.scheme, None);
        assert_eq!(bare.path, "/");

        let v6 = url("http://[::1]:8080/");
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.port, Some(8080));

        assert!(SiteUrl::parse("").is_none());
        assert!(SiteUrl::parse("https://host:notaport/").is_none());
    }

    #[test]
    fn test_rank_order() {
        let req = url("https://mail.example.com/login/form");
        assert_eq!(
            rank(&url("https://mail.example.com/login/form"), &req, true),
            Some(MatchRank::Exact)
        );
        assert_eq!(
            rank(&url("https://mail.example.com/login"), &req, true),
            Some(MatchRank::PathPrefix)
        );
        assert_eq!(
            rank(&url("https://mail.example.com/other"), &req, true),
            Some(MatchRank::SameHost)
        );
        assert_eq!(
            rank(&url("https://example.com"), &req, true),
            Some(MatchRank::ParentDomain)
        );
        assert_eq!(rank(&url("https://badexample.com"), &req, true), None);
        assert_eq!(rank(&url("https://com"), &req, true), None);
        assert!(MatchRank::Exact > MatchRank::PathPrefix);
        assert!(MatchRank::SameHost > MatchRank::ParentDomain);
    }

    #[test]
    fn test_path_prefix_stops_at_segments() {
        let req = url("https://h.example/login");
        assert_eq!(
            rank(&url("https://h.example/log"), &req, true),
            Some(MatchRank::SameHost)
        );
        assert_eq!(
            rank(&url("https://h.example/login/"), &req, true),
            Some(MatchRank::PathPrefix)
        );
        assert_eq!(
            rank(&url("https://h.example/login/"), &url("https://h.example/login/x"), true),
            Some(MatchRank::PathPrefix)
        );
    }

    #[test]
    fn test_scheme_and_port() {
        let req = url("http://example.com/");
        assert_eq!(rank(&url("https://example.com/"), &req, true), None);
        assert_eq!(
            rank(&url("https://example.com/"), &req, false),
            Some(MatchRank::Exact)
        );
        // scheme-less entry URLs match any scheme
        assert_eq!(
            rank(&url("example.com"), &req, true),
            Some(MatchRank::Exact)
        );
        assert_eq!(rank(&url("http://example.com:8080/"), &req, true), None);
    }

    #[test]
    fn test_find_logins_filters_and_ranks() {
        let mut tree = Tree::new("db", &HistoryConfig::default());
        let root = tree.root_id();
        let add = |tree: &mut Tree, title: &str, u: &str| {
            tree.add_entry(root, Entry::with_login(title, "u", "p", u))
                .unwrap()
        };
        add(&mut tree, "host", "https://example.com/");
        let exact = add(&mut tree, "exact", "https://example.com/login");
        add(&mut tree, "parent", "https://com.example.com.evil.org/");
        let recycled = add(&mut tree, "recycled", "https://example.com/login");
        tree.delete_entry(recycled, DeleteMode::Recycle).unwrap();
        let expired = add(&mut tree, "expired", "https://example.com/login");
        tree.edit_entry(expired, |e| {
            e.times.expires = true;
            e.times.expiry = kw_core::time::now() - Duration::days(1);
        })
        .unwrap();

        let mut config = BrokerConfig::default();
        let found = find_logins(&tree, "https://example.com/login", None, &config);
        let titles: Vec<_> = found.iter().map(|(_, e)| e.title()).collect();
        assert_eq!(titles, ["exact", "host"]);
        assert_eq!(found[0].1.uuid, exact);

        config.best_match_only = true;
        assert_eq!(
            find_logins(&tree, "https://example.com/login", None, &config).len(),
            1
        );

        config.best_match_only = false;
        config.allow_expired = true;
        assert_eq!(
            find_logins(&tree, "https://example.com/login", None, &config).len(),
            3
        );
    }

    #[test]
    fn test_submit_url_can_improve_rank() {
        let mut tree = Tree::new("db", &HistoryConfig::default());
        let root = tree.root_id();
        tree.add_entry(root, Entry::with_login("sso", "u", "p", "https://sso.example.com/auth"))
            .unwrap();
        let config = BrokerConfig::default();
        let found = find_logins(
            &tree,
            "https://app.example.com/",
            Some("https://sso.example.com/auth"),
            &config,
        );
        assert_eq!(found[0].0, MatchRank::Exact);
        assert!(find_logins(&tree, "https://app.example.com/", None, &config).is_empty());
    }

    mod proptest_suite {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parse_never_panics(s in ".{0,64}") {
                let _ = SiteUrl::parse(&s);
            }

            #[test]
            fn url_matches_itself_exactly(
                host in "[a-z]{1,10}(\\.[a-z]{2,5}){1,2}",
                path in "(/[a-z0-9]{1,6}){0,3}",
            ) {
                let u = url(&format!("https://{host}{path}"));
                prop_assert_eq!(rank(&u, &u, true), Some(MatchRank::Exact));
            }
        }
    }
}
