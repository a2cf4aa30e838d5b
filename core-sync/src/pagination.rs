//! Pagination cursor extraction.
//!
//! Two conventions are recognised, in order: an RFC 5988 `Link` header with
//! `rel="next"`, then a `meta.pagination.next` URL in the JSON body.

use crate::transport::TransportResponse;

/// Upper bound on pages followed by a single exhaust.
pub const DEFAULT_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: String,
    pub rel: String,
}

/// Parses a `Link` header value into `(url, rel)` pairs. A link with several
/// space separated relations yields one entry per relation.
pub fn parse_link_header(value: &str) -> Vec<Link> {
    let mut links = Vec::new();
    let mut rest = value;

    while let Some(open) = rest.find('<') {
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let url = rest[open + 1..open + close].trim();
        let after = &rest[open + close + 1..];
        let params_end = after.find('<').unwrap_or(after.len());

        for param in after[..params_end].split(';') {
            let param = param.trim().trim_end_matches(',').trim();
            let Some((name, relations)) = param.split_once('=') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case("rel") {
                continue;
            }
            for rel in relations.trim().trim_matches('"').split_whitespace() {
                links.push(Link {
                    url: url.to_string(),
                    rel: rel.to_ascii_lowercase(),
                });
            }
        }

        rest = &after[params_end..];
    }

    links
}

/// URL of the next page, if the response announces one.
pub fn next_page_url(response: &TransportResponse) -> Option<String> {
    let from_header = response.header("Link").and_then(|value| {
        parse_link_header(value)
            .into_iter()
            .find(|link| link.rel == "next")
            .map(|link| link.url)
    });

    from_header.or_else(|| {
        response
            .body
            .pointer("/meta/pagination/next")
            .and_then(|next| next.as_str())
            .filter(|next| !next.is_empty())
            .map(str::to_string)
    })
}
