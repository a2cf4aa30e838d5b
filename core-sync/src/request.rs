//! Request descriptors for REST and GraphQL operations.
//!
//! A descriptor names an operation without binding it to a host. The
//! transport resolves it against its base URL; absolute URLs (typically
//! next-page links handed out by the server) are used verbatim.

use bridge_traits::HttpMethod;
use serde_json::{json, Value};

/// Path of the GraphQL endpoint relative to the API base URL.
pub const GRAPHQL_PATH: &str = "/api/graphql";

#[derive(Debug, Clone, PartialEq)]
pub enum RequestDescriptor {
    Rest {
        method: HttpMethod,
        path: String,
        query: Vec<(String, String)>,
        body: Option<Value>,
    },
    GraphQl {
        operation_name: String,
        query: String,
        variables: Value,
    },
}

impl RequestDescriptor {
    pub fn get(path: impl Into<String>) -> Self {
        Self::rest(HttpMethod::Get, path, None)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::rest(HttpMethod::Post, path, Some(body))
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::rest(HttpMethod::Put, path, Some(body))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::rest(HttpMethod::Delete, path, None)
    }

    pub fn graphql(
        operation_name: impl Into<String>,
        query: impl Into<String>,
        variables: Value,
    ) -> Self {
        RequestDescriptor::GraphQl {
            operation_name: operation_name.into(),
            query: query.into(),
            variables,
        }
    }

    /// A GET of a URL handed out by the server, followed as is.
    pub fn follow(url: impl Into<String>) -> Self {
        Self::get(url)
    }

    fn rest(method: HttpMethod, path: impl Into<String>, body: Option<Value>) -> Self {
        RequestDescriptor::Rest {
            method,
            path: path.into(),
            query: Vec::new(),
            body,
        }
    }

    /// Appends a query parameter. Repeated names are kept (`include[]=a&include[]=b`).
    /// GraphQL descriptors carry their inputs as variables and ignore this.
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        if let RequestDescriptor::Rest { query, .. } = &mut self {
            query.push((name.into(), value.to_string()));
        }
        self
    }

    pub fn method(&self) -> HttpMethod {
        match self {
            RequestDescriptor::Rest { method, .. } => *method,
            RequestDescriptor::GraphQl { .. } => HttpMethod::Post,
        }
    }

    /// Short label for logs: `GET /api/v1/courses` or `graphql GetInbox`.
    pub fn describe(&self) -> String {
        match self {
            RequestDescriptor::Rest { method, path, .. } => format!("{} {}", method.as_str(), path),
            RequestDescriptor::GraphQl { operation_name, .. } => {
                format!("graphql {}", operation_name)
            }
        }
    }

    /// Full URL of this request against `base_url`.
    pub fn url(&self, base_url: &str) -> String {
        let (path, query) = match self {
            RequestDescriptor::Rest { path, query, .. } => (path.as_str(), query.as_slice()),
            RequestDescriptor::GraphQl { .. } => (GRAPHQL_PATH, &[][..]),
        };

        let mut url = if is_absolute(path) {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        for (name, value) in query {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&urlencoding::encode(name));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    /// JSON body to send, if any.
    pub fn body(&self) -> Option<Value> {
        match self {
            RequestDescriptor::Rest { body, .. } => body.clone(),
            RequestDescriptor::GraphQl {
                operation_name,
                query,
                variables,
            } => Some(json!({
                "operationName": operation_name,
                "query": query,
                "variables": variables,
            })),
        }
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with("https://") || path.starts_with("http://")
}
