//! Method + path pattern routing.
//!
//! Patterns are `/`-separated; a segment starting with `:` captures the
//! request segment under that name:
//!
//! ```
//! use sluice::handler::{Handler, Params, Router};
//! use sluice::http::request::{Method, Request, RequestBuilder};
//! use sluice::http::response::Response;
//!
//! let router = Router::new().route(Method::GET, "/users/:id", |_: &Request, p: &Params| {
//!     Response::ok(format!("user {}", p.get("id").unwrap_or("?")))
//! });
//!
//! let req = RequestBuilder::new().method(Method::GET).path("/users/42").build().unwrap();
//! assert_eq!(router.handle(&req).body, b"user 42");
//! ```
//!
//! Each method has its own segment trie. At every level a literal child is
//! tried before the parameter child, so `/users/me` beats `/users/:id`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::handler::{Handler, NotFound};
use crate::http::request::{Method, Request};
use crate::http::response::Response;

/// Path parameters captured by a route, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub trait RouteHandler: Send + Sync {
    fn call(&self, request: &Request, params: &Params) -> Response;
}

impl<F> RouteHandler for F
where
    F: Fn(&Request, &Params) -> Response + Send + Sync,
{
    fn call(&self, request: &Request, params: &Params) -> Response {
        self(request, params)
    }
}

struct Route {
    /// Parameter names, in the order their segments appear.
    names: Vec<String>,
    handler: Arc<dyn RouteHandler>,
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    route: Option<Route>,
}

impl Node {
    fn insert(&mut self, segments: &[&str], route: Route) {
        match segments.split_first() {
            None => self.route = Some(route),
            Some((segment, rest)) if segment.starts_with(':') => self
                .param
                .get_or_insert_with(Default::default)
                .insert(rest, route),
            Some((segment, rest)) => self
                .literals
                .entry((*segment).to_string())
                .or_default()
                .insert(rest, route),
        }
    }

    /// Depth-first match; `values` collects parameter segments on the way down
    /// and is restored when a branch fails.
    fn find<'a>(&'a self, segments: &[&str], values: &mut Vec<String>) -> Option<&'a Route> {
        let Some((segment, rest)) = segments.split_first() else {
            return self.route.as_ref();
        };

        if let Some(child) = self.literals.get(*segment) {
            if let Some(route) = child.find(rest, values) {
                return Some(route);
            }
        }

        let child = self.param.as_ref()?;
        let value = urlencoding::decode(segment)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| (*segment).to_string());
        values.push(value);
        match child.find(rest, values) {
            Some(route) => Some(route),
            None => {
                values.pop();
                None
            }
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub struct Router {
    trees: HashMap<Method, Node>,
    fallback: Arc<dyn Handler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            trees: HashMap::new(),
            fallback: Arc::new(NotFound),
        }
    }

    /// Handler for requests no route matches.
    pub fn with_fallback(mut self, fallback: Arc<dyn Handler>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Adds a route. A later route with the same method and shape replaces
    /// the earlier one.
    pub fn route<H>(mut self, method: Method, pattern: &str, handler: H) -> Self
    where
        H: RouteHandler + 'static,
    {
        let segments = segments(pattern);
        let names = segments
            .iter()
            .filter_map(|s| s.strip_prefix(':'))
            .map(str::to_string)
            .collect();
        let route = Route {
            names,
            handler: Arc::new(handler),
        };
        self.trees.entry(method).or_default().insert(&segments, route);
        self
    }

    pub fn get<H: RouteHandler + 'static>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post<H: RouteHandler + 'static>(self, pattern: &str, handler: H) -> Self {
        self.route(Method::POST, pattern, handler)
    }

    /// Finds the route for a method and path. `HEAD` falls back to the
    /// `GET` route when no explicit `HEAD` route matches.
    pub fn lookup(&self, method: Method, path: &str) -> Option<(Arc<dyn RouteHandler>, Params)> {
        let segments = segments(path);
        self.find(method, &segments).or_else(|| match method {
            Method::HEAD => self.find(Method::GET, &segments),
            _ => None,
        })
    }

    fn find(&self, method: Method, segments: &[&str]) -> Option<(Arc<dyn RouteHandler>, Params)> {
        let mut values = Vec::new();
        let route = self.trees.get(&method)?.find(segments, &mut values)?;
        let entries = route.names.iter().cloned().zip(values).collect();
        Some((Arc::clone(&route.handler), Params { entries }))
    }
}

impl Handler for Router {
    fn handle(&self, request: &Request) -> Response {
        match self.lookup(request.method, &request.path) {
            Some((handler, params)) => handler.call(request, &params),
            None => self.fallback.handle(request),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.trees.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(_: &Request, _: &Params) -> Response {
        Response::ok("")
    }

    #[test]
    fn failed_literal_branch_releases_captures() {
        let router = Router::new()
            .get("/a/b/c", ok)
            .get("/a/:x/d", ok);

        let (_, params) = router.lookup(Method::GET, "/a/b/d").unwrap();
        assert_eq!(params.get("x"), Some("b"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let router = Router::new().get("/health", ok);
        assert!(router.lookup(Method::GET, "/health/").is_some());
        assert!(router.lookup(Method::GET, "/").is_none());
    }
}
