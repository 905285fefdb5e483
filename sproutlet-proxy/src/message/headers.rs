use std::fmt;

use crate::message::{SipMethod, SipUri};

/// A single SIP header as a name/value pair.
///
/// Headers are kept in their textual form; the typed accessors on
/// [`Headers`] parse the handful of headers the proxy core routes on.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// An ordered SIP header list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Headers {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.0.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// The value of the first header with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for the given header name, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Replaces the first header with the given name, or appends it.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(h) => h.value = value.to_string(),
            None => self.push(name, value),
        }
    }

    /// Removes every header with the given name.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses the URI of the topmost Route header.
    pub fn top_route(&self) -> Option<SipUri> {
        self.get("Route").and_then(|v| v.parse().ok())
    }

    /// Removes the topmost Route header.
    pub fn pop_route(&mut self) {
        if let Some(pos) = self
            .0
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case("Route"))
        {
            self.0.remove(pos);
        }
    }

    /// Inserts a Route header above any existing ones.
    pub fn push_route_front(&mut self, uri: &SipUri) {
        let value = format!("<{}>", uri);
        let pos = self
            .0
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case("Route"))
            .unwrap_or(self.0.len());
        self.0.insert(
            pos,
            Header {
                name: "Route".to_string(),
                value,
            },
        );
    }

    /// Parses the CSeq header into its sequence number and method.
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.get("CSeq")?;
        let (num, method) = value.trim().split_once(' ')?;
        Some((num.parse().ok()?, method.trim().parse().ok()?))
    }

    /// Returns `true` if a comma-separated header contains the given token.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Adds a token to a comma-separated header, creating it if needed.
    pub fn add_token(&mut self, name: &str, token: &str) {
        if self.contains_token(name, token) {
            return;
        }
        match self.0.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(h) => h.value = format!("{}, {}", h.value, token),
            None => self.push(name, token),
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for h in &self.0 {
            write!(f, "{}: {}\r\n", h.name, h.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_stack_pops_in_order() {
        let mut headers = Headers::new();
        headers.push("Route", "<sip:se.proxy1.homedomain;lr>");
        headers.push("Route", "<sip:proxy2.homedomain;lr>");

        let top = headers.top_route().unwrap();
        assert_eq!(top.host_str(), "se.proxy1.homedomain");

        headers.pop_route();
        let next = headers.top_route().unwrap();
        assert_eq!(next.host_str(), "proxy2.homedomain");

        headers.pop_route();
        assert!(headers.top_route().is_none());
    }

    #[test]
    fn push_route_front_takes_precedence() {
        let mut headers = Headers::new();
        headers.push("Route", "<sip:proxy2.homedomain;lr>");
        let uri: SipUri = "sip:fwd@proxy1.homedomain;lr".parse().unwrap();
        headers.push_route_front(&uri);

        assert_eq!(headers.top_route().unwrap().user.as_deref(), Some("fwd"));
    }

    #[test]
    fn cseq_parses_number_and_method() {
        let mut headers = Headers::new();
        headers.push("CSeq", "314159 INVITE");
        assert_eq!(headers.cseq(), Some((314159, SipMethod::Invite)));
    }

    #[test]
    fn token_headers() {
        let mut headers = Headers::new();
        headers.push("Supported", "100rel, timer");
        assert!(headers.contains_token("Supported", "timer"));
        assert!(!headers.contains_token("Require", "timer"));

        headers.add_token("Require", "timer");
        assert_eq!(headers.get("Require"), Some("timer"));
        headers.add_token("Require", "timer");
        assert_eq!(headers.get("Require"), Some("timer"));
        headers.add_token("Require", "100rel");
        assert_eq!(headers.get("Require"), Some("timer, 100rel"));
    }

    #[test]
    fn set_replaces_first_value() {
        let mut headers = Headers::new();
        headers.push("Session-Expires", "900");
        headers.set("Session-Expires", "600");
        assert_eq!(headers.get("Session-Expires"), Some("600"));
        assert_eq!(headers.len(), 1);
    }
}
