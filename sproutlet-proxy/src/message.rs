//! SIP message model.
//!
//! A compact, owned representation of SIP requests and responses. Messages
//! in this crate are built programmatically and live exactly as long as the
//! transaction that owns them; textual parsing of whole messages belongs to
//! the wire stack and is not provided here.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};

mod code;
mod headers;
mod uri;

pub use code::StatusCode;
pub use headers::{Header, Headers};
pub use uri::{Host, Params, Scheme, SipUri, TransportType};

/// A SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Subscribe,
    Notify,
    Update,
    Refer,
    Prack,
    Info,
    Message,
    Publish,
    Other(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Register => "REGISTER",
            SipMethod::Options => "OPTIONS",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Update => "UPDATE",
            SipMethod::Refer => "REFER",
            SipMethod::Prack => "PRACK",
            SipMethod::Info => "INFO",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
            SipMethod::Other(m) => m,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SipMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let method = match s {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "REGISTER" => SipMethod::Register,
            "OPTIONS" => SipMethod::Options,
            "SUBSCRIBE" => SipMethod::Subscribe,
            "NOTIFY" => SipMethod::Notify,
            "UPDATE" => SipMethod::Update,
            "REFER" => SipMethod::Refer,
            "PRACK" => SipMethod::Prack,
            "INFO" => SipMethod::Info,
            "MESSAGE" => SipMethod::Message,
            "PUBLISH" => SipMethod::Publish,
            other if !other.is_empty() => SipMethod::Other(other.to_string()),
            _ => return Err(Error::Parse("empty method".into())),
        };
        Ok(method)
    }
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: SipMethod,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a new request with an empty header list.
    pub fn new(method: SipMethod, uri: SipUri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns `true` if the request carries a To tag, i.e. was sent within
    /// an established dialog.
    pub fn is_in_dialog(&self) -> bool {
        self.headers
            .get("To")
            .map(|to| to.contains(";tag="))
            .unwrap_or(false)
    }

    /// Builds a CANCEL for this request per RFC 3261 section 9.1: same
    /// Request-URI, Via, From, To, Call-ID and Route set, CSeq renumbered to
    /// the CANCEL method. An optional reason code becomes a Reason header.
    pub fn create_cancel(&self, reason: Option<u16>) -> Request {
        let mut headers = Headers::new();
        if let Some(via) = self.headers.get("Via") {
            headers.push("Via", via);
        }
        for name in ["From", "To", "Call-ID"] {
            if let Some(value) = self.headers.get(name) {
                headers.push(name, value);
            }
        }
        if let Some((num, _)) = self.headers.cseq() {
            headers.push("CSeq", &format!("{} CANCEL", num));
        }
        for route in self.headers.get_all("Route") {
            headers.push("Route", route);
        }
        if let Some(cause) = reason {
            headers.push("Reason", &format!("SIP;cause={}", cause));
        }

        Request {
            method: SipMethod::Cancel,
            uri: self.uri.clone(),
            headers,
            body: None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n{}\r\n", self.method, self.uri, self.headers)
    }
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates a bare response with the canonical reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason().to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Builds a response bound to a request's transaction, copying the Via,
    /// Record-Route, Call-ID, From, To and CSeq headers. A To tag is added
    /// to final and non-Trying provisional responses if the request had
    /// none (RFC 3261 section 8.2.6.2).
    pub fn for_request(req: &Request, status: StatusCode, reason: Option<&str>) -> Response {
        let mut headers = Headers::new();
        for via in req.headers.get_all("Via") {
            headers.push("Via", via);
        }
        for rr in req.headers.get_all("Record-Route") {
            headers.push("Record-Route", rr);
        }
        for name in ["Call-ID", "From"] {
            if let Some(value) = req.headers.get(name) {
                headers.push(name, value);
            }
        }
        if let Some(to) = req.headers.get("To") {
            if !to.contains(";tag=") && status.into_u16() > 100 {
                headers.push("To", &format!("{};tag={}", to, gen_token(10)));
            } else {
                headers.push("To", to);
            }
        }
        if let Some(cseq) = req.headers.get("CSeq") {
            headers.push("CSeq", cseq);
        }

        Response {
            status,
            reason: reason.unwrap_or(status.reason()).to_string(),
            headers,
            body: None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SIP/2.0 {} {}\r\n{}\r\n",
            self.status, self.reason, self.headers
        )
    }
}

/// Generates a short random token for tags and branch parameters.
pub(crate) fn gen_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
