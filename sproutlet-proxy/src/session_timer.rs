//! Session-timer (RFC 4028) header processing.
//!
//! `SessionExpiresHelper` implements the Session-Expires negotiation a
//! B2BUA performs on dialog-forming requests: capping the session interval
//! at a configured target on the way out, and supplying the interval on the
//! way back when the terminating side does not support session timers.

use crate::message::{Request, Response, SipMethod};

const SESSION_EXPIRES: &str = "Session-Expires";
const MIN_SE: &str = "Min-SE";

/// Per-transaction session-timer state.
pub struct SessionExpiresHelper {
    /// The session interval this node aims for, in seconds.
    target_se: u32,
    /// Whether the UAC advertised `Supported: timer`.
    uac_supports_timer: bool,
    /// The interval stamped on the forwarded request.
    se_on_req: Option<u32>,
}

impl SessionExpiresHelper {
    pub fn new(target_se: u32) -> SessionExpiresHelper {
        SessionExpiresHelper {
            target_se,
            uac_supports_timer: false,
            se_on_req: None,
        }
    }

    /// Processes a request on its way downstream. Only INVITE and UPDATE
    /// carry session timers; everything else passes untouched.
    pub fn process_request(&mut self, req: &mut Request) {
        if !matches!(req.method, SipMethod::Invite | SipMethod::Update) {
            return;
        }

        self.uac_supports_timer = req.headers.contains_token("Supported", "timer");

        let existing = req.headers.get(SESSION_EXPIRES).and_then(parse_interval);
        let min_se = req.headers.get(MIN_SE).and_then(parse_interval);

        // Cap at the target, but never below the peer's minimum.
        let mut se = existing.map_or(self.target_se, |v| v.min(self.target_se));
        if let Some(min) = min_se {
            se = se.max(min);
        }

        req.headers.set(SESSION_EXPIRES, &se.to_string());
        self.se_on_req = Some(se);
        log::debug!("session interval {} on {}", se, req.method);
    }

    /// Processes a response on its way upstream. If the terminating side
    /// answered without a Session-Expires but the UAC supports timers, this
    /// node fills in the interval it sent downstream and makes the timer
    /// extension mandatory.
    pub fn process_response(&mut self, rsp: &mut Response) {
        let Some(se) = self.se_on_req else {
            return;
        };
        if !rsp.status.is_success() {
            return;
        }
        if let Some((_, method)) = rsp.headers.cseq() {
            if !matches!(method, SipMethod::Invite | SipMethod::Update) {
                return;
            }
        }
        if rsp.headers.get(SESSION_EXPIRES).is_some() {
            // The UAS runs the timer; leave its choice alone.
            return;
        }
        if self.uac_supports_timer {
            rsp.headers
                .set(SESSION_EXPIRES, &format!("{};refresher=uac", se));
            rsp.headers.add_token("Require", "timer");
            log::debug!("session interval {} applied on response, refresher uac", se);
        }
    }
}

/// The leading integer of a Session-Expires or Min-SE value, ignoring any
/// parameters.
fn parse_interval(value: &str) -> Option<u32> {
    value.split(';').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::message::{Headers, Response, StatusCode};
    use crate::proxy::Builder;
    use crate::service::{Sproutlet, SproutletHelper, SproutletTsx};
    use crate::tsx::uac::mock::MockUacFactory;
    use crate::tsx::{TerminatePolicy, TsxEvent, UasTsx, Upstream};
    use crate::TrailId;

    const ROOT: &str = "proxy1.homedomain";

    // The session-timer sproutlet: all it does is run the helper over the
    // traffic passing through it.
    struct SessionTimerSproutlet;

    struct SessionTimerTsx {
        se_helper: SessionExpiresHelper,
    }

    impl SproutletTsx for SessionTimerTsx {
        fn on_rx_initial_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            mut req: Request,
        ) -> crate::Result<()> {
            self.se_helper.process_request(&mut req);
            helper.send_request(req)?;
            Ok(())
        }

        fn on_rx_in_dialog_request(
            &mut self,
            helper: &mut dyn SproutletHelper,
            mut req: Request,
        ) -> crate::Result<()> {
            self.se_helper.process_request(&mut req);
            helper.send_request(req)?;
            Ok(())
        }

        fn on_rx_response(
            &mut self,
            helper: &mut dyn SproutletHelper,
            _fork_id: usize,
            mut rsp: Response,
        ) -> crate::Result<()> {
            self.se_helper.process_response(&mut rsp);
            helper.send_response(rsp);
            Ok(())
        }
    }

    impl Sproutlet for SessionTimerSproutlet {
        fn service_name(&self) -> &str {
            "se"
        }
        fn create_tsx(&self, _alias: &str, _req: &Request) -> Box<dyn SproutletTsx> {
            Box::new(SessionTimerTsx {
                se_helper: SessionExpiresHelper::new(600),
            })
        }
    }

    #[derive(Clone, Default)]
    struct CaptureUpstream {
        responses: Arc<Mutex<Vec<Response>>>,
    }

    impl Upstream for CaptureUpstream {
        fn send_response(&mut self, rsp: Response, _trail: TrailId) {
            self.responses.lock().expect("Lock failed").push(rsp);
        }
    }

    struct Flow {
        tsx: UasTsx,
        factory: MockUacFactory,
        upstream: CaptureUpstream,
        forwarded: Request,
    }

    fn message(method: SipMethod, se: Option<&str>, min_se: Option<&str>, timer: bool) -> Request {
        let mut req = Request::new(method.clone(), "sip:bob@homedomain".parse().unwrap());
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/TCP 10.83.18.38:36530;branch=z9hG4bKPjmo1aim");
        headers.push("From", "sip:alice@homedomain;tag=8c8b232a");
        let to = if method == SipMethod::Update {
            "sip:bob@homedomain;tag=12345"
        } else {
            "sip:bob@homedomain"
        };
        headers.push("To", to);
        headers.push("Call-ID", "0gQAAC8WAAACBAAALxYAAAL8P3U");
        headers.push("CSeq", &format!("16567 {}", method));
        headers.push("Route", &format!("<sip:se.{};lr>", ROOT));
        headers.push("Route", "<sip:proxy2.homedomain;lr>");
        if let Some(se) = se {
            headers.push("Session-Expires", se);
        }
        if let Some(min_se) = min_se {
            headers.push("Min-SE", min_se);
        }
        if timer {
            headers.push("Supported", "timer");
        }
        req.headers = headers;
        req
    }

    fn run_request(req: Request) -> Flow {
        let proxy = Builder::new()
            .with_root_uri(&format!("sip:{}", ROOT))
            .with_sproutlet(SessionTimerSproutlet)
            .build()
            .unwrap();
        let factory = MockUacFactory::new();
        let upstream = CaptureUpstream::default();
        let mut tsx = UasTsx::new(
            proxy,
            Box::new(upstream.clone()),
            Arc::new(factory.clone()),
            0x5e55,
            TerminatePolicy::DropForks,
        );
        tsx.process_initial_request(req, 0).unwrap();

        assert_eq!(factory.leg_count(), 1);
        let forwarded = factory.requests(0).remove(0);
        Flow {
            tsx,
            factory,
            upstream,
            forwarded,
        }
    }

    fn respond(flow: &mut Flow, status: u16, se: Option<&str>) -> Response {
        let mut rsp = Response::for_request(&flow.forwarded, StatusCode(status), None);
        if let Some(se) = se {
            rsp.headers.push("Session-Expires", se);
        }
        flow.tsx.handle_event(TsxEvent::UacResponse {
            uac: flow.factory.leg_id(0),
            rsp,
        });
        flow.upstream
            .responses
            .lock()
            .expect("Lock failed")
            .iter()
            .rev()
            .find(|r| r.status.is_final())
            .cloned()
            .expect("no final response forwarded")
    }

    // No Session-Expires on the inbound INVITE: the helper stamps its
    // target.
    #[test]
    fn no_existing_se() {
        let flow = run_request(message(SipMethod::Invite, None, None, false));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("600"));
    }

    // An existing interval above the target is reduced.
    #[test]
    fn high_existing_se() {
        let flow = run_request(message(SipMethod::Invite, Some("900"), None, false));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("600"));
    }

    // An existing interval below the target is left alone.
    #[test]
    fn low_existing_se() {
        let flow = run_request(message(SipMethod::Invite, Some("450"), None, false));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("450"));
    }

    // A Min-SE below the target changes nothing.
    #[test]
    fn low_min_se() {
        let flow = run_request(message(SipMethod::Invite, None, Some("100"), false));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("600"));
    }

    // A Min-SE above the target raises the interval to it.
    #[test]
    fn high_min_se() {
        let flow = run_request(message(SipMethod::Invite, None, Some("1000"), false));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("1000"));
    }

    // Client supports timers, server does not: the response gets the
    // interval that was sent downstream, refreshed by the UAC.
    #[test]
    fn client_supports_timer_server_does_not() {
        let mut flow = run_request(message(SipMethod::Invite, None, None, true));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("600"));

        let rsp = respond(&mut flow, 200, None);
        assert_eq!(
            rsp.headers.get("Session-Expires"),
            Some("600;refresher=uac")
        );
        assert!(rsp.headers.contains_token("Require", "timer"));
    }

    // Neither side supports timers: the response carries no
    // Session-Expires.
    #[test]
    fn neither_side_supports_timer() {
        let mut flow = run_request(message(SipMethod::Invite, None, None, false));
        let rsp = respond(&mut flow, 200, None);
        assert_eq!(rsp.headers.get("Session-Expires"), None);
    }

    // The server chose its own interval: it is passed through untouched.
    #[test]
    fn server_supports_timer() {
        let mut flow = run_request(message(SipMethod::Invite, None, None, true));
        let rsp = respond(&mut flow, 200, Some("500;refresher=uas"));
        assert_eq!(
            rsp.headers.get("Session-Expires"),
            Some("500;refresher=uas")
        );
    }

    // The response interval matches the value on the *sent* request even
    // when the received request asked for more.
    #[test]
    fn response_matches_sent_interval() {
        let mut flow = run_request(message(SipMethod::Invite, Some("800"), None, true));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("600"));

        let rsp = respond(&mut flow, 200, None);
        assert_eq!(
            rsp.headers.get("Session-Expires"),
            Some("600;refresher=uac")
        );
    }

    // Session-timer processing also happens on in-dialog UPDATEs.
    #[test]
    fn processing_happens_on_update() {
        let mut flow = run_request(message(SipMethod::Update, None, None, true));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), Some("600"));

        let rsp = respond(&mut flow, 200, None);
        assert_eq!(
            rsp.headers.get("Session-Expires"),
            Some("600;refresher=uac")
        );
    }

    // Other methods pass through without session-timer processing.
    #[test]
    fn no_processing_on_other_methods() {
        let mut flow = run_request(message(SipMethod::Subscribe, None, None, true));
        assert_eq!(flow.forwarded.headers.get("Session-Expires"), None);

        let rsp = respond(&mut flow, 200, None);
        assert_eq!(rsp.headers.get("Session-Expires"), None);
    }

    // Error responses are never stamped.
    #[test]
    fn no_processing_on_error_responses() {
        let mut flow = run_request(message(SipMethod::Invite, None, None, true));
        let rsp = respond(&mut flow, 480, None);
        assert_eq!(rsp.status, StatusCode(480));
        assert_eq!(rsp.headers.get("Session-Expires"), None);
    }
}
