//! SIP DNS resolution.
//!
//! Resolves a SIP next-hop to concrete `(address, port, transport)` targets
//! following RFC 3263: NAPTR to pick the transport, SRV to pick hosts and
//! ports, A/AAAA for the addresses, with sensible entry points when the
//! caller already knows the port or transport. Failed targets can be
//! blacklisted; blacklisted targets are only handed out after the clean
//! ones, never silently dropped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::TransportType;
use crate::{Error, Result};

/// A concrete resolution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: IpAddr,
    pub port: u16,
    pub transport: TransportType,
    /// Set when the target was served despite being blacklisted.
    pub blacklisted: bool,
}

impl Target {
    fn new(address: IpAddr, port: u16, transport: TransportType) -> Target {
        Target {
            address,
            port,
            transport,
            blacklisted: false,
        }
    }

    fn key(&self) -> (IpAddr, u16, TransportType) {
        (self.address, self.port, self.transport)
    }
}

/// A NAPTR record.
#[derive(Debug, Clone)]
pub struct NaptrRecord {
    pub order: u16,
    pub preference: u16,
    pub flags: String,
    pub service: String,
    pub replacement: String,
}

/// An SRV record.
#[derive(Debug, Clone)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// The DNS lookups the resolver needs.
#[async_trait::async_trait]
pub trait DnsClient: Send + Sync + 'static {
    async fn naptr_query(&self, name: &str) -> Result<Vec<NaptrRecord>>;
    async fn srv_query(&self, name: &str) -> Result<Vec<SrvRecord>>;
    async fn ip_query(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// The SIP resolver.
pub struct SipResolver {
    dns: Arc<dyn DnsClient>,
    /// NAPTR services this node supports, keyed by service tag.
    naptr_services: HashMap<String, TransportType>,
    blacklist: Mutex<HashMap<(IpAddr, u16, TransportType), Instant>>,
    blacklist_duration: Duration,
}

impl SipResolver {
    pub fn new(dns: Arc<dyn DnsClient>, blacklist_duration: Duration) -> SipResolver {
        log::debug!("creating SIP resolver");
        let mut naptr_services = HashMap::new();
        naptr_services.insert("SIP+D2U".to_string(), TransportType::Udp);
        naptr_services.insert("SIP+D2T".to_string(), TransportType::Tcp);

        SipResolver {
            dns,
            naptr_services,
            blacklist: Mutex::new(HashMap::new()),
            blacklist_duration,
        }
    }

    /// Resolves a name to targets per RFC 3263 section 4. `port` 0 and
    /// `transport` `None` mean unspecified.
    pub async fn resolve(
        &self,
        name: &str,
        port: u16,
        transport: Option<TransportType>,
    ) -> Result<Vec<Target>> {
        log::debug!(
            "resolve {} port {} transport {}",
            name,
            port,
            transport.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
        );

        // The name may already be an IP literal: no DNS resolution is
        // possible, default the port and transport as needed.
        if let Ok(ip) = name.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            let target = Target::new(
                ip,
                if port != 0 { port } else { 5060 },
                transport.unwrap_or(TransportType::Udp),
            );
            return Ok(self.apply_blacklist(vec![target]));
        }

        let mut transport = transport;
        let mut srv_name = None;
        let mut a_name = name.to_string();

        if port != 0 {
            // Port given: skip NAPTR and SRV, go straight to the address
            // lookup.
            log::debug!("port specified, A/AAAA lookup only for {}", name);
        } else if transport.is_none() {
            match self.best_naptr(name).await {
                Some(naptr) => {
                    let tp = self.naptr_services[naptr.service.as_str()];
                    transport = Some(tp);
                    if naptr.flags.eq_ignore_ascii_case("S") {
                        log::debug!("NAPTR selected SRV {} over {}", naptr.replacement, tp);
                        srv_name = Some(naptr.replacement);
                    } else {
                        // "A"/"AA" flags: address lookup of the replacement.
                        log::debug!("NAPTR selected host {} over {}", naptr.replacement, tp);
                        a_name = naptr.replacement;
                    }
                }
                None => {
                    // NAPTR failed: probe SRV for both UDP and TCP to see
                    // which transports the domain supports, preferring UDP.
                    log::debug!("NAPTR lookup failed, probing UDP and TCP SRV for {}", name);
                    let udp_name = format!("_sip._udp.{}", name);
                    let tcp_name = format!("_sip._tcp.{}", name);
                    let (udp, tcp) = tokio::join!(
                        self.dns.srv_query(&udp_name),
                        self.dns.srv_query(&tcp_name)
                    );
                    let udp = udp.unwrap_or_default();
                    let tcp = tcp.unwrap_or_default();
                    if !udp.is_empty() {
                        transport = Some(TransportType::Udp);
                        srv_name = Some(udp_name);
                    } else if !tcp.is_empty() {
                        transport = Some(TransportType::Tcp);
                        srv_name = Some(tcp_name);
                    } else {
                        log::debug!("no SRV records for {}, defaulting to UDP", name);
                        transport = Some(TransportType::Udp);
                    }
                }
            }
        } else {
            // Transport given: try the matching SRV domain, fall through to
            // the address lookup if it is empty.
            let name = format!(
                "_sip._{}.{}",
                transport.unwrap_or(TransportType::Udp).param_str(),
                name
            );
            match self.dns.srv_query(&name).await {
                Ok(records) if !records.is_empty() => srv_name = Some(name),
                Ok(_) => {}
                Err(e) => log::debug!("SRV lookup for {} failed: {}", name, e),
            }
        }

        let transport = transport.unwrap_or(TransportType::Udp);
        let targets = match srv_name {
            Some(srv_name) => self.srv_resolve(&srv_name, transport).await?,
            None => {
                let port = if port != 0 { port } else { 5060 };
                self.a_resolve(&a_name, port, transport).await?
            }
        };

        Ok(self.apply_blacklist(targets))
    }

    /// The lowest order/preference NAPTR record with a supported service.
    async fn best_naptr(&self, name: &str) -> Option<NaptrRecord> {
        let records = match self.dns.naptr_query(name).await {
            Ok(records) => records,
            Err(e) => {
                log::debug!("NAPTR lookup for {} failed: {}", name, e);
                return None;
            }
        };
        records
            .into_iter()
            .filter(|r| self.naptr_services.contains_key(r.service.as_str()))
            .min_by_key(|r| (r.order, r.preference))
    }

    /// Resolves every SRV record target, priority first, heavier weights
    /// within a priority ahead of lighter ones.
    async fn srv_resolve(&self, srv_name: &str, transport: TransportType) -> Result<Vec<Target>> {
        let mut records = self.dns.srv_query(srv_name).await?;
        records.sort_by_key(|r| (r.priority, std::cmp::Reverse(r.weight)));

        let mut targets = Vec::new();
        for record in records {
            match self.dns.ip_query(&record.target).await {
                Ok(ips) => {
                    targets.extend(
                        ips.into_iter()
                            .map(|ip| Target::new(ip, record.port, transport)),
                    );
                }
                Err(e) => log::debug!("A/AAAA lookup for {} failed: {}", record.target, e),
            }
        }
        Ok(targets)
    }

    async fn a_resolve(&self, name: &str, port: u16, transport: TransportType) -> Result<Vec<Target>> {
        let ips = self.dns.ip_query(name).await?;
        Ok(ips
            .into_iter()
            .map(|ip| Target::new(ip, port, transport))
            .collect())
    }

    /// Marks a target as failed for the blacklist duration.
    pub fn blacklist(&self, target: &Target) {
        log::debug!(
            "blacklisting {}:{}/{}",
            target.address,
            target.port,
            target.transport
        );
        self.blacklist
            .lock()
            .expect("Lock failed")
            .insert(target.key(), Instant::now() + self.blacklist_duration);
    }

    /// Clears a target from the blacklist after a successful exchange.
    pub fn success(&self, target: &Target) {
        self.blacklist.lock().expect("Lock failed").remove(&target.key());
    }

    /// Moves blacklisted targets to the back of the list, marked; expired
    /// entries are dropped from the blacklist as they are seen.
    fn apply_blacklist(&self, targets: Vec<Target>) -> Vec<Target> {
        let now = Instant::now();
        let mut blacklist = self.blacklist.lock().expect("Lock failed");
        blacklist.retain(|_, expiry| *expiry > now);

        let mut clean = Vec::new();
        let mut dirty = Vec::new();
        for mut target in targets {
            if blacklist.contains_key(&target.key()) {
                target.blacklisted = true;
                dirty.push(target);
            } else {
                clean.push(target);
            }
        }
        clean.extend(dirty);
        clean
    }
}

/// A [`DnsClient`] backed by hickory-resolver.
pub struct HickoryDnsClient {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl HickoryDnsClient {
    /// Builds a client from the system resolver configuration.
    pub fn from_system_conf() -> Result<HickoryDnsClient> {
        let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Dns(e.to_string()))?;
        Ok(HickoryDnsClient { resolver })
    }
}

fn resolve_err(e: hickory_resolver::error::ResolveError) -> Error {
    Error::Dns(e.to_string())
}

fn is_no_records(e: &hickory_resolver::error::ResolveError) -> bool {
    matches!(
        e.kind(),
        hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
    )
}

#[async_trait::async_trait]
impl DnsClient for HickoryDnsClient {
    async fn naptr_query(&self, name: &str) -> Result<Vec<NaptrRecord>> {
        use hickory_resolver::proto::rr::{RData, RecordType};

        let lookup = match self.resolver.lookup(name, RecordType::NAPTR).await {
            Ok(lookup) => lookup,
            Err(e) if is_no_records(&e) => return Ok(Vec::new()),
            Err(e) => return Err(resolve_err(e)),
        };

        Ok(lookup
            .iter()
            .filter_map(|rdata| match rdata {
                RData::NAPTR(naptr) => Some(NaptrRecord {
                    order: naptr.order(),
                    preference: naptr.preference(),
                    flags: String::from_utf8_lossy(naptr.flags()).to_string(),
                    service: String::from_utf8_lossy(naptr.services()).to_string(),
                    replacement: naptr
                        .replacement()
                        .to_utf8()
                        .trim_end_matches('.')
                        .to_string(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn srv_query(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let lookup = match self.resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) if is_no_records(&e) => return Ok(Vec::new()),
            Err(e) => return Err(resolve_err(e)),
        };

        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
            })
            .collect())
    }

    async fn ip_query(&self, name: &str) -> Result<Vec<IpAddr>> {
        let lookup = match self.resolver.lookup_ip(name).await {
            Ok(lookup) => lookup,
            Err(e) if is_no_records(&e) => return Ok(Vec::new()),
            Err(e) => return Err(resolve_err(e)),
        };
        Ok(lookup.iter().collect())
    }
}
