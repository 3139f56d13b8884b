//! authoritative forward zones and the zone manager handler
//!
//! A forward zone owns the records for one domain suffix and optionally a
//! zone scoped upstream. The zone manager dispatches each query to the most
//! specific matching zone and falls back to a default upstream chain when no
//! zone produces an answer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::dns::client::{NetworkExchanger, UpstreamConfig, UpstreamExchanger};
use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, ResultCode, TransientTtl};
use crate::module::{
    DnsHandler, HandlerError, HandlerResult, LoadContext, Module, ModuleError, ModuleInfo,
    RequestContext, ResponseWriter,
};

pub fn module_info() -> ModuleInfo {
    ModuleInfo {
        id: "dns.zone.manager",
        new: || Box::new(ZoneManager::default()),
    }
}

const DEFAULT_RECORD_TTL: u32 = 300;

/// One record as declared in zone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordData {
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
    #[serde(default)]
    pub ttl: u32,
}

/// Configuration of a single zone. The only supported kind is `forward`;
/// an empty kind is read as `forward` as well.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub zone: String,
    #[serde(default)]
    pub records: HashMap<String, RecordData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
}

/// Lowercase a name and terminate it with the trailing label separator.
pub fn normalize_name(qname: &str) -> String {
    let mut name = qname.to_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Convert a possibly relative record name to an FQDN within a zone. `@`
/// and the empty string denote the zone apex; absolute names are only
/// normalized.
pub fn make_absolute(name: &str, zone_name: &str) -> String {
    let name = name.trim();
    let zone_name = normalize_name(zone_name);

    if name == "@" || name.is_empty() {
        return zone_name;
    }

    if name.ends_with('.') {
        return normalize_name(name);
    }

    normalize_name(&format!("{}.{}", name, zone_name))
}

fn is_subdomain(qname: &str, zone: &str) -> bool {
    let qname = normalize_name(qname);
    let zone = normalize_name(zone);

    if qname == zone {
        return true;
    }

    qname.ends_with(&format!(".{}", zone))
}

fn record_matches_qtype(record: &RecordData, qtype: QueryType) -> bool {
    match qtype {
        QueryType::A => record.rtype.eq_ignore_ascii_case("A"),
        QueryType::Aaaa => record.rtype.eq_ignore_ascii_case("AAAA"),
        QueryType::Cname => record.rtype.eq_ignore_ascii_case("CNAME"),
        QueryType::Txt => record.rtype.eq_ignore_ascii_case("TXT"),
        QueryType::Any => true,
        QueryType::Unknown(_) => false,
    }
}

/// Synthesize a response for a locally held record. Unparseable addresses
/// and unknown record types produce a SERVFAIL response rather than an
/// error, so the query is still considered handled.
fn synthesize_response(request: &DnsPacket, record: &RecordData, qname: &str) -> DnsPacket {
    let mut response = DnsPacket::reply_to(request);

    let ttl = if record.ttl == 0 {
        DEFAULT_RECORD_TTL
    } else {
        record.ttl
    };

    let answer = match record.rtype.to_uppercase().as_str() {
        "A" => match record.value.parse() {
            Ok(addr) => DnsRecord::A {
                domain: qname.to_string(),
                addr,
                ttl: TransientTtl(ttl),
            },
            Err(_) => {
                response.header.rescode = ResultCode::SERVFAIL;
                return response;
            }
        },
        "AAAA" => match record.value.parse() {
            Ok(addr) => DnsRecord::Aaaa {
                domain: qname.to_string(),
                addr,
                ttl: TransientTtl(ttl),
            },
            Err(_) => {
                response.header.rescode = ResultCode::SERVFAIL;
                return response;
            }
        },
        "CNAME" => DnsRecord::Cname {
            domain: qname.to_string(),
            host: normalize_name(&record.value),
            ttl: TransientTtl(ttl),
        },
        "TXT" => DnsRecord::Txt {
            domain: qname.to_string(),
            data: record.value.clone(),
            ttl: TransientTtl(ttl),
        },
        _ => {
            response.header.rescode = ResultCode::SERVFAIL;
            return response;
        }
    };

    response.answers.push(answer);
    response
}

/// Try targets in order; the first response is written with the client's
/// transaction id restored. When every target fails the client receives
/// SERVFAIL. Returns an error only on cancellation or writer failure.
fn forward_to_targets(
    exchanger: &dyn UpstreamExchanger,
    targets: &[String],
    timeout: Duration,
    ctx: &RequestContext,
    w: &mut dyn ResponseWriter,
    r: &DnsPacket,
) -> HandlerResult<()> {
    for target in targets {
        if ctx.is_canceled() {
            return Err(HandlerError::Canceled);
        }

        let mut attempt_timeout = timeout;
        if let Some(deadline) = ctx.deadline() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HandlerError::Canceled);
            }
            attempt_timeout = attempt_timeout.min(remaining);
        }

        match exchanger.exchange(r, target, attempt_timeout) {
            Ok(mut response) => {
                log::debug!(
                    "upstream query succeeded upstream={} rcode={:?}",
                    target,
                    response.header.rescode
                );
                response.header.id = r.header.id;
                return w.write_packet(&mut response);
            }
            Err(err) => {
                log::debug!("upstream query failed upstream={} error={}", target, err);
            }
        }
    }

    log::debug!("all upstream targets failed, returning SERVFAIL");
    let mut servfail = DnsPacket::reply_to(r);
    servfail.header.rescode = ResultCode::SERVFAIL;
    w.write_packet(&mut servfail)
}

/// A zone holding local records for one domain suffix, with an optional
/// zone scoped upstream for names it does not hold.
pub struct ForwardZone {
    name: String,
    records: HashMap<String, RecordData>,
    upstream_targets: Vec<String>,
    upstream_timeout: Duration,
    exchanger: Option<Box<dyn UpstreamExchanger>>,
}

impl ForwardZone {
    /// Build a zone from configuration. Record keys are made absolute
    /// within the zone and normalized; the upstream settings are validated
    /// here so the request path never sees malformed targets.
    pub fn new(config: &ZoneConfig) -> crate::module::Result<ForwardZone> {
        let name = normalize_name(&config.zone);

        let mut records = HashMap::new();
        for (key, record) in &config.records {
            records.insert(make_absolute(key, &name), record.clone());
        }

        let mut upstream_targets = Vec::new();
        let mut upstream_timeout = Duration::from_secs(5);
        let mut exchanger: Option<Box<dyn UpstreamExchanger>> = None;

        if let Some(upstream) = &config.upstream {
            upstream
                .validate_targets()
                .map_err(ModuleError::InvalidConfig)?;
            upstream_timeout = upstream
                .resolved_timeout()
                .map_err(ModuleError::InvalidConfig)?;
            let protocol = upstream
                .resolved_protocol()
                .map_err(ModuleError::InvalidConfig)?;

            upstream_targets = upstream.upstreams.clone();
            if !upstream_targets.is_empty() {
                exchanger = Some(Box::new(NetworkExchanger::new(protocol)));
            }
        }

        Ok(ForwardZone {
            name,
            records,
            upstream_targets,
            upstream_timeout,
            exchanger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when qname equals the zone name or is a strict descendant.
    pub fn matches(&self, qname: &str) -> bool {
        is_subdomain(qname, &self.name)
    }

    /// Answer a query from local records or the zone scoped upstream.
    /// Returns false when this zone has nothing to say about the name, in
    /// which case the manager keeps looking.
    pub fn resolve(
        &self,
        ctx: &RequestContext,
        w: &mut dyn ResponseWriter,
        r: &DnsPacket,
        client_group: &str,
    ) -> HandlerResult<bool> {
        let question = match r.questions.first() {
            Some(q) => q,
            None => return Ok(false),
        };

        let qname = normalize_name(&question.name);
        let qtype = question.qtype;

        log::debug!(
            "forward zone resolving query zone={} qname={} qtype={:?} client_group={}",
            self.name,
            qname,
            qtype,
            client_group
        );

        if !self.matches(&qname) {
            return Ok(false);
        }

        if let Some(record) = self.records.get(&qname) {
            if record_matches_qtype(record, qtype) {
                log::debug!(
                    "found local record zone={} qname={} record_type={} record_value={}",
                    self.name,
                    qname,
                    record.rtype,
                    record.value
                );

                let mut response = synthesize_response(r, record, &qname);
                w.write_packet(&mut response)?;
                return Ok(true);
            }
        }

        if let Some(exchanger) = &self.exchanger {
            log::debug!(
                "forwarding to zone upstream zone={} upstreams={:?}",
                self.name,
                self.upstream_targets
            );
            forward_to_targets(
                exchanger.as_ref(),
                &self.upstream_targets,
                self.upstream_timeout,
                ctx,
                w,
                r,
            )?;
            return Ok(true);
        }

        Ok(false)
    }

    #[cfg(test)]
    pub fn set_exchanger(&mut self, exchanger: Box<dyn UpstreamExchanger>) {
        self.exchanger = Some(exchanger);
    }
}

/// Handler dispatching queries across a set of forward zones, with a
/// default upstream chain for everything no zone answers.
#[derive(Default, Deserialize)]
pub struct ZoneManager {
    #[serde(default)]
    zones: Vec<ZoneConfig>,
    #[serde(default)]
    default_upstream: Option<UpstreamConfig>,

    // sorted by descending name length so the most specific zone is
    // consulted first
    #[serde(skip)]
    compiled: Vec<ForwardZone>,
    #[serde(skip)]
    default_targets: Vec<String>,
    #[serde(skip)]
    default_timeout: Duration,
    #[serde(skip)]
    default_exchanger: Option<Box<dyn UpstreamExchanger>>,
}

impl ZoneManager {
    fn client_group<'a>(ctx: &'a RequestContext) -> &'a str {
        match ctx.client_group() {
            Some(group) if !group.is_empty() => group,
            _ => "default",
        }
    }

    fn reply_rcode(
        &self,
        w: &mut dyn ResponseWriter,
        r: &DnsPacket,
        rcode: ResultCode,
    ) -> HandlerResult<()> {
        let mut response = DnsPacket::reply_to(r);
        response.header.rescode = rcode;
        w.write_packet(&mut response)
    }

    #[cfg(test)]
    fn set_default_exchanger(&mut self, exchanger: Box<dyn UpstreamExchanger>) {
        self.default_exchanger = Some(exchanger);
    }

    #[cfg(test)]
    fn zone_mut(&mut self, name: &str) -> Option<&mut ForwardZone> {
        let name = normalize_name(name);
        self.compiled.iter_mut().find(|z| z.name() == name)
    }
}

impl Module for ZoneManager {
    fn hydrate(&mut self, raw: &Value) -> crate::module::Result<()> {
        *self = serde_json::from_value(raw.clone()).map_err(|e| ModuleError::Hydrate {
            id: "dns.zone.manager".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn provision(&mut self, _ctx: &LoadContext) -> crate::module::Result<()> {
        // An absent default_upstream falls back to the stock resolvers; an
        // explicitly empty target list disables the fallback entirely.
        let default_upstream = self.default_upstream.clone().unwrap_or_else(|| {
            UpstreamConfig {
                upstreams: UpstreamConfig::default_targets(),
                timeout: Some("5s".to_string()),
                protocol: Some("udp".to_string()),
            }
        });

        default_upstream
            .validate_targets()
            .map_err(ModuleError::InvalidConfig)?;
        self.default_timeout = default_upstream
            .resolved_timeout()
            .map_err(ModuleError::InvalidConfig)?;
        let protocol = default_upstream
            .resolved_protocol()
            .map_err(ModuleError::InvalidConfig)?;
        self.default_targets = default_upstream.upstreams.clone();
        if !self.default_targets.is_empty() {
            self.default_exchanger = Some(Box::new(NetworkExchanger::new(protocol)));
        }

        // later zone entries with the same normalized name replace earlier
        // ones
        let mut by_name: HashMap<String, ForwardZone> = HashMap::new();
        for config in &self.zones {
            if !config.kind.is_empty() && !config.kind.eq_ignore_ascii_case("forward") {
                return Err(ModuleError::InvalidConfig(format!(
                    "unsupported zone type: {}",
                    config.kind
                )));
            }

            let zone = ForwardZone::new(config).map_err(|e| {
                ModuleError::InvalidConfig(format!("failed to create zone {}: {}", config.zone, e))
            })?;
            by_name.insert(zone.name().to_string(), zone);
        }

        let mut compiled: Vec<ForwardZone> = by_name.into_values().collect();
        compiled.sort_by(|a, b| {
            b.name()
                .len()
                .cmp(&a.name().len())
                .then_with(|| a.name().cmp(b.name()))
        });
        self.compiled = compiled;

        log::info!(
            "zone manager provisioned zones={} default_upstream={:?}",
            self.compiled.len(),
            self.default_targets
        );

        Ok(())
    }

    fn cleanup(&self) -> crate::module::Result<()> {
        log::debug!("cleaning up zone manager");
        Ok(())
    }

    fn as_handler(&self) -> Option<&dyn DnsHandler> {
        Some(self)
    }
}

impl DnsHandler for ZoneManager {
    fn serve_dns(
        &self,
        ctx: &RequestContext,
        w: &mut dyn ResponseWriter,
        r: &DnsPacket,
    ) -> HandlerResult<()> {
        let question = match r.questions.first() {
            Some(q) => q,
            None => return self.reply_rcode(w, r, ResultCode::FORMERR),
        };

        let qname = normalize_name(&question.name);
        let client_group = Self::client_group(ctx);

        log::debug!(
            "processing DNS query query_id={} qname={} qtype={:?} client_group={}",
            r.header.id,
            qname,
            question.qtype,
            client_group
        );

        for zone in &self.compiled {
            if !zone.matches(&qname) {
                continue;
            }

            match zone.resolve(ctx, w, r, client_group) {
                Ok(true) => {
                    log::debug!(
                        "query resolved by zone zone={} qname={} client_group={}",
                        zone.name(),
                        qname,
                        client_group
                    );
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => {
                    log::error!(
                        "zone resolution error zone={} query_id={} qname={} client_group={} error={}",
                        zone.name(),
                        r.header.id,
                        qname,
                        client_group,
                        err
                    );
                    return self.reply_rcode(w, r, ResultCode::SERVFAIL);
                }
            }
        }

        if let Some(exchanger) = &self.default_exchanger {
            log::debug!(
                "forwarding to default upstream qname={} upstreams={:?}",
                qname,
                self.default_targets
            );
            return forward_to_targets(
                exchanger.as_ref(),
                &self.default_targets,
                self.default_timeout,
                ctx,
                w,
                r,
            );
        }

        log::debug!(
            "no zone matched, returning NXDOMAIN qname={} client_group={}",
            qname,
            client_group
        );
        self.reply_rcode(w, r, ResultCode::NXDOMAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::client::tests::StubExchanger;
    use crate::dns::client::ClientError;
    use crate::dns::protocol::DnsQuestion;
    use crate::module::tests::CaptureResponseWriter;

    fn query(qname: &str, qtype: QueryType) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = 77;
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));
        packet
    }

    fn manager(config: serde_json::Value) -> crate::module::Result<ZoneManager> {
        let mut manager = ZoneManager::default();
        manager.hydrate(&config)?;
        manager.provision(&LoadContext::new())?;
        Ok(manager)
    }

    fn answering_stub(addr: &'static str) -> Box<StubExchanger> {
        Box::new(StubExchanger::new(Box::new(move |request, _| {
            let mut reply = DnsPacket::reply_to(request);
            reply.answers.push(DnsRecord::A {
                domain: request.questions[0].name.clone(),
                addr: addr.parse().unwrap(),
                ttl: TransientTtl(30),
            });
            Ok(reply)
        })))
    }

    #[test]
    fn test_name_normalization() {
        assert_eq!("example.com.", normalize_name("Example.COM"));
        assert_eq!("example.com.", normalize_name("example.com."));
    }

    #[test]
    fn test_make_absolute() {
        assert_eq!("example.com.", make_absolute("@", "example.com"));
        assert_eq!("example.com.", make_absolute("", "example.com"));
        assert_eq!("api.example.com.", make_absolute("api", "example.com."));
        assert_eq!(
            "other.example.org.",
            make_absolute("Other.Example.ORG.", "example.com")
        );
    }

    #[test]
    fn test_zone_matching() {
        let zone = ForwardZone::new(&ZoneConfig {
            kind: String::new(),
            zone: "example.com".to_string(),
            records: HashMap::new(),
            upstream: None,
        })
        .unwrap();

        assert!(zone.matches("example.com."));
        assert!(zone.matches("api.example.com."));
        assert!(zone.matches("deep.api.example.com."));
        assert!(!zone.matches("example.org."));
        // a suffix match without the label separator is not a subdomain
        assert!(!zone.matches("notexample.com."));
    }

    #[test]
    fn test_local_record_hit() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{
                "zone": "example.com.",
                "records": {
                    "api.example.com.": { "type": "A", "value": "192.0.2.10", "ttl": 60 }
                }
            }],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let request = query("api.example.com.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        let response = &writer.packets[0];
        assert_eq!(ResultCode::NOERROR, response.header.rescode);
        assert_eq!(77, response.header.id);
        match &response.answers[0] {
            DnsRecord::A { addr, ttl, .. } => {
                assert_eq!("192.0.2.10", addr.to_string());
                assert_eq!(60, ttl.0);
            }
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_ttl_defaults_to_300() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{
                "zone": "example.com.",
                "records": {
                    "api": { "type": "A", "value": "192.0.2.10" }
                }
            }],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let request = query("api.example.com.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        match &writer.packets[0].answers[0] {
            DnsRecord::A { ttl, .. } => assert_eq!(300, ttl.0),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_mixed_case_query_routes_to_zone() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{
                "zone": "Example.COM",
                "records": {
                    "api": { "type": "A", "value": "192.0.2.10" }
                }
            }],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let request = query("API.Example.COM", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        assert_eq!(ResultCode::NOERROR, writer.packets[0].header.rescode);
        assert_eq!(1, writer.packets[0].answers.len());
    }

    #[test]
    fn test_qtype_gating() {
        let record = RecordData {
            rtype: "A".to_string(),
            value: "192.0.2.1".to_string(),
            ttl: 0,
        };

        assert!(record_matches_qtype(&record, QueryType::A));
        assert!(record_matches_qtype(&record, QueryType::Any));
        assert!(!record_matches_qtype(&record, QueryType::Aaaa));
        assert!(!record_matches_qtype(&record, QueryType::Unknown(33)));
    }

    #[test]
    fn test_txt_and_cname_synthesis() {
        let request = query("mail.example.com.", QueryType::Txt);
        let record = RecordData {
            rtype: "TXT".to_string(),
            value: "v=spf1 -all".to_string(),
            ttl: 0,
        };
        let response = synthesize_response(&request, &record, "mail.example.com.");
        match &response.answers[0] {
            DnsRecord::Txt { data, .. } => assert_eq!("v=spf1 -all", data),
            other => panic!("expected TXT record, got {:?}", other),
        }

        let request = query("www.example.com.", QueryType::Cname);
        let record = RecordData {
            rtype: "CNAME".to_string(),
            value: "example.com".to_string(),
            ttl: 120,
        };
        let response = synthesize_response(&request, &record, "www.example.com.");
        match &response.answers[0] {
            // target names are normalized to fully qualified form
            DnsRecord::Cname { host, .. } => assert_eq!("example.com.", host),
            other => panic!("expected CNAME record, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_record_value_yields_servfail() {
        let request = query("api.example.com.", QueryType::A);
        let record = RecordData {
            rtype: "A".to_string(),
            value: "not-an-address".to_string(),
            ttl: 0,
        };
        let response = synthesize_response(&request, &record, "api.example.com.");
        assert_eq!(ResultCode::SERVFAIL, response.header.rescode);

        let record = RecordData {
            rtype: "NAPTR".to_string(),
            value: "whatever".to_string(),
            ttl: 0,
        };
        let response = synthesize_response(&request, &record, "api.example.com.");
        assert_eq!(ResultCode::SERVFAIL, response.header.rescode);
    }

    #[test]
    fn test_no_question_yields_formerr() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let mut request = DnsPacket::new();
        request.header.id = 5;

        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        assert_eq!(ResultCode::FORMERR, writer.packets[0].header.rescode);
    }

    #[test]
    fn test_nxdomain_without_default_upstream() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{
                "zone": "example.com.",
                "records": {}
            }],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let request = query("elsewhere.org.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        assert_eq!(ResultCode::NXDOMAIN, writer.packets[0].header.rescode);
    }

    #[test]
    fn test_most_specific_zone_wins() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [
                {
                    "zone": "example.com.",
                    "records": {
                        "api.internal.example.com.": { "type": "A", "value": "192.0.2.1" }
                    }
                },
                {
                    "zone": "internal.example.com.",
                    "records": {
                        "api.internal.example.com.": { "type": "A", "value": "192.0.2.2" }
                    }
                }
            ],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let request = query("api.internal.example.com.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        match &writer.packets[0].answers[0] {
            DnsRecord::A { addr, .. } => assert_eq!("192.0.2.2", addr.to_string()),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_zone_miss_forwards_to_zone_upstream() {
        let mut manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{
                "zone": "example.com.",
                "records": {
                    "api": { "type": "A", "value": "192.0.2.10" }
                },
                "upstream": { "upstreams": ["198.51.100.1:53"] }
            }],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        manager
            .zone_mut("example.com.")
            .unwrap()
            .set_exchanger(answering_stub("198.51.100.5"));

        let request = query("other.example.com.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        assert_eq!(77, writer.packets[0].header.id);
        match &writer.packets[0].answers[0] {
            DnsRecord::A { addr, .. } => assert_eq!("198.51.100.5", addr.to_string()),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_query_uses_default_upstream() {
        let mut manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{
                "zone": "example.com.",
                "records": {}
            }]
        }))
        .unwrap();

        manager.set_default_exchanger(answering_stub("203.0.113.9"));

        let request = query("outside.org.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        match &writer.packets[0].answers[0] {
            DnsRecord::A { addr, .. } => assert_eq!("203.0.113.9", addr.to_string()),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_all_upstream_targets_failing_yields_servfail() {
        let mut manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": []
        }))
        .unwrap();

        manager.set_default_exchanger(Box::new(StubExchanger::new(Box::new(|_, _| {
            Err(ClientError::NoResponse)
        }))));

        let request = query("outside.org.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        assert_eq!(ResultCode::SERVFAIL, writer.packets[0].header.rescode);
    }

    #[test]
    fn test_unsupported_zone_kind_is_rejected() {
        let result = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{ "type": "stub", "zone": "example.com." }]
        }));
        assert!(result.is_err());

        // empty kind is a synonym for forward
        assert!(manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [{ "type": "", "zone": "example.com." }],
            "default_upstream": { "upstreams": [] }
        }))
        .is_ok());
    }

    #[test]
    fn test_concurrent_dispatch_is_consistent() {
        let manager = std::sync::Arc::new(
            manager(serde_json::json!({
                "handler": "dns.zone.manager",
                "zones": [{
                    "zone": "example.com.",
                    "records": {
                        "api": { "type": "A", "value": "192.0.2.10" }
                    }
                }],
                "default_upstream": { "upstreams": [] }
            }))
            .unwrap(),
        );

        let mut threads = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let request = query("api.example.com.", QueryType::A);
                    let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
                    manager
                        .serve_dns(&RequestContext::new(), &mut writer, &request)
                        .unwrap();

                    assert_eq!(ResultCode::NOERROR, writer.packets[0].header.rescode);
                    match &writer.packets[0].answers[0] {
                        DnsRecord::A { addr, .. } => {
                            assert_eq!("192.0.2.10", addr.to_string())
                        }
                        other => panic!("expected A record, got {:?}", other),
                    }
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_duplicate_zone_names_last_wins() {
        let manager = manager(serde_json::json!({
            "handler": "dns.zone.manager",
            "zones": [
                {
                    "zone": "example.com.",
                    "records": { "api": { "type": "A", "value": "192.0.2.1" } }
                },
                {
                    "zone": "example.com.",
                    "records": { "api": { "type": "A", "value": "192.0.2.2" } }
                }
            ],
            "default_upstream": { "upstreams": [] }
        }))
        .unwrap();

        let request = query("api.example.com.", QueryType::A);
        let mut writer = CaptureResponseWriter::from_ip("127.0.0.1");
        manager
            .serve_dns(&RequestContext::new(), &mut writer, &request)
            .unwrap();

        match &writer.packets[0].answers[0] {
            DnsRecord::A { addr, .. } => assert_eq!("192.0.2.2", addr.to_string()),
            other => panic!("expected A record, got {:?}", other),
        }
    }
}
