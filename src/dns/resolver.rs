//! forwards queries to upstream resolvers with per target failover

use std::time::{Duration, Instant};

use serde_derive::Deserialize;
use serde_json::Value;

use crate::dns::client::{
    NetworkExchanger, UpstreamConfig, UpstreamExchanger,
};
use crate::dns::protocol::{DnsPacket, ResultCode};
use crate::module::{
    DnsHandler, HandlerError, HandlerResult, LoadContext, Module, ModuleError, ModuleInfo,
    RequestContext, ResponseWriter,
};

pub fn module_info() -> ModuleInfo {
    ModuleInfo {
        id: "dns.resolver.upstream",
        new: || Box::new(UpstreamResolver::default()),
    }
}

/// Handler that forwards every query to an ordered list of upstream
/// servers. Targets are tried in order; the first response wins and
/// failures fall through to the next target.
#[derive(Default, Deserialize)]
pub struct UpstreamResolver {
    #[serde(default)]
    upstreams: Vec<String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    protocol: Option<String>,

    #[serde(skip)]
    exchange_timeout: Duration,
    #[serde(skip)]
    exchanger: Option<Box<dyn UpstreamExchanger>>,
}

impl UpstreamResolver {
    fn config_view(&self) -> UpstreamConfig {
        UpstreamConfig {
            upstreams: self.upstreams.clone(),
            timeout: self.timeout.clone(),
            protocol: self.protocol.clone(),
        }
    }

    /// Timeout for one attempt: the configured exchange timeout capped by
    /// whatever remains of the request deadline.
    fn attempt_timeout(&self, ctx: &RequestContext) -> Option<Duration> {
        let mut timeout = self.exchange_timeout;
        if let Some(deadline) = ctx.deadline() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            timeout = timeout.min(remaining);
        }
        Some(timeout)
    }

    #[cfg(test)]
    fn set_exchanger(&mut self, exchanger: Box<dyn UpstreamExchanger>) {
        self.exchanger = Some(exchanger);
    }
}

impl Module for UpstreamResolver {
    fn hydrate(&mut self, raw: &Value) -> crate::module::Result<()> {
        *self = serde_json::from_value(raw.clone()).map_err(|e| ModuleError::Hydrate {
            id: "dns.resolver.upstream".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn provision(&mut self, _ctx: &LoadContext) -> crate::module::Result<()> {
        if self.upstreams.is_empty() {
            self.upstreams = UpstreamConfig::default_targets();
        }

        let config = self.config_view();
        self.exchange_timeout = config.resolved_timeout().map_err(ModuleError::InvalidConfig)?;
        let protocol = config.resolved_protocol().map_err(ModuleError::InvalidConfig)?;
        config.validate_targets().map_err(ModuleError::InvalidConfig)?;

        self.exchanger = Some(Box::new(NetworkExchanger::new(protocol)));

        Ok(())
    }

    fn as_handler(&self) -> Option<&dyn DnsHandler> {
        Some(self)
    }
}

impl DnsHandler for UpstreamResolver {
    fn serve_dns(
        &self,
        ctx: &RequestContext,
        w: &mut dyn ResponseWriter,
        r: &DnsPacket,
    ) -> HandlerResult<()> {
        let exchanger = self
            .exchanger
            .as_ref()
            .ok_or_else(|| HandlerError::NotAHandler("dns.resolver.upstream".to_string()))?;

        let (qname, qtype) = match r.questions.first() {
            Some(q) => (q.name.as_str(), q.qtype),
            None => ("", crate::dns::protocol::QueryType::Unknown(0)),
        };

        log::debug!(
            "starting upstream resolution query_id={} qname={} qtype={:?} upstreams={:?}",
            r.header.id,
            qname,
            qtype,
            self.upstreams
        );

        for (attempt, upstream) in self.upstreams.iter().enumerate() {
            if ctx.is_canceled() {
                return Err(HandlerError::Canceled);
            }

            let timeout = match self.attempt_timeout(ctx) {
                Some(timeout) => timeout,
                None => return Err(HandlerError::Canceled),
            };

            match exchanger.exchange(r, upstream, timeout) {
                Ok(mut response) => {
                    log::debug!(
                        "upstream resolver succeeded query_id={} upstream={} rcode={:?} answers={}",
                        r.header.id,
                        upstream,
                        response.header.rescode,
                        response.answers.len()
                    );

                    response.header.id = r.header.id;
                    return w.write_packet(&mut response);
                }
                Err(err) => {
                    log::debug!(
                        "upstream resolver failed query_id={} upstream={} attempt={} error={}",
                        r.header.id,
                        upstream,
                        attempt + 1,
                        err
                    );
                }
            }
        }

        log::debug!(
            "all upstream resolvers failed, returning SERVFAIL query_id={} qname={} tried={}",
            r.header.id,
            qname,
            self.upstreams.len()
        );

        let mut servfail = DnsPacket::reply_to(r);
        servfail.header.rescode = ResultCode::SERVFAIL;
        w.write_packet(&mut servfail)
    }
}
