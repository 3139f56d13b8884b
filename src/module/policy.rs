//! routes queries to per client-group handler subtrees
//!
//! The policy handler owns a base handler configuration and, for each
//! policy, either aliases the provisioned base subtree or derives a new
//! configuration document by selectively overriding matching handler nodes.
//! Each derived document is provisioned into an independent subtree, so an
//! operator can swap one field deep inside the tree for a single client
//! group without restating the rest of the configuration.

use std::collections::HashMap;
use std::sync::Arc;

use serde_derive::Deserialize;
use serde_json::{Map, Value};

use crate::dns::protocol::DnsPacket;
use crate::module::client::{ClientClassifier, ClientGroup};
use crate::module::{
    DnsHandler, HandlerError, HandlerResult, LoadContext, Module, ModuleError, ModuleInfo,
    RequestContext, ResponseWriter,
};

pub fn module_info() -> ModuleInfo {
    ModuleInfo {
        id: "policy",
        new: || Box::new(PolicyHandler::default()),
    }
}

/// The zone manager's id gets special override treatment: its `zones` array
/// is unioned by zone name instead of replaced wholesale.
const ZONE_MANAGER_ID: &str = "dns.zone.manager";

/// Selective overrides applied for one client group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyOverride {
    #[serde(rename = "match", default)]
    pub match_rule: Option<PolicyMatch>,
    #[serde(default)]
    pub overrides: Map<String, Value>,
}

/// The condition selecting which clients a policy applies to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyMatch {
    #[serde(default)]
    pub client_group: String,
}

/// Client aware routing handler with selective configuration override.
#[derive(Default, Deserialize)]
pub struct PolicyHandler {
    #[serde(default)]
    base_handler: Value,
    #[serde(default)]
    client_groups: HashMap<String, ClientGroup>,
    #[serde(default)]
    policies: Vec<PolicyOverride>,

    #[serde(skip)]
    classifier: Option<ClientClassifier>,
    #[serde(skip)]
    base: Option<Arc<dyn Module>>,
    // client group -> handler subtree; empty-override policies alias the
    // base instance
    #[serde(skip)]
    trees: HashMap<String, Arc<dyn Module>>,
}

impl PolicyHandler {
    fn validate_configuration(&self) -> crate::module::Result<()> {
        let base = match &self.base_handler {
            Value::Null => {
                return Err(ModuleError::InvalidConfig(
                    "base_handler is required".to_string(),
                ))
            }
            Value::Object(map) => map,
            _ => {
                return Err(ModuleError::InvalidConfig(
                    "base_handler must be a JSON object".to_string(),
                ))
            }
        };

        if !base.get("handler").map(Value::is_string).unwrap_or(false) {
            return Err(ModuleError::InvalidConfig(
                "base_handler must specify a 'handler' field".to_string(),
            ));
        }

        if self.client_groups.is_empty() {
            return Err(ModuleError::InvalidConfig(
                "client_groups are required".to_string(),
            ));
        }

        let mut groups_seen: HashMap<&str, usize> = HashMap::new();
        for (index, policy) in self.policies.iter().enumerate() {
            let group = policy
                .match_rule
                .as_ref()
                .map(|m| m.client_group.as_str())
                .unwrap_or("");
            if group.is_empty() {
                return Err(ModuleError::InvalidConfig(format!(
                    "policy at index {} must specify a client_group to match",
                    index
                )));
            }

            if !self.client_groups.contains_key(group) {
                return Err(ModuleError::InvalidConfig(format!(
                    "policy at index {} references unknown client group: {}",
                    index, group
                )));
            }

            if let Some(previous) = groups_seen.insert(group, index) {
                return Err(ModuleError::InvalidConfig(format!(
                    "client group '{}' is used by multiple policies (indices {} and {})",
                    group, previous, index
                )));
            }

            for (handler_id, fragment) in &policy.overrides {
                if handler_id.is_empty() {
                    return Err(ModuleError::InvalidConfig(
                        "override handler id cannot be empty".to_string(),
                    ));
                }
                match fragment.as_object() {
                    Some(map) if !map.is_empty() => {}
                    _ => {
                        return Err(ModuleError::InvalidConfig(format!(
                            "override configuration for handler '{}' must be a non-empty JSON object",
                            handler_id
                        )))
                    }
                }
            }
        }

        Ok(())
    }

    fn load_handler_tree(
        &self,
        ctx: &LoadContext,
        fragment: &Value,
    ) -> crate::module::Result<Arc<dyn Module>> {
        let tree = ctx.load_child(fragment)?;
        if tree.as_handler().is_none() {
            let id = fragment
                .get("handler")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            return Err(ModuleError::InvalidConfig(format!(
                "module {} does not implement a DNS handler",
                id
            )));
        }
        Ok(tree)
    }
}

impl Module for PolicyHandler {
    fn hydrate(&mut self, raw: &Value) -> crate::module::Result<()> {
        *self = serde_json::from_value(raw.clone()).map_err(|e| ModuleError::Hydrate {
            id: "policy".to_string(),
            source: e,
        })?;
        Ok(())
    }

    fn provision(&mut self, ctx: &LoadContext) -> crate::module::Result<()> {
        self.validate_configuration()?;

        let classifier = ClientClassifier::compile(&self.client_groups)
            .map_err(|e| ModuleError::InvalidConfig(e.to_string()))?;
        self.classifier = Some(classifier);

        let base = self.load_handler_tree(ctx, &self.base_handler)?;
        self.base = Some(base.clone());

        for policy in &self.policies {
            let group = policy
                .match_rule
                .as_ref()
                .map(|m| m.client_group.clone())
                .unwrap_or_default();

            if policy.overrides.is_empty() {
                log::debug!(
                    "policy uses base handler (no overrides) client_group={}",
                    group
                );
                self.trees.insert(group, base.clone());
                continue;
            }

            let derived = apply_overrides(&self.base_handler, &policy.overrides);
            let tree = self.load_handler_tree(ctx, &derived)?;

            log::debug!(
                "provisioned policy override client_group={} overrides={}",
                group,
                policy.overrides.len()
            );
            self.trees.insert(group, tree);
        }

        log::info!(
            "policy handler provisioned client_groups={} policies={} policy_trees={}",
            self.client_groups.len(),
            self.policies.len(),
            self.trees.len()
        );

        Ok(())
    }

    fn cleanup(&self) -> crate::module::Result<()> {
        log::debug!("cleaning up policy handler");

        let mut failures = Vec::new();

        if let Some(base) = &self.base {
            if let Err(err) = base.cleanup() {
                log::error!("error cleaning up base handler: {}", err);
                failures.push(format!("base handler: {}", err));
            }
        }

        // Empty-override policies alias the base instance, so subtrees are
        // released at most once, deduplicated by identity.
        let mut cleaned: Vec<Arc<dyn Module>> = Vec::new();
        for (group, tree) in &self.trees {
            let is_base = self
                .base
                .as_ref()
                .map(|base| Arc::ptr_eq(base, tree))
                .unwrap_or(false);
            if is_base || cleaned.iter().any(|seen| Arc::ptr_eq(seen, tree)) {
                continue;
            }

            if let Err(err) = tree.cleanup() {
                log::error!("error cleaning up policy subtree group={}: {}", group, err);
                failures.push(format!("policy {}: {}", group, err));
            }
            cleaned.push(tree.clone());
        }

        if !failures.is_empty() {
            return Err(ModuleError::InvalidConfig(format!(
                "cleanup errors: {}",
                failures.join("; ")
            )));
        }

        Ok(())
    }

    fn as_handler(&self) -> Option<&dyn DnsHandler> {
        Some(self)
    }
}

impl DnsHandler for PolicyHandler {
    fn serve_dns(
        &self,
        ctx: &RequestContext,
        w: &mut dyn ResponseWriter,
        r: &DnsPacket,
    ) -> HandlerResult<()> {
        let classifier = self
            .classifier
            .as_ref()
            .ok_or_else(|| HandlerError::NotAHandler("policy".to_string()))?;
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| HandlerError::NotAHandler("policy".to_string()))?;

        let remote = w.remote_addr();
        let client_group = classifier.classify(remote).unwrap_or("");

        let (qname, qtype) = match r.questions.first() {
            Some(q) => (q.name.as_str(), format!("{:?}", q.qtype)),
            None => ("", String::new()),
        };

        log::debug!(
            "processing DNS query query_id={} qname={} qtype={} client_ip={} client_group={}",
            r.header.id,
            qname,
            qtype,
            remote.ip(),
            client_group
        );

        let selected = if client_group.is_empty() {
            None
        } else {
            self.trees.get(client_group)
        };

        let subtree = match selected {
            Some(tree) => {
                log::debug!(
                    "matched client to policy query_id={} client_group={}",
                    r.header.id,
                    client_group
                );
                tree
            }
            None => {
                log::debug!(
                    "using base handler (no policy match) query_id={} client_group={}",
                    r.header.id,
                    client_group
                );
                base
            }
        };

        let handler = subtree
            .as_handler()
            .ok_or_else(|| HandlerError::NotAHandler("policy subtree".to_string()))?;

        // The group tag is the contract with the zone manager downstream;
        // an empty tag means no group matched.
        let tagged_ctx = ctx.with_client_group(client_group);
        handler.serve_dns(&tagged_ctx, w, r)
    }
}

/// Apply selective overrides to a configuration document, producing the
/// derived document for one client group. The input is never mutated.
///
/// Every object node (at any depth, including inside arrays) whose string
/// `handler` field appears in the override map gets the override merged in
/// key by key. The `zones` key of the zone manager is unioned by zone name
/// instead of replaced.
fn apply_overrides(base: &Value, overrides: &Map<String, Value>) -> Value {
    let mut derived = base.clone();
    apply_to_node(&mut derived, overrides);
    derived
}

fn apply_to_node(node: &mut Value, overrides: &Map<String, Value>) {
    match node {
        Value::Object(map) => {
            let handler_id = map
                .get("handler")
                .and_then(Value::as_str)
                .map(str::to_string);

            if let Some(handler_id) = handler_id {
                if let Some(Value::Object(override_map)) = overrides.get(&handler_id) {
                    for (key, value) in override_map {
                        if key == "zones" && handler_id == ZONE_MANAGER_ID {
                            let merged = merge_zones(map.get("zones"), value);
                            map.insert(key.clone(), merged);
                        } else {
                            map.insert(key.clone(), value.clone());
                        }
                    }

                    log::debug!(
                        "applied override handler={} override_keys={}",
                        handler_id,
                        override_map.len()
                    );
                }
            }

            // overrides may themselves introduce nested handler nodes, so
            // the walk covers merged values too
            for (_, child) in map.iter_mut() {
                apply_to_node(child, overrides);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                apply_to_node(item, overrides);
            }
        }
        _ => {}
    }
}

/// Union two zone arrays by their `zone` field. Override entries replace
/// base entries with the same name; entries without a name are dropped.
fn merge_zones(base_zones: Option<&Value>, override_zones: &Value) -> Value {
    let base_list = match base_zones.and_then(Value::as_array) {
        Some(list) => list,
        None => {
            log::warn!("base zones is not an array, using override zones only");
            return override_zones.clone();
        }
    };

    let override_list = match override_zones.as_array() {
        Some(list) => list,
        None => {
            log::warn!("override zones is not an array, keeping base zones");
            return Value::Array(base_list.clone());
        }
    };

    let mut merged: Vec<(String, Value)> = Vec::new();
    for zone in base_list.iter().chain(override_list.iter()) {
        let name = zone
            .as_object()
            .and_then(|obj| obj.get("zone"))
            .and_then(Value::as_str);

        if let Some(name) = name {
            if let Some(slot) = merged.iter_mut().find(|(existing, _)| existing == name) {
                slot.1 = zone.clone();
            } else {
                merged.push((name.to_string(), zone.clone()));
            }
        }
    }

    log::debug!(
        "merged zones base_zones={} override_zones={} merged_zones={}",
        base_list.len(),
        override_list.len(),
        merged.len()
    );

    Value::Array(merged.into_iter().map(|(_, zone)| zone).collect())
}
