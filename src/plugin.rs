//! Network-type plugins.
//!
//! The driver knows nothing about what runs inside the nodes. Once the
//! containers are up it hands a [`BuildContext`] to the [`NetworkBuilder`]
//! registered for the request's network type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::Value;

use crate::context::BuildContext;
use crate::distribute;
use crate::error::{Error, Result};
use crate::state::Key;
use crate::types::ServiceSpec;

#[async_trait]
pub trait NetworkBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// Sets up a freshly provisioned network. Returns one label per new node.
    async fn build(&self, ctx: &Arc<BuildContext>) -> Result<Vec<String>>;

    /// Joins `ctx.new_nodes` to a running network.
    async fn add(&self, ctx: &Arc<BuildContext>) -> Result<Vec<String>> {
        self.build(ctx).await
    }

    /// Build-wide helpers started on the coordinator before `build`.
    fn services(&self) -> Vec<ServiceSpec> {
        Vec::new()
    }

    /// Schema of the parameters the builder understands.
    fn params(&self) -> Value {
        Value::Object(Default::default())
    }

    fn defaults(&self) -> Value {
        Value::Object(Default::default())
    }
}

/// Overlays the top-level keys of `params` onto `defaults`.
pub fn merge_params(defaults: &Value, params: &Value) -> Value {
    match (defaults, params) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => defaults.clone(),
        _ => params.clone(),
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid network type name {:?}",
            name
        )))
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    builders: HashMap<String, Arc<dyn NetworkBuilder>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in builders.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.builders.insert(GENERIC.into(), Arc::new(GenericBuilder));
        registry
    }

    pub fn register(&mut self, builder: Arc<dyn NetworkBuilder>) -> Result<()> {
        let name = builder.name().to_string();
        validate_name(&name)?;
        if self.builders.contains_key(&name) {
            return Err(Error::validation(format!(
                "network type {} is already registered",
                name
            )));
        }
        self.builders.insert(name, builder);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn NetworkBuilder>> {
        validate_name(name)?;
        self.builders
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownNetworkType(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builders.keys().cloned().collect();
        names.sort();
        names
    }
}

pub const GENERIC: &str = "generic";

/// Where the generic builder puts the request parameters inside each node.
pub const PARAMS_PATH: &str = "/etc/shipyard/params.json";

/// Parameters the generic builder distributed, kept for later add-nodes
/// sessions.
pub const GENERIC_PARAMS: Key<Value> = Key::new("generic.params");

/// Ships the request parameters to every node and does nothing else.
pub struct GenericBuilder;

impl GenericBuilder {
    async fn distribute(&self, ctx: &Arc<BuildContext>, params: &Value) -> Result<Vec<String>> {
        let shared = Arc::clone(ctx);
        ctx.fanout
            .for_each_node(&ctx.state, "prepare config dir", &ctx.new_nodes, move |node| {
                let ctx = Arc::clone(&shared);
                async move {
                    let client = ctx.client(node.server)?;
                    client
                        .container_exec(&node.name, "mkdir -p /etc/shipyard")
                        .await
                        .map(|_| ())
                }
            })
            .await?;

        let bytes = serde_json::to_vec_pretty(params)?;
        distribute::copy_bytes_to_all_nodes(ctx, "params.json", &bytes, PARAMS_PATH).await?;
        info!(
            "distributed parameters to {} nodes",
            ctx.new_nodes.len()
        );
        Ok(ctx.new_nodes.iter().map(|n| n.name.clone()).collect())
    }
}

#[async_trait]
impl NetworkBuilder for GenericBuilder {
    fn name(&self) -> &str {
        GENERIC
    }

    async fn build(&self, ctx: &Arc<BuildContext>) -> Result<Vec<String>> {
        let params = merge_params(&self.defaults(), &ctx.details.params);
        let labels = self.distribute(ctx, &params).await?;
        ctx.state.put(&GENERIC_PARAMS, params);
        Ok(labels)
    }

    /// New nodes get what the original build distributed, when known.
    async fn add(&self, ctx: &Arc<BuildContext>) -> Result<Vec<String>> {
        let params = match ctx.state.fetch(&GENERIC_PARAMS) {
            Some(params) => params,
            None => merge_params(&self.defaults(), &ctx.details.params),
        };
        let labels = self.distribute(ctx, &params).await?;
        ctx.state.put(&GENERIC_PARAMS, params);
        Ok(labels)
    }
}
