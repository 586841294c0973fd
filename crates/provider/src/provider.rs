//! Harvester Terraform Provider Implementation
//!
//! Implements the Terraform Plugin Protocol v6 Provider service. Schemas and
//! planning are served without a cluster; CRUD goes through the handlers
//! built once `ConfigureProvider` has run.

use std::collections::HashMap;
use std::sync::Arc;

use harvester_common::constants::RESOURCE_TYPE_BOOTSTRAP;
use harvester_common::Error;
use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::client::HarvesterClient;
use crate::config::{self, ProviderConfig};
use crate::diagnostics;
use crate::resources::bootstrap::BootstrapResource;
use crate::resources::{
    self, data_source_schema, resource_schema, Resource, DATA_SOURCE_TYPES, RESOURCE_TYPES,
};
use crate::schema::Schema;
use crate::state::{decode_dynamic_value, decode_json, encode_dynamic_value, Value};
use crate::tfplugin6::provider_server::Provider;
use crate::tfplugin6::*;

/// Builds the handler for a resource type against a configured cluster
type Handlers = Arc<dyn Fn(&str) -> Option<Box<dyn Resource>> + Send + Sync>;

/// What `ConfigureProvider` left behind
#[derive(Clone)]
enum Mode {
    /// `bootstrap = true`: only `harvester_bootstrap` is usable
    Bootstrap,
    Cluster(Handlers),
}

/// Harvester Terraform Provider
pub struct HarvesterProvider {
    mode: Arc<RwLock<Option<Mode>>>,
}

impl Default for HarvesterProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HarvesterProvider {
    pub fn new() -> Self {
        Self {
            mode: Arc::new(RwLock::new(None)),
        }
    }

    #[cfg(test)]
    fn with_handlers(handlers: Handlers) -> Self {
        Self {
            mode: Arc::new(RwLock::new(Some(Mode::Cluster(handlers)))),
        }
    }

    /// The handler for `type_name`, or the diagnostic explaining why the
    /// type cannot be used in the current mode.
    async fn handler(&self, type_name: &str) -> Result<Box<dyn Resource>, Diagnostic> {
        let mode = self.mode.read().await.clone();
        match (mode, type_name) {
            (None, _) => Err(diagnostics::error(
                "Provider not configured",
                "ConfigureProvider must run before resources can be managed",
            )),
            (Some(Mode::Bootstrap), RESOURCE_TYPE_BOOTSTRAP) => Ok(Box::new(BootstrapResource)),
            (Some(Mode::Bootstrap), _) => Err(diagnostics::error(
                format!("{} is not available in bootstrap mode", type_name),
                format!(
                    "Only {} can be used when the provider sets bootstrap = true",
                    RESOURCE_TYPE_BOOTSTRAP
                ),
            )),
            (Some(Mode::Cluster(_)), RESOURCE_TYPE_BOOTSTRAP) => Err(diagnostics::error(
                format!("{} requires bootstrap mode", RESOURCE_TYPE_BOOTSTRAP),
                "Set bootstrap = true in the provider block to bootstrap a new cluster",
            )),
            (Some(Mode::Cluster(handlers)), _) => {
                handlers(type_name).ok_or_else(|| unknown_type(type_name))
            }
        }
    }
}

fn cluster_handlers(client: HarvesterClient) -> Handlers {
    Arc::new(move |type_name: &str| resources::resource_for(type_name, &client))
}

fn unknown_type(type_name: &str) -> Diagnostic {
    diagnostics::error(
        format!("Unknown resource type: {}", type_name),
        "This provider does not implement the requested type",
    )
}

fn failed(summary: &str, err: &Error) -> Diagnostic {
    error!("{}: {}", summary, err);
    diagnostics::error(summary, err.to_string())
}

fn decode(value: Option<&DynamicValue>) -> Result<Value, Status> {
    decode_dynamic_value(value)
        .map_err(|e| Error::Validation(format!("failed to decode value: {}", e)).into())
}

fn encode(value: &Value) -> Result<DynamicValue, Status> {
    encode_dynamic_value(value)
        .map_err(|e| Error::Internal(format!("failed to encode value: {}", e)).into())
}

/// Shape a handler result to the schema before it goes back to Terraform
fn shaped(schema: &Schema, value: Value) -> Value {
    schema.block.normalize(&value.unknowns_to_null())
}

fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        plan_destroy: true,
        get_provider_schema_optional: false,
    }
}

#[tonic::async_trait]
impl Provider for HarvesterProvider {
    async fn get_metadata(
        &self,
        _request: Request<get_metadata::Request>,
    ) -> Result<Response<get_metadata::Response>, Status> {
        debug!("GetMetadata called");
        Ok(Response::new(get_metadata::Response {
            server_capabilities: Some(server_capabilities()),
            diagnostics: vec![],
            data_sources: DATA_SOURCE_TYPES
                .iter()
                .map(|t| get_metadata::DataSourceMetadata {
                    type_name: t.to_string(),
                })
                .collect(),
            resources: RESOURCE_TYPES
                .iter()
                .map(|t| get_metadata::ResourceMetadata {
                    type_name: t.to_string(),
                })
                .collect(),
        }))
    }

    async fn get_provider_schema(
        &self,
        _request: Request<get_provider_schema::Request>,
    ) -> Result<Response<get_provider_schema::Response>, Status> {
        info!("GetProviderSchema called");

        let resource_schemas: HashMap<String, crate::tfplugin6::Schema> = RESOURCE_TYPES
            .iter()
            .filter_map(|t| resource_schema(t).map(|s| (t.to_string(), s.to_proto())))
            .collect();
        let data_source_schemas: HashMap<String, crate::tfplugin6::Schema> = DATA_SOURCE_TYPES
            .iter()
            .filter_map(|t| data_source_schema(t).map(|s| (t.to_string(), s.to_proto())))
            .collect();

        Ok(Response::new(get_provider_schema::Response {
            provider: Some(config::schema().to_proto()),
            resource_schemas,
            data_source_schemas,
            diagnostics: vec![],
            provider_meta: None,
            server_capabilities: Some(server_capabilities()),
        }))
    }

    async fn validate_provider_config(
        &self,
        request: Request<validate_provider_config::Request>,
    ) -> Result<Response<validate_provider_config::Response>, Status> {
        debug!("ValidateProviderConfig called");
        let config = decode(request.get_ref().config.as_ref())?;
        Ok(Response::new(validate_provider_config::Response {
            diagnostics: config::schema().block.validate(&config),
        }))
    }

    async fn validate_resource_config(
        &self,
        request: Request<validate_resource_config::Request>,
    ) -> Result<Response<validate_resource_config::Response>, Status> {
        let req = request.into_inner();
        debug!("ValidateResourceConfig called for {}", req.type_name);

        let diagnostics = match resource_schema(&req.type_name) {
            Some(schema) => schema.block.validate(&decode(req.config.as_ref())?),
            None => vec![unknown_type(&req.type_name)],
        };
        Ok(Response::new(validate_resource_config::Response { diagnostics }))
    }

    async fn validate_data_resource_config(
        &self,
        request: Request<validate_data_resource_config::Request>,
    ) -> Result<Response<validate_data_resource_config::Response>, Status> {
        let req = request.into_inner();
        debug!("ValidateDataResourceConfig called for {}", req.type_name);

        let diagnostics = match data_source_schema(&req.type_name) {
            Some(schema) => schema.block.validate(&decode(req.config.as_ref())?),
            None => vec![unknown_type(&req.type_name)],
        };
        Ok(Response::new(validate_data_resource_config::Response { diagnostics }))
    }

    async fn upgrade_resource_state(
        &self,
        request: Request<upgrade_resource_state::Request>,
    ) -> Result<Response<upgrade_resource_state::Response>, Status> {
        let req = request.into_inner();
        debug!(
            "UpgradeResourceState called for {} at version {}",
            req.type_name, req.version
        );

        let Some(schema) = resource_schema(&req.type_name) else {
            return Ok(Response::new(upgrade_resource_state::Response {
                upgraded_state: None,
                diagnostics: vec![unknown_type(&req.type_name)],
            }));
        };

        // Every schema is still at version 0, so upgrading only reshapes the
        // stored JSON: attributes added since get null, removed ones drop.
        let raw = req.raw_state.map(|r| r.json).unwrap_or_default();
        let prior = decode_json(&raw).map_err(|e| {
            Status::from(Error::Validation(format!("failed to decode state: {}", e)))
        })?;
        let upgraded = if prior.is_null() {
            Value::Null
        } else {
            schema.block.normalize(&prior)
        };

        Ok(Response::new(upgrade_resource_state::Response {
            upgraded_state: Some(encode(&upgraded)?),
            diagnostics: vec![],
        }))
    }

    async fn configure_provider(
        &self,
        request: Request<configure_provider::Request>,
    ) -> Result<Response<configure_provider::Response>, Status> {
        let req = request.into_inner();
        info!(
            "ConfigureProvider called by Terraform {}",
            req.terraform_version
        );

        let value = decode(req.config.as_ref())?;
        let config = match ProviderConfig::from_value(&value) {
            Ok(config) => config,
            Err(e) => {
                return Ok(Response::new(configure_provider::Response {
                    diagnostics: vec![failed("Invalid provider configuration", &e)],
                }))
            }
        };

        if config.is_bootstrap() {
            info!("Provider running in bootstrap mode");
            *self.mode.write().await = Some(Mode::Bootstrap);
            return Ok(Response::new(configure_provider::Response {
                diagnostics: vec![],
            }));
        }

        let connected = match config.resolve_kubeconfig() {
            Ok(path) => {
                info!("Loading kubeconfig from {}", path.display());
                HarvesterClient::from_kubeconfig(&path, config.context()).await
            }
            Err(e) => Err(e),
        };
        match connected {
            Ok(client) => {
                *self.mode.write().await = Some(Mode::Cluster(cluster_handlers(client)));
                info!("Connected to Harvester cluster");
                Ok(Response::new(configure_provider::Response {
                    diagnostics: vec![],
                }))
            }
            Err(e) => Ok(Response::new(configure_provider::Response {
                diagnostics: vec![failed("Failed to connect to Harvester", &e)],
            })),
        }
    }

    async fn read_resource(
        &self,
        request: Request<read_resource::Request>,
    ) -> Result<Response<read_resource::Response>, Status> {
        let req = request.into_inner();
        debug!("ReadResource called for {}", req.type_name);

        let current = decode(req.current_state.as_ref())?;
        let respond = |new_state: Option<DynamicValue>,
                       diagnostics: Vec<Diagnostic>|
         -> Result<Response<read_resource::Response>, Status> {
            Ok(Response::new(read_resource::Response {
                new_state,
                diagnostics,
                private: req.private.clone(),
            }))
        };

        let handler = self.handler(&req.type_name).await;
        let (schema, handler) = match (resource_schema(&req.type_name), handler) {
            (Some(schema), Ok(handler)) => (schema, handler),
            (None, _) => {
                return respond(req.current_state.clone(), vec![unknown_type(&req.type_name)])
            }
            (_, Err(diag)) => return respond(req.current_state.clone(), vec![diag]),
        };

        match handler.read(&current).await {
            Ok(Some(state)) => respond(Some(encode(&shaped(&schema, state))?), vec![]),
            Ok(None) => {
                info!("{} no longer exists, removing from state", req.type_name);
                respond(Some(encode(&Value::Null)?), vec![])
            }
            Err(e) if e.is_not_found() => {
                info!("{} not found ({}), removing from state", req.type_name, e);
                respond(Some(encode(&Value::Null)?), vec![])
            }
            Err(e) => respond(
                req.current_state.clone(),
                vec![failed(&format!("Failed to read {}", req.type_name), &e)],
            ),
        }
    }

    async fn plan_resource_change(
        &self,
        request: Request<plan_resource_change::Request>,
    ) -> Result<Response<plan_resource_change::Response>, Status> {
        let req = request.into_inner();
        debug!("PlanResourceChange called for {}", req.type_name);

        let respond = |planned_state: Option<DynamicValue>,
                       requires_replace: Vec<AttributePath>,
                       diagnostics: Vec<Diagnostic>|
         -> Result<Response<plan_resource_change::Response>, Status> {
            Ok(Response::new(plan_resource_change::Response {
                planned_state,
                requires_replace,
                planned_private: req.prior_private.clone(),
                diagnostics,
                legacy_type_system: true,
            }))
        };

        let Some(schema) = resource_schema(&req.type_name) else {
            return respond(None, vec![], vec![unknown_type(&req.type_name)]);
        };
        // Catch a type used in the wrong mode at plan time rather than apply.
        if self.mode.read().await.is_some() {
            if let Err(diag) = self.handler(&req.type_name).await {
                return respond(None, vec![], vec![diag]);
            }
        }

        let prior = decode(req.prior_state.as_ref())?;
        let proposed = decode(req.proposed_new_state.as_ref())?;
        let (planned, requires_replace) = schema.block.plan(&prior, &proposed);
        respond(Some(encode(&planned)?), requires_replace, vec![])
    }

    async fn apply_resource_change(
        &self,
        request: Request<apply_resource_change::Request>,
    ) -> Result<Response<apply_resource_change::Response>, Status> {
        let req = request.into_inner();
        info!("ApplyResourceChange called for {}", req.type_name);

        let respond = |new_state: Option<DynamicValue>,
                       diagnostics: Vec<Diagnostic>|
         -> Result<Response<apply_resource_change::Response>, Status> {
            Ok(Response::new(apply_resource_change::Response {
                new_state,
                private: req.planned_private.clone(),
                diagnostics,
                legacy_type_system: true,
            }))
        };

        let handler = self.handler(&req.type_name).await;
        let (schema, handler) = match (resource_schema(&req.type_name), handler) {
            (Some(schema), Ok(handler)) => (schema, handler),
            (None, _) => {
                return respond(req.prior_state.clone(), vec![unknown_type(&req.type_name)])
            }
            (_, Err(diag)) => return respond(req.prior_state.clone(), vec![diag]),
        };

        let prior = decode(req.prior_state.as_ref())?;
        let planned = decode(req.planned_state.as_ref())?;

        match (prior.is_null(), planned.is_null()) {
            (true, true) => respond(Some(encode(&Value::Null)?), vec![]),
            (true, false) => match handler.create(&planned).await {
                Ok(state) => respond(Some(encode(&shaped(&schema, state))?), vec![]),
                Err(e) => respond(
                    None,
                    vec![failed(&format!("Failed to create {}", req.type_name), &e)],
                ),
            },
            (false, true) => match handler.delete(&prior).await {
                Ok(()) => respond(Some(encode(&Value::Null)?), vec![]),
                Err(e) if e.is_not_found() => {
                    warn!("{} already gone: {}", req.type_name, e);
                    respond(Some(encode(&Value::Null)?), vec![])
                }
                Err(e) => respond(
                    req.prior_state.clone(),
                    vec![failed(&format!("Failed to delete {}", req.type_name), &e)],
                ),
            },
            (false, false) => match handler.update(&prior, &planned).await {
                Ok(state) => respond(Some(encode(&shaped(&schema, state))?), vec![]),
                Err(e) => respond(
                    req.prior_state.clone(),
                    vec![failed(&format!("Failed to update {}", req.type_name), &e)],
                ),
            },
        }
    }

    async fn import_resource_state(
        &self,
        request: Request<import_resource_state::Request>,
    ) -> Result<Response<import_resource_state::Response>, Status> {
        let req = request.into_inner();
        info!("ImportResourceState called for {} with ID {}", req.type_name, req.id);

        let respond = |imported_resources: Vec<import_resource_state::ImportedResource>,
                       diagnostics: Vec<Diagnostic>|
         -> Result<Response<import_resource_state::Response>, Status> {
            Ok(Response::new(import_resource_state::Response {
                imported_resources,
                diagnostics,
            }))
        };

        let handler = self.handler(&req.type_name).await;
        let (schema, handler) = match (resource_schema(&req.type_name), handler) {
            (Some(schema), Ok(handler)) => (schema, handler),
            (None, _) => return respond(vec![], vec![unknown_type(&req.type_name)]),
            (_, Err(diag)) => return respond(vec![], vec![diag]),
        };

        match handler.import(&req.id).await {
            Ok(Some(state)) => respond(
                vec![import_resource_state::ImportedResource {
                    type_name: req.type_name.clone(),
                    state: Some(encode(&shaped(&schema, state))?),
                    private: vec![],
                }],
                vec![],
            ),
            Ok(None) => respond(
                vec![],
                vec![diagnostics::error(
                    "Cannot import non-existent remote object",
                    format!("{} {} does not exist", req.type_name, req.id),
                )],
            ),
            Err(e) => respond(
                vec![],
                vec![failed(&format!("Failed to import {}", req.type_name), &e)],
            ),
        }
    }

    async fn read_data_source(
        &self,
        request: Request<read_data_source::Request>,
    ) -> Result<Response<read_data_source::Response>, Status> {
        let req = request.into_inner();
        debug!("ReadDataSource called for {}", req.type_name);

        let respond = |state: Option<DynamicValue>,
                       diagnostics: Vec<Diagnostic>|
         -> Result<Response<read_data_source::Response>, Status> {
            Ok(Response::new(read_data_source::Response { state, diagnostics }))
        };

        let handler = self.handler(&req.type_name).await;
        let (schema, handler) = match (data_source_schema(&req.type_name), handler) {
            (Some(schema), Ok(handler)) => (schema, handler),
            (None, _) => return respond(None, vec![unknown_type(&req.type_name)]),
            (_, Err(diag)) => return respond(None, vec![diag]),
        };

        let config = decode(req.config.as_ref())?;
        let result =
            resources::read_data_source(handler.as_ref(), &req.type_name, &schema, &config).await;
        match result {
            Ok(state) => respond(Some(encode(&shaped(&schema, state))?), vec![]),
            Err(e) => respond(
                None,
                vec![failed(&format!("Failed to read data source {}", req.type_name), &e)],
            ),
        }
    }

    async fn stop_provider(
        &self,
        _request: Request<stop_provider::Request>,
    ) -> Result<Response<stop_provider::Response>, Status> {
        warn!("StopProvider called, in-flight operations run to completion");
        Ok(Response::new(stop_provider::Response {
            error: String::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use crate::resources::keypair::KeyPairResource;
    use crate::state::{bool_value, get_string_attr, make_state, string_value};
    use harvester_common::api::keypair::{KeyPair, KeyPairStatus};
    use harvester_common::constants::{RESOURCE_TYPE_IMAGE, RESOURCE_TYPE_SSH_KEY, STATE_ACTIVE};

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBs5 alice@laptop";

    fn keypair_provider() -> (HarvesterProvider, Arc<MemoryApi<KeyPair>>) {
        let api = MemoryApi::<KeyPair>::new()
            .on_write(|kp| {
                kp.status = Some(KeyPairStatus {
                    finger_print: "2e:52:9b".into(),
                    conditions: vec![],
                });
            })
            .arc();
        let handle = api.clone();
        let provider = HarvesterProvider::with_handlers(Arc::new(move |type_name: &str| {
            match type_name {
                RESOURCE_TYPE_SSH_KEY => {
                    Some(Box::new(KeyPairResource::new(handle.clone())) as Box<dyn Resource>)
                }
                _ => None,
            }
        }));
        (provider, api)
    }

    fn dv(value: &Value) -> Option<DynamicValue> {
        Some(encode_dynamic_value(value).unwrap())
    }

    fn undv(value: Option<DynamicValue>) -> Value {
        decode_dynamic_value(value.as_ref()).unwrap()
    }

    fn keypair_config() -> Value {
        make_state(vec![
            ("name", string_value("alice")),
            ("public_key", string_value(KEY)),
        ])
    }

    async fn plan(
        provider: &HarvesterProvider,
        prior: &Value,
        config: &Value,
    ) -> plan_resource_change::Response {
        provider
            .plan_resource_change(Request::new(plan_resource_change::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                prior_state: dv(prior),
                proposed_new_state: dv(config),
                config: dv(config),
                prior_private: vec![],
                provider_meta: None,
            }))
            .await
            .unwrap()
            .into_inner()
    }

    async fn apply(
        provider: &HarvesterProvider,
        prior: &Value,
        planned: &Value,
    ) -> apply_resource_change::Response {
        provider
            .apply_resource_change(Request::new(apply_resource_change::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                prior_state: dv(prior),
                planned_state: dv(planned),
                config: dv(planned),
                planned_private: vec![],
                provider_meta: None,
            }))
            .await
            .unwrap()
            .into_inner()
    }

    async fn read(provider: &HarvesterProvider, state: &Value) -> read_resource::Response {
        provider
            .read_resource(Request::new(read_resource::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                current_state: dv(state),
                private: vec![],
                provider_meta: None,
            }))
            .await
            .unwrap()
            .into_inner()
    }

    #[tokio::test]
    async fn test_schema_lists_every_type() {
        let provider = HarvesterProvider::new();
        let schema = provider
            .get_provider_schema(Request::new(get_provider_schema::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(schema.resource_schemas.len(), RESOURCE_TYPES.len());
        assert_eq!(schema.data_source_schemas.len(), DATA_SOURCE_TYPES.len());
        assert!(schema.resource_schemas.contains_key(RESOURCE_TYPE_BOOTSTRAP));
        assert!(!schema.data_source_schemas.contains_key(RESOURCE_TYPE_BOOTSTRAP));

        let attrs = schema.provider.unwrap().block.unwrap().attributes;
        let names: Vec<&str> = attrs.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["kubeconfig", "kubecontext", "bootstrap"]);

        let metadata = provider
            .get_metadata(Request::new(get_metadata::Request {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(metadata.resources.len(), RESOURCE_TYPES.len());
        assert!(metadata.server_capabilities.unwrap().plan_destroy);
    }

    #[tokio::test]
    async fn test_validate_reports_missing_arguments() {
        let provider = HarvesterProvider::new();
        let resp = provider
            .validate_resource_config(Request::new(validate_resource_config::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                config: dv(&make_state(vec![("name", string_value("alice"))])),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(diagnostics::has_errors(&resp.diagnostics));
        assert_eq!(resp.diagnostics[0].summary, "Missing required argument");

        let resp = provider
            .validate_resource_config(Request::new(validate_resource_config::Request {
                type_name: "harvester_unknown".into(),
                config: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(diagnostics::has_errors(&resp.diagnostics));
    }

    #[tokio::test]
    async fn test_malformed_values_are_invalid_arguments() {
        let provider = HarvesterProvider::new();
        let status = provider
            .validate_resource_config(Request::new(validate_resource_config::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                config: Some(DynamicValue {
                    msgpack: vec![0xc1],
                    json: vec![],
                }),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("failed to decode value"));

        let status = provider
            .upgrade_resource_state(Request::new(upgrade_resource_state::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                version: 0,
                raw_state: Some(RawState {
                    json: b"{not json".to_vec(),
                    flatmap: HashMap::new(),
                }),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_plan_create_marks_computed_unknown() {
        let provider = HarvesterProvider::new();
        let resp = plan(&provider, &Value::Null, &keypair_config()).await;
        assert!(resp.diagnostics.is_empty());
        assert!(resp.legacy_type_system);
        let planned = undv(resp.planned_state);
        assert_eq!(planned.get("id"), Some(&Value::Unknown));
        assert_eq!(get_string_attr(&planned, "namespace"), "default");
    }

    #[tokio::test]
    async fn test_unconfigured_apply_fails() {
        let provider = HarvesterProvider::new();
        let resp = apply(&provider, &Value::Null, &keypair_config()).await;
        assert!(diagnostics::has_errors(&resp.diagnostics));
        assert_eq!(resp.diagnostics[0].summary, "Provider not configured");
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (provider, api) = keypair_provider();

        let planned = undv(plan(&provider, &Value::Null, &keypair_config()).await.planned_state);
        let resp = apply(&provider, &Value::Null, &planned).await;
        assert!(resp.diagnostics.is_empty(), "{:?}", resp.diagnostics);
        let state = undv(resp.new_state);
        assert_eq!(get_string_attr(&state, "id"), "default/alice");
        assert_eq!(get_string_attr(&state, "fingerprint"), "2e:52:9b");
        assert_eq!(get_string_attr(&state, "state"), STATE_ACTIVE);
        assert!(api.stored("default", "alice").is_some());

        // Nothing changed, so the plan is the state itself.
        let replan = plan(&provider, &state, &state).await;
        assert!(replan.requires_replace.is_empty());
        assert_eq!(undv(replan.planned_state), state);

        let resp = read(&provider, &state).await;
        assert_eq!(undv(resp.new_state), state);

        // Renaming forces replacement.
        let mut renamed = state.clone();
        renamed.set("name", string_value("bob"));
        let replan = plan(&provider, &state, &renamed).await;
        assert_eq!(replan.requires_replace.len(), 1);

        let resp = apply(&provider, &state, &Value::Null).await;
        assert!(resp.diagnostics.is_empty());
        assert!(undv(resp.new_state).is_null());
        assert_eq!(api.len(), 0);

        // Gone from the cluster: read drops it from state.
        let resp = read(&provider, &state).await;
        assert!(resp.diagnostics.is_empty());
        assert!(undv(resp.new_state).is_null());
    }

    #[tokio::test]
    async fn test_import_and_data_source() {
        let (provider, _api) = keypair_provider();
        let planned = undv(plan(&provider, &Value::Null, &keypair_config()).await.planned_state);
        apply(&provider, &Value::Null, &planned).await;

        let resp = provider
            .import_resource_state(Request::new(import_resource_state::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                id: "default/alice".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.diagnostics.is_empty());
        let imported = undv(resp.imported_resources[0].state.clone());
        assert_eq!(get_string_attr(&imported, "public_key"), KEY);

        let resp = provider
            .import_resource_state(Request::new(import_resource_state::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                id: "default/nobody".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.imported_resources.is_empty());
        assert_eq!(resp.diagnostics[0].summary, "Cannot import non-existent remote object");

        let resp = provider
            .read_data_source(Request::new(read_data_source::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                config: dv(&make_state(vec![("name", string_value("alice"))])),
                provider_meta: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.diagnostics.is_empty());
        let state = undv(resp.state);
        assert_eq!(get_string_attr(&state, "fingerprint"), "2e:52:9b");

        let resp = provider
            .read_data_source(Request::new(read_data_source::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                config: dv(&make_state(vec![("name", string_value("nobody"))])),
                provider_meta: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(diagnostics::has_errors(&resp.diagnostics));
    }

    #[tokio::test]
    async fn test_bootstrap_mode_gates_types() {
        let provider = HarvesterProvider::new();
        let resp = provider
            .configure_provider(Request::new(configure_provider::Request {
                terraform_version: "1.7.0".into(),
                config: dv(&make_state(vec![("bootstrap", bool_value(true))])),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.diagnostics.is_empty());

        let resp = provider
            .plan_resource_change(Request::new(plan_resource_change::Request {
                type_name: RESOURCE_TYPE_IMAGE.into(),
                prior_state: dv(&Value::Null),
                proposed_new_state: dv(&make_state(vec![("name", string_value("ubuntu"))])),
                config: None,
                prior_private: vec![],
                provider_meta: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(diagnostics::has_errors(&resp.diagnostics));
        assert!(resp.diagnostics[0].summary.contains("bootstrap mode"));

        assert!(provider.handler(RESOURCE_TYPE_BOOTSTRAP).await.is_ok());
    }

    #[tokio::test]
    async fn test_cluster_mode_rejects_bootstrap() {
        let (provider, _api) = keypair_provider();
        let err = provider.handler(RESOURCE_TYPE_BOOTSTRAP).await.err().unwrap();
        assert!(err.summary.contains("requires bootstrap mode"));
        assert!(provider.handler(RESOURCE_TYPE_IMAGE).await.is_err());
    }

    #[tokio::test]
    async fn test_upgrade_reshapes_json_state() {
        let provider = HarvesterProvider::new();
        let raw = serde_json::json!({
            "id": "default/alice",
            "name": "alice",
            "public_key": KEY,
            "retired_field": true,
        });
        let resp = provider
            .upgrade_resource_state(Request::new(upgrade_resource_state::Request {
                type_name: RESOURCE_TYPE_SSH_KEY.into(),
                version: 0,
                raw_state: Some(RawState {
                    json: serde_json::to_vec(&raw).unwrap(),
                    flatmap: HashMap::new(),
                }),
            }))
            .await
            .unwrap()
            .into_inner();
        let upgraded = undv(resp.upgraded_state);
        assert!(upgraded.get("retired_field").is_none());
        assert_eq!(upgraded.get("fingerprint"), Some(&Value::Null));
        assert_eq!(get_string_attr(&upgraded, "name"), "alice");
    }
}
