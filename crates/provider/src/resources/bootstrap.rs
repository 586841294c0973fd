//! harvester_bootstrap: first login to a fresh Harvester installation
//!
//! Logs in as `admin`, optionally replaces the initial password, and writes
//! a kubeconfig generated by the cluster to `kubeconfig_path`. Nothing in
//! the cluster is created, so destroy only forgets the resource.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use harvester_common::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::Resource;
use crate::config::expand_home;
use crate::schema::{Attribute, Block, Schema};
use crate::state::{bool_value, get_bool_attr, get_string_attr, make_state, string_value, Value};
use crate::validators;

pub const DEFAULT_INITIAL_PASSWORD: &str = "admin";
pub const DEFAULT_KUBECONFIG_PATH: &str = "~/.kube/harvester.yaml";
const ADMIN_USER: &str = "admin";

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attribute(Attribute::string("id").computed())
            .attribute(
                Attribute::string("api_url")
                    .required()
                    .force_new()
                    .validate(validators::not_empty())
                    .description("Harvester API URL, such as https://192.168.0.131"),
            )
            .attribute(
                Attribute::string("initial_password")
                    .default(string_value(DEFAULT_INITIAL_PASSWORD))
                    .sensitive()
                    .force_new(),
            )
            .attribute(
                Attribute::string("password")
                    .required()
                    .sensitive()
                    .force_new()
                    .validate(validators::not_empty()),
            )
            .attribute(
                Attribute::string("kubeconfig_path")
                    .default(string_value(DEFAULT_KUBECONFIG_PATH))
                    .force_new(),
            )
            .attribute(
                Attribute::bool("should_update_password")
                    .default(bool_value(true))
                    .force_new()
                    .description(
                        "Change the initial password to `password` before generating the \
                         kubeconfig",
                    ),
            ),
    )
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct KubeconfigResponse {
    config: String,
}

/// Minimal client for Harvester's embedded Rancher API
pub struct BootstrapClient {
    http: reqwest::Client,
    api_url: String,
}

impl BootstrapClient {
    /// Harvester serves a self-signed certificate until one is configured.
    pub fn new(api_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(
        &self,
        path: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_url, path);
        debug!("POST {}", url);
        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("{}: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("{} returned {}: {}", url, status, text)));
        }
        Ok(response)
    }

    /// Log in as admin and return an API token
    pub async fn login(&self, password: &str) -> Result<String> {
        let response = self
            .post(
                "/v3-public/localProviders/local?action=login",
                None,
                json!({
                    "username": ADMIN_USER,
                    "password": password,
                    "responseType": "json",
                }),
            )
            .await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid login response: {}", e)))?;
        Ok(login.token)
    }

    pub async fn change_password(&self, token: &str, current: &str, new: &str) -> Result<()> {
        self.post(
            "/v3/users?action=changepassword",
            Some(token),
            json!({
                "currentPassword": current,
                "newPassword": new,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn generate_kubeconfig(&self, token: &str) -> Result<String> {
        let response = self
            .post(
                "/v1/management.cattle.io.clusters/local?action=generateKubeconfig",
                Some(token),
                json!({}),
            )
            .await?;
        let kubeconfig: KubeconfigResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("invalid kubeconfig response: {}", e)))?;
        Ok(kubeconfig.config)
    }
}

/// Write the kubeconfig readable by its owner only.
pub fn write_kubeconfig(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn state(planned: &Value) -> Value {
    let mut state = planned.clone();
    state.set("id", string_value(get_string_attr(planned, "api_url")));
    state
}

pub struct BootstrapResource;

#[async_trait]
impl Resource for BootstrapResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let api_url = get_string_attr(planned, "api_url");
        let password = get_string_attr(planned, "password");
        let initial = match get_string_attr(planned, "initial_password") {
            p if p.is_empty() => DEFAULT_INITIAL_PASSWORD.to_string(),
            p => p,
        };
        info!("Bootstrapping Harvester at {}", api_url);

        let client = BootstrapClient::new(&api_url)?;
        let token = if get_bool_attr(planned, "should_update_password", true) {
            let token = client.login(&initial).await?;
            client.change_password(&token, &initial, &password).await?;
            info!("Changed the initial admin password");
            token
        } else {
            client.login(&password).await?
        };

        let kubeconfig = client.generate_kubeconfig(&token).await?;
        let path = match get_string_attr(planned, "kubeconfig_path") {
            p if p.is_empty() => DEFAULT_KUBECONFIG_PATH.to_string(),
            p => p,
        };
        let path = expand_home(&path)?;
        write_kubeconfig(&path, &kubeconfig)?;
        info!("Wrote kubeconfig to {}", path.display());
        Ok(state(planned))
    }

    /// Gone once the kubeconfig file is; apply then bootstraps again.
    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let path = expand_home(&get_string_attr(state, "kubeconfig_path"))?;
        if path.exists() {
            Ok(Some(state.clone()))
        } else {
            Ok(None)
        }
    }

    async fn update(&self, _prior: &Value, planned: &Value) -> Result<Value> {
        Ok(state(planned))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        info!(
            "Forgetting bootstrap of {}",
            get_string_attr(prior, "api_url")
        );
        Ok(())
    }

    async fn import(&self, id: &str) -> Result<Option<Value>> {
        Err(Error::Validation(format!(
            "harvester_bootstrap {} cannot be imported",
            id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    struct Fake {
        login_status: StatusCode,
        seen: Seen,
    }

    async fn login(State(fake): State<Arc<Fake>>, uri: Uri, body: String) -> impl IntoResponse {
        fake.seen.lock().push((uri.to_string(), body));
        (fake.login_status, Json(json!({"token": "token-abc"})))
    }

    async fn change_password(
        State(fake): State<Arc<Fake>>,
        uri: Uri,
        body: String,
    ) -> impl IntoResponse {
        fake.seen.lock().push((uri.to_string(), body));
        Json(json!({}))
    }

    async fn generate_kubeconfig(
        State(fake): State<Arc<Fake>>,
        uri: Uri,
        body: String,
    ) -> impl IntoResponse {
        fake.seen.lock().push((uri.to_string(), body));
        Json(json!({"config": "apiVersion: v1\nkind: Config\n"}))
    }

    /// Serves canned answers for the three bootstrap calls and records the
    /// request URIs and bodies it saw.
    async fn fake_harvester(login_status: StatusCode) -> (String, Seen) {
        let seen = Seen::default();
        let fake = Arc::new(Fake {
            login_status,
            seen: seen.clone(),
        });
        let app = Router::new()
            .route("/v3-public/localProviders/local", post(login))
            .route("/v3/users", post(change_password))
            .route("/v1/management.cattle.io.clusters/local", post(generate_kubeconfig))
            .with_state(fake);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn planned(api_url: &str, path: &Path, update_password: bool) -> Value {
        make_state(vec![
            ("api_url", string_value(api_url)),
            ("initial_password", string_value("admin")),
            ("password", string_value("s3cret-pass")),
            ("kubeconfig_path", string_value(path.to_string_lossy())),
            ("should_update_password", bool_value(update_password)),
        ])
    }

    #[tokio::test]
    async fn test_bootstrap_writes_kubeconfig() {
        let (url, seen) = fake_harvester(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("harvester.yaml");

        let state = BootstrapResource
            .create(&planned(&url, &path, true))
            .await
            .unwrap();
        assert_eq!(get_string_attr(&state, "id"), url);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "apiVersion: v1\nkind: Config\n"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].1.contains(r#""password":"admin""#));
        assert!(seen[1].0.contains("changepassword"));
        assert!(seen[1].1.contains(r#""newPassword":"s3cret-pass""#));
        assert!(seen[2].0.contains("generateKubeconfig"));

        assert!(BootstrapResource.read(&state).await.unwrap().is_some());
        std::fs::remove_file(&path).unwrap();
        assert!(BootstrapResource.read(&state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_with_final_password() {
        let (url, seen) = fake_harvester(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");

        BootstrapResource
            .create(&planned(&url, &path, false))
            .await
            .unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].1.contains(r#""password":"s3cret-pass""#));
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (url, _) = fake_harvester(StatusCode::UNAUTHORIZED).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");

        let err = BootstrapResource
            .create(&planned(&url, &path, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(ref msg) if msg.contains("401")));
        assert!(!path.exists());
    }
}
