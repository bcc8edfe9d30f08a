//! JSON-over-HTTP [`ApiClient`].
//!
//! Objects live at `{base_url}/{collection}/{id}`: `GET` fetches one,
//! `PATCH` applies a partial update and returns the updated object.

use std::marker::PhantomData;

use async_trait::async_trait;
use reconcile_core::Resource;
use reqwest::{StatusCode, Url};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::traits::{ApiClient, ObjectPatch};

/// HTTP client for objects of kind `T`.
#[derive(Debug)]
pub struct HttpApiClient<T> {
    client: reqwest::Client,
    base_url: Url,
    collection: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for HttpApiClient<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            collection: self.collection.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> HttpApiClient<T> {
    /// Builds a client with its own connection pool and request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unavailable`] if the base URL is invalid, or
    /// [`ApiError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Self::with_client(client, &config.base_url)
    }

    /// Builds a client on a shared `reqwest::Client`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unavailable`] if `base_url` is not an absolute
    /// URL that can carry path segments.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::Unavailable(format!("invalid API base URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Unavailable(format!(
                "API base URL {base_url} cannot carry a path"
            )));
        }
        Ok(Self {
            client,
            base_url,
            collection: T::collection(),
            _marker: PhantomData,
        })
    }

    /// Overrides the collection path segment.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    fn object_url(&self, id: &str) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::Unavailable(format!("API base URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(&self.collection)
            .push(id);
        Ok(url)
    }

    async fn read_object(response: reqwest::Response, id: &str) -> Result<T, ApiError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound { id: id.to_string() });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl<T: Resource> ApiClient<T> for HttpApiClient<T> {
    async fn get_by_id(&self, id: &str) -> Result<T, ApiError> {
        let url = self.object_url(id)?;
        tracing::trace!(%url, "fetching object");
        let response = self.client.get(url).send().await?;
        Self::read_object(response, id).await
    }

    async fn update(&self, id: &str, patch: &ObjectPatch) -> Result<T, ApiError> {
        let url = self.object_url(id)?;
        tracing::trace!(%url, ?patch, "patching object");
        let response = self.client.patch(url).json(patch).send().await?;
        Self::read_object(response, id).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Network {
        id: u64,
        name: String,
        #[serde(default)]
        reconciled: bool,
    }

    impl Resource for Network {
        const KIND: &'static str = "Network";

        fn id(&self) -> String {
            self.id.to_string()
        }
    }

    type Objects = Arc<Mutex<HashMap<String, Network>>>;

    async fn get_network(
        State(objects): State<Objects>,
        Path(id): Path<String>,
    ) -> Result<Json<Network>, AxumStatus> {
        objects
            .lock()
            .get(&id)
            .cloned()
            .map(Json)
            .ok_or(AxumStatus::NOT_FOUND)
    }

    async fn patch_network(
        State(objects): State<Objects>,
        Path(id): Path<String>,
        Json(patch): Json<serde_json::Value>,
    ) -> Result<Json<Network>, AxumStatus> {
        if id == "500" {
            return Err(AxumStatus::INTERNAL_SERVER_ERROR);
        }
        let mut objects = objects.lock();
        let network = objects.get_mut(&id).ok_or(AxumStatus::NOT_FOUND)?;
        if let Some(flag) = patch.get("reconciled").and_then(serde_json::Value::as_bool) {
            network.reconciled = flag;
        }
        Ok(Json(network.clone()))
    }

    async fn serve(objects: Objects) -> String {
        let app = Router::new()
            .route("/networks/{id}", get(get_network).patch(patch_network))
            .with_state(objects);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn seeded() -> Objects {
        let mut objects = HashMap::new();
        objects.insert(
            "7".to_string(),
            Network {
                id: 7,
                name: "edge".to_string(),
                reconciled: false,
            },
        );
        Arc::new(Mutex::new(objects))
    }

    #[tokio::test]
    async fn get_by_id_fetches_object() {
        let base = serve(seeded()).await;
        let client = HttpApiClient::<Network>::new(&ApiConfig {
            base_url: base,
            ..ApiConfig::default()
        })
        .unwrap();

        let network = client.get_by_id("7").await.unwrap();
        assert_eq!(network.name, "edge");
        assert!(!network.reconciled);
    }

    #[tokio::test]
    async fn missing_object_maps_to_not_found() {
        let base = serve(seeded()).await;
        let client = HttpApiClient::<Network>::with_client(reqwest::Client::new(), &base).unwrap();

        let err = client.get_by_id("9").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_patches_reconciled_flag() {
        let objects = seeded();
        let base = serve(Arc::clone(&objects)).await;
        let client = HttpApiClient::<Network>::with_client(reqwest::Client::new(), &base).unwrap();

        let updated = client.update("7", &ObjectPatch::reconciled()).await.unwrap();
        assert!(updated.reconciled);
        assert!(objects.lock()["7"].reconciled);
    }

    #[tokio::test]
    async fn server_error_maps_to_status() {
        let base = serve(seeded()).await;
        let client = HttpApiClient::<Network>::with_client(reqwest::Client::new(), &base).unwrap();

        let err = client
            .update("500", &ObjectPatch::reconciled())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));
    }

    #[test]
    fn object_url_joins_collection_and_id() {
        let client =
            HttpApiClient::<Network>::with_client(reqwest::Client::new(), "http://api:8080/v1/")
                .unwrap();
        assert_eq!(
            client.object_url("7").unwrap().as_str(),
            "http://api:8080/v1/networks/7"
        );

        let custom = client.with_collection("nets");
        assert_eq!(
            custom.object_url("a b").unwrap().as_str(),
            "http://api:8080/v1/nets/a%20b"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = HttpApiClient::<Network>::with_client(reqwest::Client::new(), "not a url")
            .unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
    }
}
