//! Docker Engine API client
//!
//! Talks HTTP/1.1 to the daemon over its Unix domain socket.

use std::path::PathBuf;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::api::{
    ContainerCreate, ErrorMessage, ExecCreate, ExecInspect, ExecStart, IdResponse,
};

/// Default daemon socket
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Error type for Docker API calls
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Docker API error on {endpoint}: {status} - {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl DockerError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DockerError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn transport(
        endpoint: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DockerError::Transport {
            endpoint: endpoint.to_string(),
            source: Box::new(source),
        }
    }
}

/// Client for the Docker Engine API
pub struct DockerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl DockerClient {
    /// Create a client for the daemon listening on `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Send a request and fail on non-success statuses
    async fn send<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<Response<Incoming>, DockerError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let payload = match body {
            Some(body) => Bytes::from(
                serde_json::to_vec(body).map_err(|e| DockerError::transport(endpoint, e))?,
            ),
            None => Bytes::new(),
        };

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| DockerError::transport(endpoint, e))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| DockerError::transport(endpoint, e))?;
        let status = res.status();

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(res);
        }

        let body_bytes = collect(endpoint, res).await?;
        let message = serde_json::from_slice::<ErrorMessage>(&body_bytes)
            .map(|m| m.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body_bytes).trim().to_string());
        Err(DockerError::Api {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&T>,
    ) -> Result<R, DockerError> {
        let res = self.send(method, endpoint, body).await?;
        let bytes = collect(endpoint, res).await?;
        serde_json::from_slice(&bytes).map_err(|e| DockerError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn send_empty(&self, method: Method, endpoint: &str) -> Result<(), DockerError> {
        let res = self.send::<()>(method, endpoint, None).await?;
        collect(endpoint, res).await?;
        Ok(())
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.send_empty(Method::GET, "/_ping").await
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        match self
            .send_empty(Method::GET, &format!("/images/{}/json", image))
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.status() == Some(404) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pull an image, waiting for the progress stream to finish
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let (name, tag) = split_image(image);
        self.send_empty(
            Method::POST,
            &format!("/images/create?fromImage={}&tag={}", name, tag),
        )
        .await
    }

    /// Create a container and return its id
    pub async fn create_container(
        &self,
        name: &str,
        spec: &ContainerCreate,
    ) -> Result<String, DockerError> {
        let created: IdResponse = self
            .send_json(
                Method::POST,
                &format!("/containers/create?name={}", name),
                Some(spec),
            )
            .await?;
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.send_empty(Method::POST, &format!("/containers/{}/start", id))
            .await
    }

    /// Force-remove a container and its anonymous volumes; missing is fine
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        match self
            .send_empty(
                Method::DELETE,
                &format!("/containers/{}?force=true&v=true", id),
            )
            .await
        {
            Err(e) if e.status() == Some(404) => Ok(()),
            other => other,
        }
    }

    pub async fn create_exec(
        &self,
        container: &str,
        spec: &ExecCreate,
    ) -> Result<String, DockerError> {
        let created: IdResponse = self
            .send_json(
                Method::POST,
                &format!("/containers/{}/exec", container),
                Some(spec),
            )
            .await?;
        Ok(created.id)
    }

    /// Start an exec and return its multiplexed output stream
    pub async fn start_exec(&self, exec_id: &str) -> Result<Incoming, DockerError> {
        let res = self
            .send(
                Method::POST,
                &format!("/exec/{}/start", exec_id),
                Some(&ExecStart {
                    detach: false,
                    tty: false,
                }),
            )
            .await?;
        Ok(res.into_body())
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, DockerError> {
        self.send_json::<(), _>(Method::GET, &format!("/exec/{}/json", exec_id), None)
            .await
    }
}

async fn collect(endpoint: &str, res: Response<Incoming>) -> Result<Bytes, DockerError> {
    Ok(res
        .into_body()
        .collect()
        .await
        .map_err(|e| DockerError::transport(endpoint, e))?
        .to_bytes())
}

/// Split `name[:tag]`, ignoring colons that belong to a registry port
pub fn split_image(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(colon) if !image[colon..].contains('/') => (&image[..colon], &image[colon + 1..]),
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("python:3.10-slim"), ("python", "3.10-slim"));
        assert_eq!(split_image("python"), ("python", "latest"));
        assert_eq!(
            split_image("registry:5000/team/python"),
            ("registry:5000/team/python", "latest")
        );
        assert_eq!(
            split_image("registry:5000/python:3.12"),
            ("registry:5000/python", "3.12")
        );
    }

    #[test]
    fn test_api_error_status() {
        let err = DockerError::Api {
            endpoint: "/x".to_string(),
            status: 404,
            message: "no such container".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "Docker API error on /x: 404 - no such container");
    }
}
