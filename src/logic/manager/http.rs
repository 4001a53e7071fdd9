//! HTTP Manager Client
//!
//! Blocking `ureq` client for the manager REST API, authenticated with a
//! bearer key.

use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

use serde::de::DeserializeOwned;

use super::{FileUpload, ManagerClient, ManagerError};
use crate::logic::commands::Command;
use crate::logic::config::ManagerConfig;

pub struct HttpManagerClient {
    base_url: String,
    key: String,
    hostname: String,
    ip: Option<IpAddr>,
    agent: ureq::Agent,
}

impl HttpManagerClient {
    pub fn new(config: &ManagerConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();

        let ip = config
            .ip
            .parse::<IpAddr>()
            .ok()
            .or_else(|| resolve_host(&config.url));

        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            key: config.key.clone(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            ip,
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        self.agent
            .request(method, &self.url(path))
            .set("Authorization", &format!("Bearer {}", self.key))
            .set("X-Agent-Hostname", &self.hostname)
    }

    fn get_string(&self, path: &str) -> Result<String, ManagerError> {
        let response = self.request("GET", path).call().map_err(map_ureq_error)?;
        response
            .into_string()
            .map_err(|e| ManagerError::ParseError(e.to_string()))
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ManagerError> {
        let body = self.get_string(path)?;
        serde_json::from_str(&body).map_err(|e| ManagerError::ParseError(e.to_string()))
    }

    fn post_string(&self, path: &str, content_type: &str, body: &str) -> Result<(), ManagerError> {
        self.request("POST", path)
            .set("Content-Type", content_type)
            .send_string(body)
            .map_err(map_ureq_error)?;
        Ok(())
    }
}

impl ManagerClient for HttpManagerClient {
    fn is_local(&self) -> bool {
        false
    }

    fn manager_ip(&self) -> Option<IpAddr> {
        self.ip
    }

    fn rules_sha256(&self) -> Result<String, ManagerError> {
        Ok(self.get_string("/rules/sha256")?.trim().to_string())
    }

    fn rules(&self) -> Result<String, ManagerError> {
        self.get_string("/rules")
    }

    fn containers_list(&self) -> Result<Vec<String>, ManagerError> {
        self.get_json("/containers")
    }

    fn container_sha256(&self, name: &str) -> Result<String, ManagerError> {
        Ok(self
            .get_string(&format!("/containers/{}/sha256", name))?
            .trim()
            .to_string())
    }

    fn container(&self, name: &str) -> Result<Vec<String>, ManagerError> {
        self.get_json(&format!("/containers/{}", name))
    }

    fn fetch_command(&self) -> Result<Option<Command>, ManagerError> {
        let body = self.get_string("/command")?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ManagerError::ParseError(e.to_string()))
    }

    fn post_command(&self, command: &Command) -> Result<(), ManagerError> {
        let body =
            serde_json::to_string(command).map_err(|e| ManagerError::ParseError(e.to_string()))?;
        self.post_string("/command", "application/json", &body)
    }

    fn post_dump(&self, upload: &FileUpload) -> Result<(), ManagerError> {
        self.request("POST", "/dump")
            .query("guid", &upload.guid)
            .query("event_hash", &upload.event_hash)
            .query("filename", &upload.filename)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(&upload.content)
            .map_err(map_ureq_error)?;
        Ok(())
    }

    fn post_logs(&self, events: &[String]) -> Result<(), ManagerError> {
        self.post_string("/logs", "application/x-ndjson", &events.join("\n"))
    }
}

fn map_ureq_error(e: ureq::Error) -> ManagerError {
    match e {
        ureq::Error::Status(code, _) => ManagerError::ServerError(code),
        ureq::Error::Transport(t) => ManagerError::NetworkError(t.to_string()),
    }
}

/// Host part of a URL (`https://host:port/path`)
fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, r)| r);
    let authority = rest.split('/').next()?;
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next()?,
        None => authority.split(':').next()?,
    };
    (!host.is_empty()).then_some(host)
}

fn resolve_host(url: &str) -> Option<IpAddr> {
    let host = url_host(url)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
}
