//! Registry credential resolution from Kubernetes pull secrets
//!
//! A pull secret may hold credentials for several registries
//! (`kubernetes.io/dockerconfigjson`, or the legacy `.dockercfg` shape);
//! only the entries matching the target registry host apply. Candidates
//! are returned in a stable order and tried in that order by the pull
//! path.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;

use kindling_common::{Error, Result};

/// Secret data key for `kubernetes.io/dockerconfigjson` secrets
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Secret data key for legacy `kubernetes.io/dockercfg` secrets
const DOCKER_CFG_KEY: &str = ".dockercfg";

/// One username/password candidate for a registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryAuth {
    /// Registry account name
    pub username: String,
    /// Registry account password or token
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// base64 of `username:password`, takes effect when the split fields
    /// are absent
    #[serde(default)]
    auth: Option<String>,
}

/// Resolve the ordered credential candidates `secret` holds for `registry`.
///
/// Returns an empty list when the secret holds no entry for the registry
/// (the caller falls back to an anonymous pull); returns an error only
/// when the secret payload itself cannot be decoded.
pub fn registry_auths(secret: &Secret, registry: &str) -> Result<Vec<RegistryAuth>> {
    let secret_name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");
    let Some(data) = secret.data.as_ref() else {
        return Ok(Vec::new());
    };

    let auths: BTreeMap<String, DockerAuthEntry> = if let Some(raw) = data.get(DOCKER_CONFIG_JSON_KEY)
    {
        serde_json::from_slice::<DockerConfigJson>(&raw.0)
            .map_err(|e| Error::credential(secret_name, format!("invalid dockerconfigjson: {}", e)))?
            .auths
    } else if let Some(raw) = data.get(DOCKER_CFG_KEY) {
        serde_json::from_slice(&raw.0)
            .map_err(|e| Error::credential(secret_name, format!("invalid dockercfg: {}", e)))?
    } else {
        return Err(Error::credential(
            secret_name,
            format!("no {} or {} key", DOCKER_CONFIG_JSON_KEY, DOCKER_CFG_KEY),
        ));
    };

    let mut candidates = Vec::new();
    for (host, entry) in &auths {
        if !host_matches(host, registry) {
            continue;
        }
        if let Some(auth) = decode_entry(secret_name, entry)? {
            candidates.push(auth);
        }
    }
    Ok(candidates)
}

/// Turn one auth entry into a candidate; split username/password fields
/// win over the packed `auth` field
fn decode_entry(secret_name: &str, entry: &DockerAuthEntry) -> Result<Option<RegistryAuth>> {
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some(RegistryAuth {
            username: username.clone(),
            password: password.clone(),
        }));
    }

    let Some(encoded) = &entry.auth else {
        return Ok(None);
    };
    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::credential(secret_name, format!("invalid auth field: {}", e)))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| Error::credential(secret_name, format!("invalid auth field: {}", e)))?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| Error::credential(secret_name, "auth field is not username:password"))?;
    Ok(Some(RegistryAuth {
        username: username.to_string(),
        password: password.to_string(),
    }))
}

/// Compare an auth entry's host key against the target registry, ignoring
/// scheme and path, with the docker-hub host aliases folded together
fn host_matches(entry_host: &str, registry: &str) -> bool {
    normalize_host(entry_host) == normalize_host(registry)
}

fn normalize_host(host: &str) -> &str {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        other => other,
    }
}
