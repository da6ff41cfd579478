//! Configuration for the coordinator daemon: a YAML-declared seed of the
//! engines, hosts, templates and tags the out-of-scope persistent store
//! would otherwise hold (spec §6's "external web layer... database
//! migrations, templates-tag-CRUD" are out of scope for this core, but
//! *something* has to get that data into the `Store` for the coordinator
//! to drive reservations against — this is that something).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{Engine, Host, ResourceMap, Template};
use crate::store::Store;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SeedConfig {
    pub engine_types: Vec<String>,
    pub tags: Vec<String>,
    pub hosts: Vec<HostSeed>,
    pub templates: Vec<TemplateSeed>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HostSeed {
    pub name: String,
    pub ip_address: String,
    pub engines: Vec<EngineSeed>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineSeed {
    pub name: String,
    pub port: u16,
    pub engine_type: String,
    pub max_resources: ResourceMap,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TemplateSeed {
    pub name: String,
    pub internal_name: String,
    #[serde(default)]
    pub description: String,
    pub allowed_engine_types: Vec<String>,
    pub tags: Vec<String>,
    pub resource_requirements: ResourceMap,
}

impl SeedConfig {
    /// Loads the seed from `path`, falling back to an empty seed if the
    /// file doesn't exist — a coordinator with nothing seeded simply never
    /// approves anything, which is a safe default rather than a hard
    /// startup error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| "failed to parse config file")
    }

    /// A small demo fleet for `--dev`: one engine type, one engine with
    /// generous capacity, one template requiring a "windows" tag.
    pub fn demo() -> Self {
        Self {
            engine_types: vec!["proxmox".to_string()],
            tags: vec!["windows".to_string(), "gpu".to_string()],
            hosts: vec![HostSeed {
                name: "dev-host".to_string(),
                ip_address: "127.0.0.1".to_string(),
                engines: vec![EngineSeed {
                    name: "dev-engine".to_string(),
                    port: 5000,
                    engine_type: "proxmox".to_string(),
                    max_resources: ResourceMap::from([("cpu".to_string(), 16), ("ram".to_string(), 32)]),
                }],
            }],
            templates: vec![TemplateSeed {
                name: "Windows 10 Dev".to_string(),
                internal_name: "win10-dev-template".to_string(),
                description: "Demo Windows 10 workstation".to_string(),
                allowed_engine_types: vec!["proxmox".to_string()],
                tags: vec!["windows".to_string()],
                resource_requirements: ResourceMap::from([("cpu".to_string(), 4), ("ram".to_string(), 8)]),
            }],
        }
    }

    /// Applies this seed to `store`, resolving the human-readable names
    /// above into the UUIDs the data model actually keys on.
    pub async fn apply(&self, store: &Arc<dyn Store>) -> Result<()> {
        let mut engine_type_ids = HashMap::new();
        for name in &self.engine_types {
            let et = store.create_engine_type(name).await;
            engine_type_ids.insert(name.clone(), et.id);
        }

        let mut tag_ids = HashMap::new();
        for name in &self.tags {
            let tag = store.create_tag(name).await;
            tag_ids.insert(name.clone(), tag.id);
        }

        for host in &self.hosts {
            let mut engine_ids = Vec::new();
            for engine in &host.engines {
                let engine_type = *engine_type_ids
                    .get(&engine.engine_type)
                    .with_context(|| format!("engine '{}' references unknown engine_type '{}'", engine.name, engine.engine_type))?;
                let id = store
                    .create_engine(Engine {
                        id: uuid::Uuid::new_v4(),
                        name: engine.name.clone(),
                        port: engine.port,
                        engine_type,
                        available_resources: engine.max_resources.clone(),
                        max_resources: engine.max_resources.clone(),
                    })
                    .await;
                engine_ids.push(id);
            }

            store
                .create_host(Host {
                    id: uuid::Uuid::new_v4(),
                    name: host.name.clone(),
                    ip_address: host.ip_address.clone(),
                    engines: engine_ids.into_iter().collect(),
                })
                .await;
        }

        for template in &self.templates {
            let allowed_engine_types = template
                .allowed_engine_types
                .iter()
                .map(|name| {
                    engine_type_ids
                        .get(name)
                        .copied()
                        .with_context(|| format!("template '{}' references unknown engine_type '{name}'", template.name))
                })
                .collect::<Result<_>>()?;
            let tags = template
                .tags
                .iter()
                .map(|name| {
                    tag_ids
                        .get(name)
                        .copied()
                        .with_context(|| format!("template '{}' references unknown tag '{name}'", template.name))
                })
                .collect::<Result<_>>()?;

            store
                .create_template(Template {
                    id: uuid::Uuid::new_v4(),
                    name: template.name.clone(),
                    internal_name: template.internal_name.clone(),
                    description: template.description.clone(),
                    allowed_engine_types,
                    tags,
                    resource_requirements: template.resource_requirements.clone(),
                })
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn demo_seed_applies_without_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        SeedConfig::demo().apply(&store).await.unwrap();

        assert_eq!(store.list_engines().await.len(), 1);
        assert_eq!(store.list_templates().await.len(), 1);
        assert_eq!(store.list_tags().await.len(), 2);
    }

    #[test]
    fn missing_config_file_yields_empty_seed() {
        let seed = SeedConfig::load("/nonexistent/path/coordinator.yaml").unwrap();
        assert!(seed.engine_types.is_empty());
    }
}
